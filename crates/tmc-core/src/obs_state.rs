//! Observation state machine and command admission table.
//!
//! Admission is data: each command carries the set of power states and
//! observation states it is allowed in. A composite command moves the machine
//! into a transitional state and records the terminal state it expects the
//! children to reach. The machine never talks to children itself; the owning
//! device feeds it aggregated observations.
//!
//! ```text
//! EMPTY|IDLE    --AssignResources--> RESOURCING  --> IDLE
//! IDLE          --ReleaseResources-> RESOURCING  --> EMPTY
//! IDLE|READY    --Configure-->       CONFIGURING --> READY
//! READY         --Scan-->            SCANNING    --> READY (EndScan)
//! READY         --End-->             READY       --> IDLE
//! non-terminal  --Abort-->           ABORTING    --> ABORTED
//! ABORTED|FAULT --ObsReset-->        RESETTING   --> IDLE
//! ABORTED|FAULT --Restart-->         RESTARTING  --> EMPTY
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{TmcError, TmcResult};
use crate::types::{ObsState, OpState};

/// Commands understood by subarray-level devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObsCommand {
    /// Power on.
    On,
    /// Power off.
    Off,
    /// Go to standby.
    Standby,
    /// Allocate resources.
    AssignResources,
    /// Release every allocated resource.
    ReleaseResources,
    /// Configure a scan.
    Configure,
    /// Start a scan.
    Scan,
    /// Stop the running scan.
    EndScan,
    /// Drop the scan configuration.
    End,
    /// Abort whatever is in progress.
    Abort,
    /// Recover to IDLE keeping resources.
    ObsReset,
    /// Recover to EMPTY releasing resources.
    Restart,
}

impl ObsCommand {
    /// All commands.
    pub const ALL: &'static [Self] = &[
        Self::On,
        Self::Off,
        Self::Standby,
        Self::AssignResources,
        Self::ReleaseResources,
        Self::Configure,
        Self::Scan,
        Self::EndScan,
        Self::End,
        Self::Abort,
        Self::ObsReset,
        Self::Restart,
    ];

    /// Command name on the wire.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::On => "On",
            Self::Off => "Off",
            Self::Standby => "Standby",
            Self::AssignResources => "AssignResources",
            Self::ReleaseResources => "ReleaseAllResources",
            Self::Configure => "Configure",
            Self::Scan => "Scan",
            Self::EndScan => "EndScan",
            Self::End => "End",
            Self::Abort => "Abort",
            Self::ObsReset => "ObsReset",
            Self::Restart => "Restart",
        }
    }

    /// Whether the command is subject to the observation state table.
    #[must_use]
    pub const fn is_observation(self) -> bool {
        !matches!(self, Self::On | Self::Off | Self::Standby)
    }

    /// Power states in which the command is admitted.
    #[must_use]
    pub const fn allowed_op_states(self) -> &'static [OpState] {
        match self {
            Self::On => &[OpState::Off, OpState::Standby],
            Self::Off => &[OpState::On, OpState::Standby, OpState::Fault, OpState::Alarm],
            Self::Standby => &[OpState::On, OpState::Off],
            _ => &[OpState::On],
        }
    }

    /// Observation states in which the command is admitted. Power commands
    /// are admitted in any observation state.
    #[must_use]
    pub const fn allowed_obs_states(self) -> &'static [ObsState] {
        use ObsState::{Aborted, Configuring, Empty, Fault, Idle, Ready, Resetting, Scanning};
        match self {
            Self::On | Self::Off | Self::Standby => ObsState::ALL,
            Self::AssignResources => &[Empty, Idle],
            Self::ReleaseResources => &[Idle],
            Self::Configure => &[Idle, Ready],
            Self::Scan => &[Ready],
            Self::EndScan => &[Scanning, Ready],
            Self::End => &[Ready],
            Self::Abort => &[Idle, Configuring, Ready, Scanning, Resetting],
            Self::ObsReset | Self::Restart => &[Aborted, Fault],
        }
    }

    /// The transition this command starts from `from`, or `None` when the
    /// command is a no-op in that state.
    #[must_use]
    pub const fn transition(self, from: ObsState) -> Option<Transition> {
        use ObsState::{
            Aborted, Aborting, Configuring, Empty, Idle, Ready, Resetting, Resourcing, Restarting,
            Scanning,
        };
        let (entered, expected) = match self {
            Self::On | Self::Off | Self::Standby => return None,
            Self::AssignResources => (Resourcing, Idle),
            Self::ReleaseResources => (Resourcing, Empty),
            Self::Configure => (Configuring, Ready),
            Self::Scan => (Scanning, Scanning),
            Self::EndScan => match from {
                Scanning => (Scanning, Ready),
                _ => return None,
            },
            Self::End => (from, Idle),
            Self::Abort => (Aborting, Aborted),
            Self::ObsReset => (Resetting, Idle),
            Self::Restart => (Restarting, Empty),
        };
        Some(Transition { entered, expected })
    }
}

impl fmt::Display for ObsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ObsCommand {
    type Err = TmcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "ReleaseResources" {
            return Ok(Self::ReleaseResources);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| TmcError::invalid_payload(format!("unknown command: {s}")))
    }
}

/// State entered on admission and the terminal state that resolves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State published when the command is admitted.
    pub entered: ObsState,
    /// Aggregated child state that completes the command.
    pub expected: ObsState,
}

/// Check a command against the admission table.
///
/// # Errors
///
/// Returns `NotAllowedInState` when `(op, obs)` is outside the table.
pub fn admit(command: ObsCommand, op: OpState, obs: ObsState) -> TmcResult<()> {
    if !command.allowed_op_states().contains(&op) {
        return Err(TmcError::not_allowed(command.name(), op));
    }
    if command.is_observation() && !command.allowed_obs_states().contains(&obs) {
        return Err(TmcError::not_allowed(command.name(), format!("{op}/{obs}")));
    }
    Ok(())
}

/// A composite command waiting for its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand {
    /// The command.
    pub command: ObsCommand,
    /// State that resolves it.
    pub expected: ObsState,
    /// Generation the command was started in.
    pub generation: u64,
    /// State the machine was in before the command.
    pub previous: ObsState,
}

/// What [`ObsStateMachine::begin`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Started {
    /// A transition started; children must be driven.
    Pending(PendingCommand),
    /// The command is a no-op in the current state.
    NoOp,
}

/// Observation state of one device plus its pending command.
#[derive(Debug, Clone)]
pub struct ObsStateMachine {
    state: ObsState,
    pending: Option<PendingCommand>,
    generation: u64,
}

impl Default for ObsStateMachine {
    fn default() -> Self {
        Self::new(ObsState::Empty)
    }
}

impl ObsStateMachine {
    /// Create a machine in `state`.
    #[must_use]
    pub const fn new(state: ObsState) -> Self {
        Self {
            state,
            pending: None,
            generation: 0,
        }
    }

    /// Current observation state.
    #[must_use]
    pub const fn state(&self) -> ObsState {
        self.state
    }

    /// Pending command, if any.
    #[must_use]
    pub const fn pending(&self) -> Option<PendingCommand> {
        self.pending
    }

    /// Generation of the most recently started command.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Admission check including the pending-command rule: while a command
    /// waits for its children only `Abort` is admitted, plus `EndScan` while
    /// a `Scan` is pending.
    ///
    /// # Errors
    ///
    /// Returns `NotAllowedInState` when the command is not admitted.
    pub fn admit(&self, command: ObsCommand, op: OpState) -> TmcResult<()> {
        admit(command, op, self.state)?;
        match self.pending {
            Some(pending)
                if command.is_observation()
                    && command != ObsCommand::Abort
                    && !(command == ObsCommand::EndScan
                        && pending.command == ObsCommand::Scan) =>
            {
                Err(TmcError::not_allowed(
                    command.name(),
                    format!("{op}/{} ({} in progress)", self.state, pending.command),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Start an admitted command. Any pending command is replaced.
    pub fn begin(&mut self, command: ObsCommand) -> Started {
        let Some(transition) = command.transition(self.state) else {
            return Started::NoOp;
        };
        self.generation += 1;
        let pending = PendingCommand {
            command,
            expected: transition.expected,
            generation: self.generation,
            previous: self.state,
        };
        self.state = transition.entered;
        self.pending = Some(pending);
        Started::Pending(pending)
    }

    /// Feed the aggregated child state. Returns the completed command when it
    /// matches the expected terminal.
    pub fn observe(&mut self, aggregated: ObsState) -> Option<PendingCommand> {
        let pending = self.pending?;
        if aggregated != pending.expected {
            return None;
        }
        self.state = pending.expected;
        self.pending = None;
        Some(pending)
    }

    /// Fail the pending command (if any) and enter `FAULT`.
    pub fn fault(&mut self) -> Option<PendingCommand> {
        self.state = ObsState::Fault;
        self.pending.take()
    }

    /// Drop the pending command and return to `state` without completing it.
    pub fn reset_to(&mut self, state: ObsState) -> Option<PendingCommand> {
        self.state = state;
        self.pending.take()
    }
}
