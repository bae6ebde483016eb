//! Fault injection shared by the simulated devices.

use std::collections::HashMap;

use parking_lot::Mutex;

/// How a simulated device misbehaves for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Raise an error instead of executing.
    Reject,
    /// Accept, then end in obsState `FAULT` instead of the terminal state.
    ObsFault,
    /// Accept and never leave the transitional state.
    Stall,
}

/// Faults armed per command name. Faults stay armed until cleared.
#[derive(Debug, Default)]
pub struct FaultTable {
    armed: Mutex<HashMap<String, Fault>>,
}

impl FaultTable {
    /// Arm `fault` for `command`.
    pub fn arm(&self, command: &str, fault: Fault) {
        self.armed.lock().insert(command.to_owned(), fault);
    }

    /// Disarm every fault.
    pub fn clear(&self) {
        self.armed.lock().clear();
    }

    /// Fault armed for `command`.
    #[must_use]
    pub fn get(&self, command: &str) -> Option<Fault> {
        self.armed.lock().get(command).copied()
    }
}
