//! Single-shot timers owned by the subarray state.

use std::time::Duration;

use tmc_core::events::{EventSender, TimerKind};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One armed-or-idle timer. Re-arming disarms the previous one, and
/// cancelling an idle timer is a no-op.
#[derive(Debug)]
pub struct OneShot {
    kind: TimerKind,
    token: Option<CancellationToken>,
}

impl OneShot {
    /// Create an idle timer of `kind`.
    #[must_use]
    pub const fn new(kind: TimerKind) -> Self {
        Self { kind, token: None }
    }

    /// Fire a `Timer` event for `generation` on `sender` after `after`.
    pub fn arm(&mut self, sender: &EventSender, generation: u64, after: Duration) {
        self.cancel();
        let token = CancellationToken::new();
        sender.arm_timer(self.kind, generation, after, token.clone());
        debug!(kind = ?self.kind, generation, after_ms = after.as_millis(), "timer armed");
        self.token = Some(token);
    }

    /// Disarm. Returns `true` when the timer was armed.
    pub fn cancel(&mut self) -> bool {
        match self.token.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the timer is armed.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.token.is_some()
    }
}

impl Drop for OneShot {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Duration in seconds from a payload, ignoring non-positive values.
#[must_use]
pub fn from_seconds(seconds: Option<f64>) -> Option<Duration> {
    seconds
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(Duration::from_secs_f64)
}
