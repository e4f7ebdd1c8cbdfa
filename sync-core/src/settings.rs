//! Network tuning knobs and reconnect backoff.

use std::time::Duration;

/// Network settings shared by the reconnect loop and leader election.
///
/// All values are non-negative; zero means "immediate" for delays and
/// "disabled" for the timeout of that role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSettings {
    /// Delay before the first reconnect attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub reconnect_backoff_multiplier: u32,
    /// Upper bound on the reconnect delay, in milliseconds.
    pub max_reconnect_delay_ms: u64,
    /// How long a candidate collects rival proposals before deciding.
    pub election_timeout_ms: u64,
    /// Interval between leader heartbeats; zero disables heartbeating.
    pub heartbeat_interval_ms: u64,
    /// Silence after which followers declare the leader dead; zero
    /// disables the watchdog.
    pub heartbeat_timeout_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            reconnect_backoff_multiplier: 2,
            max_reconnect_delay_ms: 30_000,
            election_timeout_ms: 200,
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 3_000,
        }
    }
}

impl NetworkSettings {
    /// Reconnect delay for the given attempt (1-based), with jitter.
    ///
    /// Base delay: `initial * multiplier^(attempt-1)`, capped at
    /// `max_reconnect_delay_ms`. Jitter of up to a quarter of the base
    /// is added so a fleet of clients does not reconnect in lockstep.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let mut base = self.initial_delay_ms;
        for _ in 1..attempt {
            base = base.saturating_mul(u64::from(self.reconnect_backoff_multiplier));
            if base >= self.max_reconnect_delay_ms {
                break;
            }
        }
        let base = base.min(self.max_reconnect_delay_ms);
        Duration::from_millis(base.saturating_add(random_jitter_ms(base / 4)))
    }
}

/// Uniform random jitter in `0..=bound` milliseconds.
fn random_jitter_ms(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    u64::from_le_bytes(bytes) % (bound + 1)
}
