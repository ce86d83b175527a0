use std::time::Duration;

/// Base wait between log upload attempts.
pub const DEFAULT_BASE_WAIT: Duration = Duration::from_secs(5);
/// Ceiling for the doubled wait after repeated failures.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(300);

/// Wait schedule for the telemetry uploader: doubles on every failure up to
/// `max_wait`, snaps back to `base_wait` on the first success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSchedule {
    base_wait: Duration,
    max_wait: Duration,
    current: Duration,
    consecutive_failures: u32,
}

impl Default for WaitSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_WAIT, DEFAULT_MAX_WAIT)
    }
}

impl WaitSchedule {
    pub fn new(base_wait: Duration, max_wait: Duration) -> Self {
        let max_wait = max_wait.max(base_wait);
        Self {
            base_wait,
            max_wait,
            current: base_wait,
            consecutive_failures: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.current = self.base_wait;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current = next_wait(self.current, self.max_wait);
        self.current
    }
}

fn next_wait(current: Duration, max_wait: Duration) -> Duration {
    if current.is_zero() {
        return max_wait.min(Duration::from_millis(1));
    }

    let mut next = current.saturating_mul(2);
    if next > max_wait {
        next = max_wait;
    }
    next
}
