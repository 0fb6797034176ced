use std::time::{Duration, Instant};

/// Tracks when a debounced action should run. Each new event replaces the
/// pending deadline, so the action fires once after the last event plus
/// `delay`.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    last_event: Option<Instant>,
    pending: bool,
}

impl Debouncer {
    /// Create a new debouncer with the specified delay in milliseconds
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            last_event: None,
            pending: false,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Register that an event occurred, cancelling any pending deadline
    pub fn trigger(&mut self) {
        self.trigger_at(Instant::now());
    }

    pub fn trigger_at(&mut self, now: Instant) {
        self.last_event = Some(now);
        self.pending = true;
    }

    /// True exactly once per burst of events, after the quiet period
    pub fn should_execute(&mut self) -> bool {
        self.should_execute_at(Instant::now())
    }

    pub fn should_execute_at(&mut self, now: Instant) -> bool {
        if !self.pending {
            return false;
        }

        if let Some(last) = self.last_event {
            if now.saturating_duration_since(last) >= self.delay {
                self.pending = false;
                self.last_event = None;
                return true;
            }
        }
        false
    }

    /// Time remaining before the action will trigger, None if idle
    pub fn time_remaining(&self) -> Option<Duration> {
        if !self.pending {
            return None;
        }

        self.last_event
            .map(|last| self.delay.saturating_sub(last.elapsed()))
    }

    /// Cancel any pending action
    pub fn reset(&mut self) {
        self.last_event = None;
        self.pending = false;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_after_quiet_period() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(300);
        debouncer.trigger_at(start);

        assert!(!debouncer.should_execute_at(start + Duration::from_millis(299)));
        assert!(debouncer.should_execute_at(start + Duration::from_millis(300)));
        assert!(!debouncer.should_execute_at(start + Duration::from_millis(900)));
    }

    #[test]
    fn test_retrigger_reschedules() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(500);
        debouncer.trigger_at(start);
        debouncer.trigger_at(start + Duration::from_millis(400));

        assert!(!debouncer.should_execute_at(start + Duration::from_millis(600)));
        assert!(debouncer.should_execute_at(start + Duration::from_millis(900)));
    }

    #[test]
    fn test_reset_cancels() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(10);
        debouncer.trigger_at(start);
        debouncer.reset();
        assert!(!debouncer.is_pending());
        assert!(!debouncer.should_execute_at(start + Duration::from_secs(1)));
        assert_eq!(debouncer.time_remaining(), None);
    }
}
