//! Circuit breaker for generation providers

use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Provider is skipped
    Open,
    /// One trial request is allowed through; others are still skipped
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Tracks consecutive failures of one provider
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    /// Consecutive failures while closed
    failure_count: u32,
    failure_threshold: u32,
    opened_at: Option<Instant>,
    /// How long to stay open before allowing a trial
    open_for: Duration,
    /// Start of the trial in flight while half-open
    trial_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_for: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            opened_at: None,
            open_for,
            trial_started: None,
        }
    }

    /// Record a failed call
    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.open();
                }
            }
            // Failed trial reopens
            CircuitState::HalfOpen => self.open(),
            CircuitState::Open => {}
        }
    }

    /// Record a successful call
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => self.close(),
            CircuitState::Open => {}
        }
    }

    /// Whether a call should be rejected.
    ///
    /// Once the open period ends the first caller gets the trial and the
    /// circuit turns half-open. Later callers are rejected until the trial
    /// is recorded. A trial that never reports back expires after `open_for`.
    pub fn is_open(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .map_or(true, |opened_at| opened_at.elapsed() >= self.open_for);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.trial_started = Some(Instant::now());
                }
                !cooled
            }
            CircuitState::HalfOpen => {
                let trial_lost = self
                    .trial_started
                    .map_or(true, |started| started.elapsed() >= self.open_for);
                if trial_lost {
                    self.trial_started = Some(Instant::now());
                }
                !trial_lost
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.failure_count = 0;
        self.trial_started = None;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.trial_started = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
    }

    #[test]
    fn test_half_open_trial_closes_on_success() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        assert!(cb.is_open());

        std::thread::sleep(Duration::from_millis(20));
        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_a_single_trial() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(50));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(60));

        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.is_open());
        assert!(cb.is_open());

        cb.record_success();
        assert!(!cb.is_open());
        assert!(!cb.is_open());
    }

    #[test]
    fn test_lost_trial_expires() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cb.is_open());
        assert!(cb.is_open());

        // Trial caller never reported back
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_trial_reopens_on_failure() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cb.is_open());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(60));
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
