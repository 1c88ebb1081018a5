//! Circuit breaker for remote call sites.
//!
//! After `failure_threshold` consecutive failures the breaker opens and
//! rejects calls for the recovery window. The first caller after the window
//! elapses gets the single half-open trial: success closes the breaker,
//! failure reopens it. The open-check never blocks.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    /// Whether a call may proceed. Transitioning out of the open state grants
    /// exactly one half-open trial to the caller that observes the elapsed
    /// recovery window; concurrent callers keep getting rejected until the
    /// trial resolves.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= self.recovery {
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        *state = BreakerState::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        *state = match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    BreakerState::Open { since: Instant::now() }
                } else {
                    BreakerState::Closed { failures }
                }
            }
            // A failed half-open trial reopens for a full window.
            BreakerState::HalfOpen | BreakerState::Open { .. } => {
                BreakerState::Open { since: Instant::now() }
            }
        };
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock().unwrap(), BreakerState::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_allows_calls() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        assert!(breaker.try_acquire());
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            breaker.record_failure();
            assert!(breaker.try_acquire(), "breaker opened early");
        }
        breaker.record_failure();
        assert!(breaker.is_open());
        for _ in 0..10 {
            assert!(!breaker.try_acquire(), "open breaker let a call through");
        }
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_half_open_grants_single_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        breaker.record_failure();
        assert!(!breaker.try_acquire());

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.try_acquire(), "trial call after recovery window");
        assert!(!breaker.try_acquire(), "second concurrent trial allowed");
    }

    #[test]
    fn test_trial_success_closes() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.try_acquire());
        breaker.record_success();
        assert!(breaker.try_acquire());
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_trial_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert!(!breaker.try_acquire(), "reopened breaker must reject");
    }
}
