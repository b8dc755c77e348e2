use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{BalancerError, Result};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen,
}

/// Three-state gate guarding dispatch. The mutex covers only state
/// inspection and update; the guarded operation always runs outside it:
/// callers take a permit with `try_acquire`, run the operation, then report
/// the outcome with `record_success` / `record_failure`.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<State>,
    threshold: u32,
    timeout: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_TIMEOUT)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::Closed { failures: 0 }),
            threshold,
            timeout,
        }
    }

    /// Decide up front whether a call may proceed. In Open, the cool-off
    /// expiring transitions to HalfOpen and admits the call as a trial.
    pub fn try_acquire(&self) -> Result<()> {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");

        match *state {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open { opened_at } => {
                if opened_at.elapsed() < self.timeout {
                    Err(BalancerError::CircuitOpen)
                } else {
                    debug!("circuit breaker cool-off elapsed, entering half-open");
                    *state = State::HalfOpen;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");

        match *state {
            State::Closed { failures } if failures > 0 => {
                *state = State::Closed { failures: 0 };
            }
            State::HalfOpen => {
                debug!("circuit breaker trial succeeded, closing");
                *state = State::Closed { failures: 0 };
            }
            _ => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");

        match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    warn!(failures, "circuit breaker tripped open");
                    *state = State::Open {
                        opened_at: Instant::now(),
                    };
                } else {
                    *state = State::Closed { failures };
                }
            }
            State::HalfOpen => {
                warn!("circuit breaker trial failed, reopening");
                *state = State::Open {
                    opened_at: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.state.lock().expect("circuit breaker mutex poisoned") {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen => BreakerState::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));

        for _ in 0..2 {
            breaker.try_acquire().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(matches!(
            breaker.try_acquire(),
            Err(BalancerError::CircuitOpen)
        ));
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_trial_closes_on_success() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(30));
        breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_trial_reopens_on_failure() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        breaker.try_acquire().unwrap();

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());
    }
}
