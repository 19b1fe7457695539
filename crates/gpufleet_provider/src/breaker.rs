//! Per-endpoint-group circuit breaker.
//!
//! Closed → (N consecutive failures) → Open → (cool-down elapses) →
//! HalfOpen → one trial call → Closed on success, Open again on failure.
//! In-process only; each process learns its own upstream health.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use gpufleet_core::error::FleetError;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before a half-open trial.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

pub struct CircuitBreaker {
    cfg: BreakerConfig,
    groups: Mutex<HashMap<&'static str, State>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Gate a call. `Err(CircuitOpen)` while cooling down; an elapsed
    /// cool-down admits exactly one half-open trial.
    pub fn check(&self, group: &'static str) -> Result<(), FleetError> {
        let mut groups = self.groups.lock().unwrap();
        let state = groups
            .entry(group)
            .or_insert(State::Closed {
                consecutive_failures: 0,
            });
        match *state {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open { until } => {
                if Instant::now() >= until {
                    *state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(FleetError::CircuitOpen(group.to_string()))
                }
            }
        }
    }

    pub fn record_success(&self, group: &'static str) {
        let mut groups = self.groups.lock().unwrap();
        groups.insert(
            group,
            State::Closed {
                consecutive_failures: 0,
            },
        );
    }

    pub fn record_failure(&self, group: &'static str) {
        let mut groups = self.groups.lock().unwrap();
        let state = groups
            .entry(group)
            .or_insert(State::Closed {
                consecutive_failures: 0,
            });
        *state = match *state {
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.cfg.failure_threshold {
                    tracing::warn!(group, failures, "circuit breaker opened");
                    State::Open {
                        until: Instant::now() + self.cfg.cooldown,
                    }
                } else {
                    State::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            // A failed half-open trial re-opens for a fresh cool-down.
            State::HalfOpen | State::Open { .. } => State::Open {
                until: Instant::now() + self.cfg.cooldown,
            },
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown,
        })
    }

    #[test]
    fn opens_after_threshold_and_recovers_via_half_open() {
        let cb = breaker(2, Duration::from_millis(20));
        assert!(cb.check("instances").is_ok());
        cb.record_failure("instances");
        assert!(cb.check("instances").is_ok());
        cb.record_failure("instances");
        assert!(matches!(
            cb.check("instances"),
            Err(FleetError::CircuitOpen(_))
        ));

        std::thread::sleep(Duration::from_millis(30));
        // Cool-down elapsed: one half-open trial is admitted.
        assert!(cb.check("instances").is_ok());
        cb.record_success("instances");
        assert!(cb.check("instances").is_ok());
    }

    #[test]
    fn failed_half_open_trial_reopens() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure("products");
        assert!(cb.check("products").is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.check("products").is_ok());
        cb.record_failure("products");
        assert!(cb.check("products").is_err());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(10));
        cb.record_failure("templates");
        cb.record_failure("templates");
        cb.record_success("templates");
        cb.record_failure("templates");
        cb.record_failure("templates");
        // Never reached three in a row.
        assert!(cb.check("templates").is_ok());
    }

    #[test]
    fn groups_are_independent() {
        let cb = breaker(1, Duration::from_secs(10));
        cb.record_failure("products");
        assert!(cb.check("products").is_err());
        assert!(cb.check("instances").is_ok());
    }
}
