//! Circuit breaker per external dependency.
//!
//! Consecutive failures open the breaker; after the cool-down one
//! half-open probe is admitted. The probe's outcome decides whether the
//! breaker closes again or re-opens.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::{ReviewError, Result};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Tracks failures of one external dependency.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cool_down: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: &BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: config.failure_threshold.max(1),
            cool_down: Duration::from_millis(config.cool_down_ms),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Gate a call: `Ok` admits it, `CircuitOpen` rejects it.
    ///
    /// When the cool-down has elapsed the breaker moves to half-open and
    /// admits exactly this one probe.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cool_down {
                    info!("breaker {} half-open after cool-down", self.name);
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(ReviewError::CircuitOpen {
                        dependency: self.name.clone(),
                        cool_down_ms: (self.cool_down - elapsed).as_millis() as u64,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state != BreakerState::Closed {
            info!("breaker {} closed", self.name);
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::HalfOpen => {
                warn!("breaker {} re-opened after failed probe", self.name);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed | BreakerState::Open => {
                inner.consecutive_failures += 1;
                if inner.state == BreakerState::Closed
                    && inner.consecutive_failures >= self.failure_threshold
                {
                    warn!(
                        "breaker {} opened after {} consecutive failures",
                        self.name, inner.consecutive_failures
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }
}

/// One breaker per external dependency, constructed together.
pub struct BreakerRegistry {
    pub kg: CircuitBreaker,
    pub llm: CircuitBreaker,
    pub github: CircuitBreaker,
}

impl BreakerRegistry {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            kg: CircuitBreaker::new("kg", config),
            llm: CircuitBreaker::new("llm", config),
            github: CircuitBreaker::new("github", config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cool_down_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            &BreakerConfig { failure_threshold: threshold, cool_down_ms },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker(3, 60_000);
        assert_eq!(b.state(), BreakerState::Closed);

        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        let err = b.check().unwrap_err();
        assert_eq!(err.code(), "circuit_open");
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let b = breaker(3, 60_000);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let b = breaker(1, 0);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        // Zero cool-down: next check admits the probe
        assert!(b.check().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.check().is_ok());
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let b = breaker(1, 0);
        b.record_failure();
        assert!(b.check().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn test_open_rejects_before_cooldown() {
        let b = breaker(1, 60_000);
        b.record_failure();
        assert!(b.check().is_err());
        assert!(b.check().is_err());
        assert_eq!(b.state(), BreakerState::Open);
    }
}
