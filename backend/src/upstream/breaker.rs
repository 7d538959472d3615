//! Circuit breaker for the upstream origin.
//!
//! CLOSED counts consecutive failures; at the threshold the circuit opens
//! and requests fail fast. After the cooldown one probe is let through
//! (HALF_OPEN); its outcome either closes the circuit or re-opens it.

use crate::error::{CoreError, CoreResult};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    origin: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(origin: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            origin: origin.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Gate a request. Fails fast while the circuit is open; admits a single
    /// probe once the cooldown has elapsed.
    pub fn preflight(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(CoreError::CircuitOpen {
                        origin: self.origin.clone(),
                        cooldown_secs: (self.cooldown - elapsed).as_secs().max(1),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CoreError::CircuitOpen {
                        origin: self.origin.clone(),
                        cooldown_secs: 1,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            _ => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("https://sn.example", 3, Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let b = breaker();
        assert_eq!(b.state(), CircuitState::Closed);

        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.preflight().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_after_cooldown() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        assert!(b.preflight().is_err());

        tokio::time::advance(Duration::from_secs(31)).await;

        // One probe goes through, concurrent requests stay blocked.
        assert!(b.preflight().is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.preflight().is_err());

        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.preflight().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(b.preflight().is_ok());

        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.preflight().is_err());
    }
}
