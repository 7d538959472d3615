//! Per-source enqueue rate limiting: fixed minute/hour windows plus a
//! token-bucket burst gate.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::{CoreError, CoreResult};

struct SourceState {
    minute_start: Instant,
    minute_count: u32,
    hour_start: Instant,
    hour_count: u32,
    burst_tokens: f64,
    last_refill: Instant,
}

pub struct SourceRateLimiter {
    config: RateLimitConfig,
    sources: Mutex<HashMap<String, SourceState>>,
}

impl SourceRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one enqueue from `source`. Rejections carry the
    /// seconds until the violated window resets.
    pub fn check(&self, source: &str) -> CoreResult<()> {
        let now = Instant::now();
        let mut sources = self.sources.lock().expect("rate limiter lock poisoned");
        let state = sources.entry(source.to_string()).or_insert(SourceState {
            minute_start: now,
            minute_count: 0,
            hour_start: now,
            hour_count: 0,
            burst_tokens: f64::from(self.config.burst_size),
            last_refill: now,
        });

        // Refill burst tokens at the per-minute pace.
        let refill = now.duration_since(state.last_refill).as_secs_f64()
            * f64::from(self.config.per_minute)
            / 60.0;
        state.burst_tokens = (state.burst_tokens + refill).min(f64::from(self.config.burst_size));
        state.last_refill = now;

        if now.duration_since(state.minute_start).as_secs() >= 60 {
            state.minute_start = now;
            state.minute_count = 0;
        }
        if now.duration_since(state.hour_start).as_secs() >= 3600 {
            state.hour_start = now;
            state.hour_count = 0;
        }

        if state.burst_tokens < 1.0 {
            let reset = ((1.0 - state.burst_tokens) * 60.0 / f64::from(self.config.per_minute))
                .ceil() as u64;
            return Err(CoreError::RateLimited {
                rate_source: source.to_string(),
                reset_secs: reset.max(1),
            });
        }
        if state.minute_count >= self.config.per_minute {
            let reset = 60 - now.duration_since(state.minute_start).as_secs();
            return Err(CoreError::RateLimited {
                rate_source: source.to_string(),
                reset_secs: reset.max(1),
            });
        }
        if state.hour_count >= self.config.per_hour {
            let reset = 3600 - now.duration_since(state.hour_start).as_secs();
            return Err(CoreError::RateLimited {
                rate_source: source.to_string(),
                reset_secs: reset.max(1),
            });
        }

        state.burst_tokens -= 1.0;
        state.minute_count += 1;
        state.hour_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(per_minute: u32, per_hour: u32, burst: u32) -> SourceRateLimiter {
        SourceRateLimiter::new(RateLimitConfig {
            per_minute,
            per_hour,
            burst_size: burst,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_gate() {
        let limiter = limiter(60, 1000, 3);
        for _ in 0..3 {
            assert!(limiter.check("sync").is_ok());
        }
        let err = limiter.check("sync").unwrap_err();
        assert_eq!(err.kind(), "RATE_LIMITED");
        assert!(err.to_string().contains("sync"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_refills() {
        let limiter = limiter(60, 1000, 2);
        assert!(limiter.check("s").is_ok());
        assert!(limiter.check("s").is_ok());
        assert!(limiter.check("s").is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.check("s").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_window() {
        // Large burst so only the minute window binds.
        let limiter = limiter(5, 1000, 100);
        for _ in 0..5 {
            assert!(limiter.check("s").is_ok());
        }
        assert!(limiter.check("s").is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("s").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_independent() {
        let limiter = limiter(60, 1000, 1);
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
        assert!(limiter.check("b").is_ok());
    }
}
