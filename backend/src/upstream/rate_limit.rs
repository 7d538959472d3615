//! Leaky-bucket rate limiter keyed by upstream origin.
//!
//! The bucket drains at `per_minute / 60` permits per second and holds at
//! most `burst` undrained permits. `acquire` waits its turn rather than
//! failing, which turns bursts into smooth upstream pressure.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct BucketState {
    level: f64,
    last_drain: Instant,
}

pub struct LeakyBucket {
    buckets: Mutex<HashMap<String, BucketState>>,
    drain_per_sec: f64,
    capacity: f64,
}

impl LeakyBucket {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            drain_per_sec: f64::from(per_minute.max(1)) / 60.0,
            capacity: f64::from(burst.max(1)),
        }
    }

    /// Take one permit for `key`, waiting until the bucket has room.
    pub async fn acquire(&self, key: &str) {
        loop {
            match self.try_acquire(key) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Take one permit without waiting; on denial returns how long until
    /// a permit drains free.
    pub fn try_acquire(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let state = buckets.entry(key.to_string()).or_insert(BucketState {
            level: 0.0,
            last_drain: now,
        });

        let elapsed = now.duration_since(state.last_drain).as_secs_f64();
        state.level = (state.level - elapsed * self.drain_per_sec).max(0.0);
        state.last_drain = now;

        if state.level + 1.0 <= self.capacity {
            state.level += 1.0;
            Ok(())
        } else {
            let overflow = state.level + 1.0 - self.capacity;
            Err(Duration::from_secs_f64(overflow / self.drain_per_sec))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_denial() {
        let bucket = LeakyBucket::new(60, 3);

        for _ in 0..3 {
            assert!(bucket.try_acquire("origin").is_ok());
        }
        assert!(bucket.try_acquire("origin").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_over_time() {
        // 60/min drains one permit per second.
        let bucket = LeakyBucket::new(60, 2);
        assert!(bucket.try_acquire("origin").is_ok());
        assert!(bucket.try_acquire("origin").is_ok());
        assert!(bucket.try_acquire("origin").is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_acquire("origin").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let bucket = LeakyBucket::new(60, 1);
        assert!(bucket.try_acquire("a").is_ok());
        assert!(bucket.try_acquire("a").is_err());
        assert!(bucket.try_acquire("b").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits() {
        let bucket = LeakyBucket::new(60, 1);
        bucket.acquire("origin").await;

        let start = Instant::now();
        bucket.acquire("origin").await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
