//! Token-bucket rate limiter
//!
//! Floating-point token bucket. The bucket starts full; refill is continuous
//! and computed lazily on every state access rather than via a background
//! tick, so there is no timer task to supervise. All state mutations are
//! serialized behind a single `tokio::sync::Mutex` - `acquire()` never holds
//! that lock across the `sleep` it may need, matching the deadlock-avoidance
//! rule that mutexes are never held across I/O or suspension.

use crate::error::RateLimiterError;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::error;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Snapshot of rate-limiter statistics, also surfaced in the health snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterStats {
    pub max_messages_per_second: u32,
    pub burst_capacity: f64,
    pub current_tokens: f64,
    pub messages_allowed: u64,
    pub messages_delayed: u64,
    pub total_wait_time: Duration,
    pub max_wait_time: Duration,
}

impl RateLimiterStats {
    pub fn avg_wait_time(&self) -> Duration {
        if self.messages_delayed == 0 {
            Duration::ZERO
        } else {
            self.total_wait_time / self.messages_delayed as u32
        }
    }
}

pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
    messages_allowed: std::sync::atomic::AtomicU64,
    messages_delayed: std::sync::atomic::AtomicU64,
    total_wait_time: Mutex<Duration>,
    max_wait_time: Mutex<Duration>,
}

impl RateLimiter {
    pub fn new(max_messages_per_second: u32, burst_multiplier: f64) -> Self {
        let rate = max_messages_per_second as f64;
        let capacity = rate * burst_multiplier;
        Self {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            messages_allowed: std::sync::atomic::AtomicU64::new(0),
            messages_delayed: std::sync::atomic::AtomicU64::new(0),
            total_wait_time: Mutex::new(Duration::ZERO),
            max_wait_time: Mutex::new(Duration::ZERO),
        }
    }

    /// Refill the bucket in place based on elapsed time, capped at capacity.
    /// Guards against a non-monotonic clock (e.g. a system clock step
    /// backwards) by resetting `last_refill` to now, logging, and reporting
    /// the anomaly to the caller rather than producing a negative elapsed
    /// duration.
    fn refill(&self, bucket: &mut Bucket) -> Result<(), RateLimiterError> {
        let now = Instant::now();
        if now < bucket.last_refill {
            error!("non-monotonic clock observed in rate limiter, resetting last_refill");
            bucket.last_refill = now;
            return Err(RateLimiterError::NonMonotonicClock);
        }
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;
        Ok(())
    }

    /// Acquire a single token, suspending the caller if none is
    /// immediately available. Eventually returns; never blocks forever.
    ///
    /// Fail-open: a non-monotonic clock is surfaced as `Err`, but the token
    /// accounting still proceeds and the message is still admitted - the
    /// caller is never blocked on this condition (§4.2).
    pub async fn acquire(&self) -> Result<(), RateLimiterError> {
        let mut clock_error = Ok(());
        let wait = {
            let mut bucket = self.bucket.lock().await;
            clock_error = self.refill(&mut bucket);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                None
            } else {
                let wait_secs = (1.0 - bucket.tokens) / self.rate;
                Some(Duration::from_secs_f64(wait_secs.max(0.0)))
            }
        };

        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
            let mut bucket = self.bucket.lock().await;
            if let Err(e) = self.refill(&mut bucket) {
                clock_error = Err(e);
            }
            // Refill may still leave us short by floating point slack; clamp.
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);

            self.messages_delayed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let mut total = self.total_wait_time.lock().await;
            *total += wait;
            let mut max_wait = self.max_wait_time.lock().await;
            if wait > *max_wait {
                *max_wait = wait;
            }
        }

        self.messages_allowed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        clock_error
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let current_tokens = {
            let mut bucket = self.bucket.lock().await;
            let _ = self.refill(&mut bucket);
            bucket.tokens
        };
        RateLimiterStats {
            max_messages_per_second: self.rate as u32,
            burst_capacity: self.capacity,
            current_tokens,
            messages_allowed: self.messages_allowed.load(std::sync::atomic::Ordering::Relaxed),
            messages_delayed: self.messages_delayed.load(std::sync::atomic::Ordering::Relaxed),
            total_wait_time: *self.total_wait_time.lock().await,
            max_wait_time: *self.max_wait_time.lock().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_full_and_admits_bursts_up_to_capacity() {
        let limiter = RateLimiter::new(10, 2.0);
        // capacity = 20, bucket starts full: 20 acquires should return immediately.
        for _ in 0..20 {
            limiter.acquire().await.unwrap();
        }
        let stats = limiter.stats().await;
        assert_eq!(stats.messages_allowed, 20);
        assert!(stats.current_tokens < 1.0);
    }

    #[tokio::test]
    async fn tokens_stay_within_bounds() {
        let limiter = RateLimiter::new(5, 1.0);
        for _ in 0..3 {
            limiter.acquire().await.unwrap();
        }
        let stats = limiter.stats().await;
        assert!(stats.current_tokens >= 0.0);
        assert!(stats.current_tokens <= stats.burst_capacity);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_acquires_at_rate_one_take_at_least_one_second() {
        // B1: max_messages_per_second=1, burst_multiplier=1.0
        let limiter = RateLimiter::new(1, 1.0);
        let start = tokio::time::Instant::now();
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn messages_allowed_is_monotonically_increasing() {
        let limiter = RateLimiter::new(100, 2.0);
        let mut last = 0;
        for _ in 0..10 {
            limiter.acquire().await.unwrap();
            let stats = limiter.stats().await;
            assert!(stats.messages_allowed >= last);
            last = stats.messages_allowed;
        }
    }

    #[tokio::test]
    async fn acquire_surfaces_non_monotonic_clock_but_still_admits() {
        let limiter = RateLimiter::new(10, 2.0);
        {
            // Push last_refill into the future to simulate a clock step backwards.
            let mut bucket = limiter.bucket.lock().await;
            bucket.last_refill += Duration::from_secs(1000);
        }
        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err, RateLimiterError::NonMonotonicClock);
        // Fail-open: the message is still counted as admitted.
        assert_eq!(limiter.stats().await.messages_allowed, 1);
    }
}
