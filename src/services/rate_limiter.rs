//! Two-window request budget (per second and per day) for calls to the CRM.
//!
//! Counters are keyed by the window they belong to, so they reset on their own
//! when the key expires. A slot is reserved by an atomic increment before the
//! call and handed back if the call does not go through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const SECOND_TTL: Duration = Duration::from_secs(2);
const DAY_TTL: Duration = Duration::from_secs(86_400);

#[async_trait]
pub trait RateCounter: Send + Sync {
    /// Increment `key` and return the new count. A new key expires after `ttl`.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, redis::RedisError>;

    async fn decr(&self, key: &str) -> Result<(), redis::RedisError>;
}

/// Counters shared by every worker process through Redis.
#[derive(Clone)]
pub struct RedisCounter {
    redis_client: Client,
}

impl RedisCounter {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        let redis_client = Client::open(redis_url)?;
        Ok(Self { redis_client })
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        self.redis_client.get_multiplexed_async_connection().await
    }
}

#[async_trait]
impl RateCounter for RedisCounter {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, redis::RedisError> {
        let mut conn = self.get_connection().await?;
        let current: u64 = conn.incr(key, 1).await?;
        if current == 1 {
            let _: () = conn.expire(key, ttl.as_secs().max(1) as i64).await?;
        }
        Ok(current)
    }

    async fn decr(&self, key: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.get_connection().await?;
        let _: i64 = conn.decr(key, 1).await?;
        Ok(())
    }
}

/// Process-local counters with per-key expiry.
#[derive(Default)]
pub struct MemoryCounter {
    entries: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateCounter for MemoryCounter {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, redis::RedisError> {
        let now = Instant::now();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        let entry = entries.entry(key.to_string()).or_insert((0, now + ttl));
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn decr(&self, key: &str) -> Result<(), redis::RedisError> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = entries.get_mut(key) {
            entry.0 = entry.0.saturating_sub(1);
        }
        Ok(())
    }
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub per_second: u64,
    pub per_day: u64,
}

/// A reserved slot in both windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permit {
    second_key: String,
    day_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed(Permit),
    SecondExhausted,
    DayExhausted,
}

pub struct RateLimiter {
    counter: Arc<dyn RateCounter>,
    limits: RateLimits,
    prefix: String,
    clock: Clock,
}

impl RateLimiter {
    pub fn new(counter: Arc<dyn RateCounter>, limits: RateLimits, prefix: impl Into<String>) -> Self {
        Self::with_clock(counter, limits, prefix, Arc::new(Utc::now))
    }

    pub fn with_clock(
        counter: Arc<dyn RateCounter>,
        limits: RateLimits,
        prefix: impl Into<String>,
        clock: Clock,
    ) -> Self {
        Self {
            counter,
            limits,
            prefix: prefix.into(),
            clock,
        }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    pub async fn acquire(&self) -> Result<Admission, redis::RedisError> {
        let now = (self.clock)();
        let day_key = format!("{}:day:{}", self.prefix, now.format("%Y%m%d"));
        let second_key = format!("{}:second:{}", self.prefix, now.format("%Y%m%d%H%M%S"));

        let day = self.counter.incr(&day_key, DAY_TTL).await?;
        if day > self.limits.per_day {
            self.counter.decr(&day_key).await?;
            return Ok(Admission::DayExhausted);
        }

        let second = self.counter.incr(&second_key, SECOND_TTL).await?;
        if second > self.limits.per_second {
            self.counter.decr(&second_key).await?;
            self.counter.decr(&day_key).await?;
            return Ok(Admission::SecondExhausted);
        }

        Ok(Admission::Allowed(Permit {
            second_key,
            day_key,
        }))
    }

    /// Return a slot whose call did not complete, so only successful calls
    /// count against the budget.
    pub async fn release(&self, permit: Permit) -> Result<(), redis::RedisError> {
        self.counter.decr(&permit.second_key).await?;
        self.counter.decr(&permit.day_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn manual_clock(start: DateTime<Utc>) -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let now = Arc::new(Mutex::new(start));
        let handle = now.clone();
        let clock: Clock = Arc::new(move || *handle.lock().unwrap());
        (clock, now)
    }

    fn limiter(per_second: u64, per_day: u64) -> (RateLimiter, Arc<Mutex<DateTime<Utc>>>) {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let (clock, now) = manual_clock(start);
        let limiter = RateLimiter::with_clock(
            Arc::new(MemoryCounter::new()),
            RateLimits { per_second, per_day },
            "crm",
            clock,
        );
        (limiter, now)
    }

    #[tokio::test]
    async fn test_second_window_caps_and_resets() {
        let (limiter, now) = limiter(3, 1000);
        for _ in 0..3 {
            assert!(matches!(limiter.acquire().await.unwrap(), Admission::Allowed(_)));
        }
        assert_eq!(limiter.acquire().await.unwrap(), Admission::SecondExhausted);

        *now.lock().unwrap() += chrono::Duration::seconds(1);
        assert!(matches!(limiter.acquire().await.unwrap(), Admission::Allowed(_)));
    }

    #[tokio::test]
    async fn test_day_window_caps() {
        let (limiter, now) = limiter(10, 2);
        for _ in 0..2 {
            assert!(matches!(limiter.acquire().await.unwrap(), Admission::Allowed(_)));
            *now.lock().unwrap() += chrono::Duration::seconds(5);
        }
        assert_eq!(limiter.acquire().await.unwrap(), Admission::DayExhausted);

        *now.lock().unwrap() += chrono::Duration::days(1);
        assert!(matches!(limiter.acquire().await.unwrap(), Admission::Allowed(_)));
    }

    #[tokio::test]
    async fn test_denied_requests_do_not_consume_budget() {
        let (limiter, now) = limiter(1, 2);
        assert!(matches!(limiter.acquire().await.unwrap(), Admission::Allowed(_)));
        for _ in 0..5 {
            assert_eq!(limiter.acquire().await.unwrap(), Admission::SecondExhausted);
        }
        *now.lock().unwrap() += chrono::Duration::seconds(1);
        // Only one of the two daily slots was used.
        assert!(matches!(limiter.acquire().await.unwrap(), Admission::Allowed(_)));
    }

    #[tokio::test]
    async fn test_release_returns_slot() {
        let (limiter, _now) = limiter(1, 100);
        let Admission::Allowed(permit) = limiter.acquire().await.unwrap() else {
            panic!("expected a permit");
        };
        assert_eq!(limiter.acquire().await.unwrap(), Admission::SecondExhausted);
        limiter.release(permit).await.unwrap();
        assert!(matches!(limiter.acquire().await.unwrap(), Admission::Allowed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_counter_expires_keys() {
        let counter = MemoryCounter::new();
        assert_eq!(counter.incr("k", Duration::from_secs(1)).await.unwrap(), 1);
        assert_eq!(counter.incr("k", Duration::from_secs(1)).await.unwrap(), 2);
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(counter.incr("k", Duration::from_secs(1)).await.unwrap(), 1);
    }
}
