//! Token-bucket rate limiting of inbound requests
//!
//! One bucket per (client identity, bucket class). A bucket starts full and
//! is refilled back to capacity once per period; tokens do not trickle in.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Which limit a request is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketClass {
    Api,
    Login,
    WebSocket,
}

impl BucketClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketClass::Api => "api",
            BucketClass::Login => "login",
            BucketClass::WebSocket => "websocket",
        }
    }
}

/// Bucket class for a request path, `None` for paths that are never limited
pub fn classify(path: &str) -> Option<BucketClass> {
    const EXEMPT: [&str; 2] = ["/api/health", "/api/openapi.json"];
    if EXEMPT.iter().any(|p| path.starts_with(p)) {
        return None;
    }
    if path.starts_with("/api/auth/login") {
        Some(BucketClass::Login)
    } else if path.starts_with("/ws") {
        Some(BucketClass::WebSocket)
    } else {
        Some(BucketClass::Api)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLimit {
    pub capacity: u32,
    pub refill_period_secs: u64,
}

impl BucketLimit {
    pub const fn new(capacity: u32, refill_period_secs: u64) -> Self {
        Self {
            capacity,
            refill_period_secs,
        }
    }

    fn period(&self) -> Duration {
        Duration::from_secs(self.refill_period_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub api: BucketLimit,
    pub login: BucketLimit,
    pub websocket: BucketLimit,
    /// Buckets untouched for this long are dropped
    pub idle_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api: BucketLimit::new(100, 60),
            login: BucketLimit::new(5, 60),
            websocket: BucketLimit::new(10, 60),
            idle_ttl_secs: 600,
        }
    }
}

impl RateLimitConfig {
    pub fn limit(&self, class: BucketClass) -> BucketLimit {
        match class {
            BucketClass::Api => self.api,
            BucketClass::Login => self.login,
            BucketClass::WebSocket => self.websocket,
        }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub remaining: u32,
    /// Time until the bucket refills
    pub retry_after: Duration,
}

impl Admission {
    /// Whole seconds until refill, at least one
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        let rounded = if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        rounded.max(1)
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    period: Duration,
    tokens: u32,
    window_start: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn new(limit: BucketLimit, now: Instant) -> Self {
        Self {
            capacity: limit.capacity,
            period: limit.period(),
            tokens: limit.capacity,
            window_start: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= self.period {
            let periods = (elapsed.as_nanos() / self.period.as_nanos()) as u32;
            self.window_start += self.period * periods;
            self.tokens = self.capacity;
        }
    }

    fn try_consume(&mut self, now: Instant) -> Admission {
        self.refill(now);
        self.last_seen = now;

        let allowed = self.tokens > 0;
        if allowed {
            self.tokens -= 1;
        }
        Admission {
            allowed,
            remaining: self.tokens,
            retry_after: (self.window_start + self.period).saturating_duration_since(now),
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<(String, BucketClass), TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn admit(&self, identity: &str, class: BucketClass) -> Admission {
        self.admit_at(identity, class, Instant::now())
    }

    /// Consume one token for `identity` in `class` as of `now`
    pub fn admit_at(&self, identity: &str, class: BucketClass, now: Instant) -> Admission {
        let limit = self.config.limit(class);
        let mut bucket = self
            .buckets
            .entry((identity.to_string(), class))
            .or_insert_with(|| TokenBucket::new(limit, now));
        let admission = bucket.try_consume(now);
        if !admission.allowed {
            debug!(
                identity = %identity,
                class = class.as_str(),
                "Rate limit exceeded"
            );
        }
        admission
    }

    /// Drop buckets idle for longer than the configured TTL
    pub fn gc(&self) -> usize {
        self.gc_at(Instant::now())
    }

    pub fn gc_at(&self, now: Instant) -> usize {
        let ttl = Duration::from_secs(self.config.idle_ttl_secs);
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < ttl);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, "Dropped idle rate limit buckets");
        }
        removed
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
