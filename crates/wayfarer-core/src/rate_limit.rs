use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{RateLimitRule, RateLimitsConfig};

/// Endpoint classes with independently configured limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Chat,
    Voice,
    ToolHeavy,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Voice => "voice",
            Self::ToolHeavy => "tool_heavy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Throttled { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStats {
    pub count: u32,
    pub attempts: u32,
}

struct WindowBucket {
    window_start: Instant,
    window: Duration,
    count: u32,
    attempts: u32,
}

impl WindowBucket {
    fn new(now: Instant, window: Duration) -> Self {
        Self {
            window_start: now,
            window,
            count: 0,
            attempts: 0,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.window_start) >= self.window
    }
}

/// Fixed-window counters keyed by subject. The map lock is never held
/// across an await, so a check is a single atomic step.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, WindowBucket>>>,
    config: RateLimitsConfig,
}

pub fn subject_key(user_id: &str, class: EndpointClass) -> String {
    format!("{user_id}:{}", class.as_str())
}

impl RateLimiter {
    pub fn new(config: RateLimitsConfig) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn rule_for(&self, class: EndpointClass) -> RateLimitRule {
        match class {
            EndpointClass::Chat => self.config.chat,
            EndpointClass::Voice => self.config.voice,
            EndpointClass::ToolHeavy => self.config.tool_heavy,
        }
    }

    pub fn check(&self, user_id: &str, class: EndpointClass) -> RateDecision {
        let rule = self.rule_for(class);
        self.decide(&subject_key(user_id, class), rule.limit, rule.window())
    }

    pub fn allow(&self, subject_key: &str, limit: u32, window: Duration) -> bool {
        self.decide(subject_key, limit, window).is_allowed()
    }

    fn decide(&self, key: &str, limit: u32, window: Duration) -> RateDecision {
        let now = Instant::now();
        let Ok(mut buckets) = self.buckets.lock() else {
            tracing::error!("rate limiter lock poisoned, denying request");
            return RateDecision::Throttled {
                retry_after: window,
            };
        };
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| WindowBucket::new(now, window));
        if bucket.expired(now) || bucket.window != window {
            *bucket = WindowBucket::new(now, window);
        }

        bucket.attempts = bucket.attempts.saturating_add(1);
        if bucket.count < limit {
            bucket.count += 1;
            RateDecision::Allowed {
                remaining: limit - bucket.count,
            }
        } else {
            let elapsed = now.duration_since(bucket.window_start);
            RateDecision::Throttled {
                retry_after: window.saturating_sub(elapsed),
            }
        }
    }

    /// Clear every bucket belonging to `user_id`.
    pub fn reset(&self, user_id: &str) -> usize {
        let prefix = format!("{user_id}:");
        let Ok(mut buckets) = self.buckets.lock() else {
            return 0;
        };
        let before = buckets.len();
        buckets.retain(|k, _| !k.starts_with(&prefix));
        before - buckets.len()
    }

    /// Drop buckets whose window has rolled over.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let Ok(mut buckets) = self.buckets.lock() else {
            return 0;
        };
        let before = buckets.len();
        buckets.retain(|_, b| !b.expired(now));
        before - buckets.len()
    }

    pub fn stats(&self, key: &str) -> Option<BucketStats> {
        let buckets = self.buckets.lock().ok()?;
        buckets.get(key).map(|b| BucketStats {
            count: b.count,
            attempts: b.attempts,
        })
    }
}
