use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Seconds until the current window resets
    pub reset_seconds: u64,
}

#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    async fn enforce(&self, key: &str) -> RateLimitDecision;
}

struct Window {
    started_at: Instant,
    count: u32,
}

/// Fixed-window counter kept in process memory
pub struct FixedWindowLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: config.window,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn enforce(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let Ok(mut windows) = self.windows.lock() else {
            tracing::error!("Rate limiter lock poisoned, rejecting request");
            return RateLimitDecision {
                allowed: false,
                reset_seconds: self.window.as_secs(),
            };
        };

        windows.retain(|_, w| now.duration_since(w.started_at) < self.window);

        let window = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });
        window.count += 1;

        let reset_seconds = self
            .window
            .saturating_sub(now.duration_since(window.started_at))
            .as_secs();

        RateLimitDecision {
            allowed: window.count <= self.max_requests,
            reset_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32) -> FixedWindowLimiter {
        FixedWindowLimiter::new(RateLimitConfig {
            max_requests,
            window: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn test_allows_up_to_limit_then_rejects() {
        let limiter = limiter(2);

        assert!(limiter.enforce("ip-1").await.allowed);
        assert!(limiter.enforce("ip-1").await.allowed);

        let decision = limiter.enforce("ip-1").await;
        assert!(!decision.allowed);
        assert!(decision.reset_seconds <= 60);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter(1);

        assert!(limiter.enforce("ip-1").await.allowed);
        assert!(!limiter.enforce("ip-1").await.allowed);
        assert!(limiter.enforce("ip-2").await.allowed);
    }
}
