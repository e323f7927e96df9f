//! Redis sliding-window backend
//!
//! One sorted set per `<prefix><tenant>:<class>` key, scored by request
//! timestamp in milliseconds. Trim, insert, count, and expiry-refresh run
//! as a single MULTI/EXEC pipeline so concurrent requests from the same
//! tenant cannot race past the limit.

use crate::RateLimitError;
use funnel_common::{LimitRule, RedisConfig};
use rand::Rng;
use redis::AsyncCommands;
use std::time::Duration;

/// Outcome of one sliding-window check
#[derive(Debug, Clone, Copy)]
pub struct WindowVerdict {
    pub allowed: bool,
    pub count: u64,
}

pub struct RedisSlidingWindow {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
    timeout: Duration,
}

impl RedisSlidingWindow {
    /// Connect to the configured Redis instance
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(cfg.url.as_str())
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        Ok(Self {
            conn,
            key_prefix: cfg.key_prefix.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn now_ms() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    async fn run<T: redis::FromRedisValue>(
        &self,
        pipe: &redis::Pipeline,
    ) -> Result<T, RateLimitError> {
        let mut conn = self.conn.clone();
        tokio::time::timeout(self.timeout, pipe.query_async(&mut conn))
            .await
            .map_err(|_| RateLimitError::Backend("redis call timed out".into()))?
            .map_err(|e| RateLimitError::Backend(e.to_string()))
    }

    /// Trim expired entries, insert the new request, count, refresh expiry;
    /// admit iff the count (including this request) stays within the limit.
    pub async fn check(&self, key: &str, rule: LimitRule) -> Result<WindowVerdict, RateLimitError> {
        let redis_key = self.full_key(key);
        let now = Self::now_ms();
        let cutoff = now.saturating_sub(rule.window_ms);
        // Member must be unique even when two requests land in the same
        // millisecond.
        let member = format!("{}-{}", now, rand::thread_rng().gen::<u32>());

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&redis_key)
            .arg(0)
            .arg(cutoff)
            .cmd("ZADD")
            .arg(&redis_key)
            .arg(now)
            .arg(&member)
            .cmd("ZCARD")
            .arg(&redis_key)
            .cmd("PEXPIRE")
            .arg(&redis_key)
            .arg(rule.window_ms);

        let (_removed, _added, count, _expired): (u64, u64, u64, u64) = self.run(&pipe).await?;

        let allowed = count <= u64::from(rule.requests);
        if !allowed {
            // Denied requests do not consume window budget; take the
            // just-added member back out, best effort.
            let mut undo = redis::pipe();
            undo.cmd("ZREM").arg(&redis_key).arg(&member);
            let _: Result<(u64,), _> = self.run(&undo).await;
        }

        Ok(WindowVerdict { allowed, count })
    }

    /// Record usage without an admission decision
    pub async fn record(&self, key: &str, rule: LimitRule) -> Result<(), RateLimitError> {
        let redis_key = self.full_key(key);
        let now = Self::now_ms();
        let member = format!("{}-{}", now, rand::thread_rng().gen::<u32>());

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(&redis_key)
            .arg(now)
            .arg(&member)
            .cmd("PEXPIRE")
            .arg(&redis_key)
            .arg(rule.window_ms);
        let _: (u64, u64) = self.run(&pipe).await?;
        Ok(())
    }

    /// Requests currently inside the window for `key`
    pub async fn count(&self, key: &str, rule: LimitRule) -> Result<u64, RateLimitError> {
        let redis_key = self.full_key(key);
        let cutoff = Self::now_ms().saturating_sub(rule.window_ms);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&redis_key)
            .arg(0)
            .arg(cutoff)
            .cmd("ZCARD")
            .arg(&redis_key);
        let (_removed, count): (u64, u64) = self.run(&pipe).await?;
        Ok(count)
    }

    /// Delete every window key belonging to `tenant`
    pub async fn reset_tenant(&self, tenant: &str) -> Result<(), RateLimitError> {
        let pattern = format!("{}{}:*", self.key_prefix, tenant);

        let keys: Vec<String> = {
            let mut conn = self.conn.clone();
            let scan = async {
                let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
                let mut keys = Vec::new();
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                Ok::<_, redis::RedisError>(keys)
            };
            tokio::time::timeout(self.timeout, scan)
                .await
                .map_err(|_| RateLimitError::Backend("redis scan timed out".into()))?
                .map_err(|e| RateLimitError::Backend(e.to_string()))?
        };

        if !keys.is_empty() {
            let mut pipe = redis::pipe();
            pipe.cmd("DEL");
            for key in &keys {
                pipe.arg(key);
            }
            let _: (u64,) = self.run(&pipe).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> RedisConfig {
        RedisConfig {
            enabled: true,
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "funnel:test:rl:".to_string(),
            timeout_ms: 500,
        }
    }

    // Requires a local Redis; run with `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn sliding_window_admits_up_to_limit() {
        let backend = RedisSlidingWindow::connect(&local_config()).await.unwrap();
        let key = format!("t-{}:events", rand::thread_rng().gen::<u32>());
        let rule = LimitRule::new(3, 1_000);

        for _ in 0..3 {
            assert!(backend.check(&key, rule).await.unwrap().allowed);
        }
        assert!(!backend.check(&key, rule).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(backend.check(&key, rule).await.unwrap().allowed);
    }

    #[tokio::test]
    #[ignore]
    async fn reset_tenant_clears_all_classes() {
        let backend = RedisSlidingWindow::connect(&local_config()).await.unwrap();
        let tenant = format!("t-{}", rand::thread_rng().gen::<u32>());
        let rule = LimitRule::new(5, 60_000);

        backend.check(&format!("{tenant}:events"), rule).await.unwrap();
        backend.check(&format!("{tenant}:admin"), rule).await.unwrap();

        backend.reset_tenant(&tenant).await.unwrap();
        assert_eq!(backend.count(&format!("{tenant}:events"), rule).await.unwrap(), 0);
        assert_eq!(backend.count(&format!("{tenant}:admin"), rule).await.unwrap(), 0);
    }
}
