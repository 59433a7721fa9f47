//! 按模型的令牌桶限流
//!
//! 每个模型一个桶（容量 + 每秒补充速率），补充在 acquire 时按流逝时间惰性计算，无后台定时器。
//! acquire 采用预约方式：先扣一个令牌（余额可为负），再睡到该令牌补齐为止；
//! 预计等待超过 max_wait 时立即退还并失败，等待中被取消同样退还。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// 令牌桶参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// 突发容量
    pub capacity: u32,
    /// 每秒补充的令牌数
    pub refill_per_sec: f64,
}

impl RateLimit {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// 每分钟请求数 + 突发容量
    pub fn per_minute(requests_per_minute: u32, burst: u32) -> Self {
        Self::new(burst, requests_per_minute as f64 / 60.0)
    }
}

/// 预计等待超过上限
#[derive(Error, Debug, Clone, PartialEq)]
#[error("rate limit for {model} needs {required:?}, above max wait {max_wait:?}")]
pub struct RateLimitExceeded {
    pub model: String,
    pub required: Option<Duration>,
    pub max_wait: Duration,
}

/// 放行凭证；令牌随时间补充，无需归还
#[derive(Debug, Clone, PartialEq)]
pub struct RatePermit {
    pub model: String,
    pub waited: Duration,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: RateLimit, now: Instant) -> Self {
        Self {
            tokens: limit.capacity as f64,
            capacity: limit.capacity as f64,
            refill_per_sec: limit.refill_per_sec,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if self.refill_per_sec > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        }
        self.last_refill = now;
    }

    /// 预约一个令牌，返回需等待时长；超过 max_wait 时不扣减，返回所需时长（None 表示永远等不到）
    fn reserve(&mut self, now: Instant, max_wait: Duration) -> Result<Duration, Option<Duration>> {
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            return Ok(Duration::ZERO);
        }
        let required = if self.refill_per_sec > 0.0 {
            Duration::try_from_secs_f64(-self.tokens / self.refill_per_sec).ok()
        } else {
            None
        };
        match required {
            Some(wait) if wait <= max_wait => Ok(wait),
            other => {
                self.tokens += 1.0;
                Err(other)
            }
        }
    }

    fn refund(&mut self, now: Instant) {
        self.refill(now);
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }
}

/// 多模型限流器：Orchestrator 生命周期内共享
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(limits: &HashMap<String, RateLimit>, max_wait: Duration) -> Self {
        let now = Instant::now();
        let buckets = limits
            .iter()
            .map(|(model, limit)| (model.clone(), TokenBucket::new(*limit, now)))
            .collect();
        Self {
            buckets: Mutex::new(buckets),
            max_wait,
        }
    }

    /// 不限流
    pub fn unlimited() -> Self {
        Self::new(&HashMap::new(), Duration::ZERO)
    }

    /// 当前余额（负数表示已有等待中的预约）；未配置的模型返回 None
    pub fn available(&self, model: &str) -> Option<f64> {
        let mut buckets = self.lock();
        buckets.get_mut(model).map(|bucket| {
            bucket.refill(Instant::now());
            bucket.tokens
        })
    }

    /// 获取某模型的放行许可；必要时挂起等待
    pub async fn acquire(&self, model: &str) -> Result<RatePermit, RateLimitExceeded> {
        let wait = {
            let mut buckets = self.lock();
            let Some(bucket) = buckets.get_mut(model) else {
                return Ok(RatePermit {
                    model: model.to_string(),
                    waited: Duration::ZERO,
                });
            };
            bucket
                .reserve(Instant::now(), self.max_wait)
                .map_err(|required| RateLimitExceeded {
                    model: model.to_string(),
                    required,
                    max_wait: self.max_wait,
                })?
        };

        if !wait.is_zero() {
            tracing::debug!(model, wait_ms = wait.as_millis() as u64, "rate limiter delaying call");
            let mut refund = RefundOnDrop {
                limiter: self,
                model,
                armed: true,
            };
            tokio::time::sleep(wait).await;
            refund.armed = false;
        }

        Ok(RatePermit {
            model: model.to_string(),
            waited: wait,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 等待中被取消时退还预约的令牌
struct RefundOnDrop<'a> {
    limiter: &'a RateLimiter,
    model: &'a str,
    armed: bool,
}

impl Drop for RefundOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(bucket) = self.limiter.lock().get_mut(self.model) {
                bucket.refund(Instant::now());
            }
        }
    }
}
