//! 重试策略：指数退避 + 抖动 + 上限
//!
//! max_attempts 为总尝试次数（含首次）；第 n 次失败后的等待为
//! min(base * 2^(n-1), max_delay) 加 [0, jitter) 的随机抖动，且不低于服务端给出的 retry_after。

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 0.0 ~ 1.0，抖动占退避时长的比例
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// 快速失败
    pub fn fast() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5000),
            jitter_factor: 0.1,
        }
    }

    /// 第 failed_attempt 次（从 1 开始）失败后的等待时长
    pub fn backoff(&self, failed_attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exponential = 2u64
            .checked_pow(exponent)
            .and_then(|factor| base_ms.checked_mul(factor))
            .unwrap_or(u64::MAX);
        let capped = exponential.min(max_ms);

        let jitter_range = (capped as f64 * self.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jitter = if jitter_range > 0 {
            fastrand::u64(0..jitter_range)
        } else {
            0
        };

        let delay = Duration::from_millis(capped.saturating_add(jitter));
        match retry_after {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.backoff(1, None), Duration::from_secs(1));
        assert_eq!(policy.backoff(2, None), Duration::from_secs(2));
        assert_eq!(policy.backoff(3, None), Duration::from_secs(4));
        assert_eq!(policy.backoff(10, None), Duration::from_secs(30));
        assert_eq!(policy.backoff(200, None), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.backoff(2, None);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay < Duration::from_millis(2400));
        }
    }

    #[test]
    fn test_retry_after_is_a_floor() {
        let policy = no_jitter();
        assert_eq!(
            policy.backoff(1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            policy.backoff(3, Some(Duration::from_millis(10))),
            Duration::from_secs(4)
        );
    }
}
