//! 弹性调用包装：缓存 → 单飞 → 限流 → 超时 → 重试退避 → 写缓存
//!
//! 同一 CacheKey 同时只有一次远端飞行；后来者等待同一个 Shared future 的结果。
//! 飞行表只保存 WeakShared，所有等待者都放弃后飞行（及其远端调用）随之被丢弃并从表中移除。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use tokio::time::Instant;

use crate::core::PipelineError;
use crate::llm::{
    CacheKey, CallError, LlmClient, RateLimiter, ResponseCache, RetryPolicy, StageRequest,
    StageResult,
};

type Flight = Shared<BoxFuture<'static, Result<StageResult, PipelineError>>>;
type WeakFlight = WeakShared<BoxFuture<'static, Result<StageResult, PipelineError>>>;

/// 单次 invoke 的调用策略（由阶段配置决定）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallPolicy {
    /// 单次尝试超时
    pub call_timeout: Duration,
    /// 成功结果的缓存时长；0 表示不缓存
    pub cache_ttl: Duration,
}

/// 弹性调用统计（快照）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResilienceStats {
    pub invocations: u64,
    pub cache_hits: u64,
    /// 加入已有飞行而未发起新调用的次数
    pub coalesced: u64,
    pub remote_attempts: u64,
    pub retries: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    invocations: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    remote_attempts: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

struct Inner {
    client: Arc<dyn LlmClient>,
    cache: Arc<ResponseCache>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    inflight: Mutex<HashMap<CacheKey, (u64, WeakFlight)>>,
    next_flight: AtomicU64,
    counters: Counters,
}

/// 包装 LlmClient 的弹性调用器；Clone 后共享同一缓存、限流器与飞行表
#[derive(Clone)]
pub struct ResilientCaller {
    inner: Arc<Inner>,
}

impl ResilientCaller {
    pub fn new(
        client: Arc<dyn LlmClient>,
        cache: Arc<ResponseCache>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                cache,
                limiter,
                retry,
                inflight: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.inner.client
    }

    pub fn stats(&self) -> ResilienceStats {
        let c = &self.inner.counters;
        ResilienceStats {
            invocations: c.invocations.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            remote_attempts: c.remote_attempts.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// 执行一次阶段请求；要么返回完整结果，要么返回一个带阶段 / 模型 / 尝试次数的错误
    pub async fn invoke(
        &self,
        request: StageRequest,
        policy: CallPolicy,
    ) -> Result<StageResult, PipelineError> {
        let inner = &self.inner;
        inner.counters.invocations.fetch_add(1, Ordering::Relaxed);
        let key = request.cache_key();

        if let Some(hit) = inner.cache.lookup(&key) {
            inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(stage = %request.stage(), model = request.model(), key = ?key, "cache hit");
            return Ok(hit);
        }

        // 注意：持锁期间不得丢弃 Flight 强引用（最后一个强引用被丢弃会触发 FlightGuard 再次加锁）
        let (flight, joined) = {
            let mut inflight = inner.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.get(&key).and_then(|(_, weak)| weak.upgrade()) {
                Some(flight) => (flight, true),
                None => {
                    // 上一次飞行可能刚写完缓存并退出
                    if let Some(hit) = inner.cache.peek(&key) {
                        inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(hit);
                    }
                    let id = inner.next_flight.fetch_add(1, Ordering::Relaxed);
                    let flight = self.launch(id, key.clone(), request, policy);
                    if let Some(weak) = flight.downgrade() {
                        inflight.insert(key.clone(), (id, weak));
                    }
                    (flight, false)
                }
            }
        };

        if joined {
            inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = ?key, "joined in-flight call");
        }
        flight.await
    }

    fn launch(&self, id: u64, key: CacheKey, request: StageRequest, policy: CallPolicy) -> Flight {
        let inner = Arc::clone(&self.inner);
        let guard = FlightGuard {
            inner: Arc::downgrade(&self.inner),
            key: key.clone(),
            id,
        };
        async move {
            let _guard = guard;
            inner.fly(key, request, policy).await
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    async fn fly(
        &self,
        key: CacheKey,
        request: StageRequest,
        policy: CallPolicy,
    ) -> Result<StageResult, PipelineError> {
        let started = Instant::now();
        let stage = request.stage();
        let model = request.model().to_string();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if let Err(e) = self.limiter.acquire(&model).await {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%stage, model = %model, error = %e, "rate limiter refused call");
                return Err(PipelineError::RateLimitTimeout {
                    stage,
                    model,
                    max_wait: e.max_wait,
                });
            }

            self.counters.remote_attempts.fetch_add(1, Ordering::Relaxed);
            let deadline = Instant::now() + policy.call_timeout;
            let outcome =
                tokio::time::timeout_at(deadline, self.client.call(&request, deadline)).await;

            let (error, retry_after) = match outcome {
                Ok(Ok(text)) => {
                    let result = StageResult {
                        text,
                        stage,
                        model: model.clone(),
                        latency: started.elapsed(),
                        attempts: attempt,
                        cache_hit: false,
                    };
                    self.cache.store(key, result.clone(), policy.cache_ttl);
                    tracing::info!(
                        %stage,
                        model = %model,
                        attempt,
                        latency_ms = result.latency.as_millis() as u64,
                        "stage call succeeded"
                    );
                    return Ok(result);
                }
                Ok(Err(CallError::Fatal { message })) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(%stage, model = %model, attempt, error = %message, "fatal provider error");
                    return Err(PipelineError::ProviderFatal {
                        stage,
                        model,
                        message,
                    });
                }
                Ok(Err(CallError::Retryable {
                    message,
                    retry_after,
                })) => (
                    PipelineError::ProviderTransient {
                        stage,
                        model: model.clone(),
                        message,
                    },
                    retry_after,
                ),
                Err(_) => (
                    PipelineError::CallTimeout {
                        stage,
                        model: model.clone(),
                        timeout: policy.call_timeout,
                    },
                    None,
                ),
            };

            if attempt >= max_attempts {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%stage, model = %model, attempts = attempt, error = %error, "retries exhausted");
                return Err(PipelineError::RetriesExhausted {
                    stage,
                    model,
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.retry.backoff(attempt, retry_after);
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                %stage,
                model = %model,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying stage call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// 飞行结束或被全部等待者放弃时，从飞行表移除自身（仅当表中仍是同一次飞行）
struct FlightGuard {
    inner: std::sync::Weak<Inner>,
    key: CacheKey,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inflight = inner.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if inflight.get(&self.key).map(|(id, _)| *id) == Some(self.id) {
            inflight.remove(&self.key);
        }
    }
}
