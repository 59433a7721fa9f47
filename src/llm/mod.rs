//! LLM 层：客户端抽象与实现（OpenAI 兼容 / OpenRouter / Mock），以及缓存、限流、重试与弹性调用

pub mod cache;
pub mod mock;
pub mod openai;
pub mod openrouter;
pub mod rate_limiter;
pub mod request;
pub mod resilient;
pub mod retry;
pub mod traits;

pub use cache::{CacheStats, ResponseCache};
pub use mock::{MockLlmClient, Scripted, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use openrouter::{create_openrouter_client, OPENROUTER_API_KEY_ENV, OPENROUTER_BASE_URL};
pub use rate_limiter::{RateLimit, RateLimitExceeded, RateLimiter, RatePermit};
pub use request::{CacheKey, GenerationParams, StageRequest, StageResult};
pub use resilient::{CallPolicy, ResilienceStats, ResilientCaller};
pub use retry::RetryPolicy;
pub use traits::{CallError, LlmClient};
