//! OpenRouter 客户端（OpenAI 兼容格式）
//!
//! OpenRouter 以统一的 OpenAI 兼容接口聚合多家模型，模型名形如 `openai/o1-preview`、
//! `anthropic/claude-3.5-sonnet:beta`，三个阶段可共用同一客户端。
//! - Base URL: https://openrouter.ai/api/v1

use crate::llm::OpenAiClient;

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const OPENROUTER_API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// 创建 OpenRouter 客户端
///
/// - 未显式传入 key 时读取环境变量 `OPENROUTER_API_KEY`，再退回 `OPENAI_API_KEY`
pub fn create_openrouter_client(api_key: Option<&str>) -> OpenAiClient {
    let api_key = api_key
        .map(String::from)
        .or_else(|| std::env::var(OPENROUTER_API_KEY_ENV).ok())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());

    OpenAiClient::new(Some(OPENROUTER_BASE_URL), api_key.as_deref())
}
