//! 远端模型调用抽象
//!
//! 所有后端（OpenAI 兼容 / OpenRouter / Mock / Scripted）实现 LlmClient：
//! call(request, deadline) 返回生成文本，或区分可重试 / 致命的 CallError。

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::time::Instant;

use crate::llm::StageRequest;

/// 远端调用失败：Retryable（超时、过载、429、5xx）/ Fatal（鉴权、非法请求）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("transient provider error: {message}")]
    Retryable {
        message: String,
        /// 服务端建议的最短等待
        retry_after: Option<Duration>,
    },

    #[error("fatal provider error: {message}")]
    Fatal { message: String },
}

impl CallError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// 按服务端返回的错误码 / 错误类型分类（如 `invalid_api_key`、`rate_limit_exceeded`）
    ///
    /// 未知的码返回 None，交给文本分类处理。
    pub fn from_code(code: &str, message: &str) -> Option<Self> {
        const FATAL_CODES: &[&str] = &[
            "invalid_api_key",
            "invalid_request_error",
            "authentication_error",
            "permission_error",
            "not_found_error",
            "model_not_found",
            "context_length_exceeded",
            "insufficient_quota",
            "unsupported_country_region_territory",
        ];
        const TRANSIENT_CODES: &[&str] = &[
            "rate_limit_exceeded",
            "rate_limit_error",
            "server_error",
            "overloaded_error",
            "api_error",
            "timeout",
        ];

        let code = code.trim().to_lowercase();
        if FATAL_CODES.contains(&code.as_str()) {
            Some(Self::fatal(message))
        } else if TRANSIENT_CODES.contains(&code.as_str()) {
            Some(Self::retryable(message))
        } else {
            code.parse::<u16>()
                .ok()
                .map(|status| Self::from_status(status, message))
        }
    }

    /// 按 HTTP 状态码分类：408 / 409 / 425 / 429 / 5xx 可重试，其余 4xx 致命
    pub fn from_status(status: u16, message: &str) -> Self {
        match status {
            408 | 409 | 425 | 429 | 500..=599 => Self::retryable(message),
            400..=499 => Self::fatal(message),
            _ => Self::retryable(message),
        }
    }

    /// 按错误文本启发式分类（结构化信息缺失时的兜底）
    ///
    /// 先看鉴权 / 非法请求等致命特征，再看独立成词的 HTTP 状态码；
    /// 其余（网络、超时、过载、未知）按可重试处理，由重试预算兜底。
    pub fn classify(message: &str) -> Self {
        static STATUS: OnceLock<Regex> = OnceLock::new();
        let status = STATUS.get_or_init(|| Regex::new(r"\b([45]\d{2})\b").unwrap());
        let lower = message.to_lowercase();

        const FATAL: &[&str] = &[
            "unauthorized",
            "forbidden",
            "invalid api key",
            "incorrect api key",
            "invalid_api_key",
            "no auth credentials",
            "authentication",
            "permission denied",
            "bad request",
            "invalid request",
            "invalid_request_error",
            "model not found",
            "model_not_found",
            "does not exist",
            "context length",
            "context_length_exceeded",
            "maximum context length",
            "insufficient_quota",
        ];
        if FATAL.iter().any(|p| lower.contains(p)) {
            return Self::fatal(message);
        }
        if let Some(code) = status
            .captures(&lower)
            .and_then(|c| c[1].parse::<u16>().ok())
        {
            return Self::from_status(code, message);
        }
        // 网络、超时、过载及未知错误
        Self::retryable(message)
    }
}

/// 远端模型客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 发起一次调用；deadline 之后的结果没有意义，实现应尽量在此之前返回
    async fn call(&self, request: &StageRequest, deadline: Instant) -> Result<String, CallError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
