//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 OpenRouter、OpenAI、自建代理等。
//! 模型名取自每个 StageRequest，同一客户端可服务三个阶段。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::{ApiError, OpenAIError};
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::llm::{CallError, LlmClient, StageRequest};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：StageRequest → system + user 消息，取首条 choice 的 content
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            usage: TokenUsage::new(),
        }
    }

    fn to_openai_messages(
        request: &StageRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, CallError> {
        let mut messages = Vec::with_capacity(2);

        if !request.system_prompt().is_empty() {
            let system = ChatCompletionRequestSystemMessageArgs::default()
                .content(request.system_prompt())
                .build()
                .map_err(|e| CallError::fatal(e.to_string()))?;
            messages.push(ChatCompletionRequestMessage::System(system));
        }

        // 图片只作为引用透传
        let content = match request.image() {
            Some(image) => format!("{}\n\nAttached image: {}", request.prompt(), image),
            None => request.prompt().to_string(),
        };
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map_err(|e| CallError::fatal(e.to_string()))?;
        messages.push(ChatCompletionRequestMessage::User(user));

        Ok(messages)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn call(&self, request: &StageRequest, deadline: Instant) -> Result<String, CallError> {
        let params = request.params();
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(request.model())
            .messages(Self::to_openai_messages(request)?)
            .temperature(params.temperature)
            .top_p(params.top_p);
        if let Some(max_tokens) = params.max_tokens {
            args.max_completion_tokens(max_tokens);
        }
        let body = args.build().map_err(|e| CallError::fatal(e.to_string()))?;

        let response = tokio::time::timeout_at(deadline, self.client.chat().create(body))
            .await
            .map_err(|_| CallError::retryable("request timed out"))?
            .map_err(|e| classify_openai_error(&e))?;

        // 提取 token 使用统计
        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(CallError::retryable(format!(
                "empty completion content from {}",
                request.model()
            )));
        }
        Ok(content)
    }
}

/// async_openai 错误分类：结构化字段优先，文本兜底
fn classify_openai_error(err: &OpenAIError) -> CallError {
    let message = err.to_string();
    match err {
        OpenAIError::ApiError(api) => classify_api_error(api, &message),
        OpenAIError::Reqwest(e) => {
            if let Some(status) = e.status() {
                CallError::from_status(status.as_u16(), &message)
            } else if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                CallError::retryable(message)
            } else {
                CallError::classify(&message)
            }
        }
        OpenAIError::InvalidArgument(_) => CallError::fatal(message),
        _ => CallError::classify(&message),
    }
}

fn classify_api_error(api: &ApiError, message: &str) -> CallError {
    api.code
        .as_deref()
        .and_then(|code| CallError::from_code(code, message))
        .or_else(|| {
            api.r#type
                .as_deref()
                .and_then(|kind| CallError::from_code(kind, message))
        })
        .unwrap_or_else(|| CallError::classify(message))
}
