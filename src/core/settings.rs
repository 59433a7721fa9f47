//! 核心使用的静态配置：每阶段模型与参数、各模型限流、重试、整次运行超时
//!
//! 核心不负责加载；由 `config::AppConfig::pipeline_config` 或调用方直接构造。

use std::collections::HashMap;
use std::time::Duration;

use crate::llm::{GenerationParams, RateLimit, RetryPolicy};
use crate::stages::StageKind;

pub const DEFAULT_REASONING_MODEL: &str = "openai/o1-preview";
pub const DEFAULT_PLANNING_MODEL: &str = "anthropic/claude-3.5-sonnet:beta";
pub const DEFAULT_EXECUTION_MODEL: &str = "anthropic/claude-3-5-haiku:beta";

/// 单个阶段的模型与调用策略
#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    pub model: String,
    pub params: GenerationParams,
    /// 结果缓存时长；为 0 时不缓存
    pub cache_ttl: Duration,
    /// 单次尝试超时
    pub call_timeout: Duration,
}

impl StageSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            params: GenerationParams::default(),
            cache_ttl: Duration::from_secs(300),
            call_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub reasoning: StageSettings,
    pub planning: StageSettings,
    pub execution: StageSettings,
    /// 模型 → 令牌桶参数；未配置的模型不限流
    pub rate_limits: HashMap<String, RateLimit>,
    pub rate_limit_max_wait: Duration,
    pub retry: RetryPolicy,
    /// 整次运行（三个阶段合计）的截止时长
    pub run_timeout: Duration,
    /// 执行阶段输出的最短字符数
    pub min_action_chars: usize,
    pub cache_max_entries: Option<usize>,
}

impl PipelineConfig {
    pub fn stage(&self, kind: StageKind) -> &StageSettings {
        match kind {
            StageKind::Reasoning => &self.reasoning,
            StageKind::Planning => &self.planning,
            StageKind::Execution => &self.execution,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let rate_limits = HashMap::from([
            (DEFAULT_REASONING_MODEL.to_string(), RateLimit::new(5, 1.0)),
            (DEFAULT_PLANNING_MODEL.to_string(), RateLimit::per_minute(50, 3)),
            (DEFAULT_EXECUTION_MODEL.to_string(), RateLimit::per_minute(50, 3)),
        ]);

        Self {
            reasoning: StageSettings::new(DEFAULT_REASONING_MODEL)
                .with_cache_ttl(Duration::from_secs(3600)),
            planning: StageSettings::new(DEFAULT_PLANNING_MODEL),
            execution: StageSettings::new(DEFAULT_EXECUTION_MODEL).with_params(GenerationParams {
                temperature: 0.5,
                ..GenerationParams::default()
            }),
            rate_limits,
            rate_limit_max_wait: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            run_timeout: Duration::from_secs(120),
            min_action_chars: 10,
            cache_max_entries: None,
        }
    }
}
