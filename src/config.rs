//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TRIAD__*` 覆盖（双下划线表示嵌套，如 `TRIAD__LLM__PROVIDER=mock`）。
//! `pipeline_config()` 校验后转换为核心使用的静态 PipelineConfig。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;

use crate::core::{
    PipelineConfig, StageSettings, DEFAULT_EXECUTION_MODEL, DEFAULT_PLANNING_MODEL,
    DEFAULT_REASONING_MODEL,
};
use crate::llm::{GenerationParams, RateLimit, RetryPolicy, OPENROUTER_API_KEY_ENV};
use crate::stages::StageKind;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub stages: StagesSection,
    /// 模型名 → 令牌桶；整表出现时替换默认限额
    pub rate_limits: Option<HashMap<String, RateLimitSection>>,
    pub resilience: ResilienceSection,
    pub pipeline: PipelineSection,
    pub history: HistorySection,
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openrouter / openai / mock；无 API Key 时回退为 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_provider() -> String {
    "openrouter".to_string()
}

fn default_api_key_env() -> String {
    OPENROUTER_API_KEY_ENV.to_string()
}

/// [stages.*] 段：未设置的字段取各阶段默认值
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StagesSection {
    pub reasoning: StageSection,
    pub planning: StageSection,
    pub execution: StageSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StageSection {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub cache_ttl_secs: Option<u64>,
    pub call_timeout_secs: Option<u64>,
}

/// [rate_limits."<model>"] 段
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitSection {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

/// [resilience] 段：重试、限流等待上限、缓存容量
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    #[serde(default = "default_rate_limit_max_wait_ms")]
    pub rate_limit_max_wait_ms: u64,
    pub cache_max_entries: Option<usize>,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            rate_limit_max_wait_ms: default_rate_limit_max_wait_ms(),
            cache_max_entries: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_rate_limit_max_wait_ms() -> u64 {
    30_000
}

/// [pipeline] 段：整次运行超时、执行输出最短长度
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_min_action_chars")]
    pub min_action_chars: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            run_timeout_secs: default_run_timeout_secs(),
            min_action_chars: default_min_action_chars(),
        }
    }
}

fn default_run_timeout_secs() -> u64 {
    120
}

fn default_min_action_chars() -> usize {
    10
}

/// [history] 段：导出目录与保留文件数
#[derive(Debug, Clone, Deserialize)]
pub struct HistorySection {
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    #[serde(default = "default_keep_files")]
    pub keep_files: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            export_dir: default_export_dir(),
            keep_files: default_keep_files(),
        }
    }
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("history")
}

fn default_keep_files() -> usize {
    10
}

impl AppConfig {
    /// 校验并转换为核心配置；参数越界时返回 ConfigError::Message
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        let defaults = PipelineConfig::default();

        let reasoning = stage_settings(
            StageKind::Reasoning,
            &self.stages.reasoning,
            &defaults.reasoning,
        )?;
        let planning = stage_settings(
            StageKind::Planning,
            &self.stages.planning,
            &defaults.planning,
        )?;
        let execution = stage_settings(
            StageKind::Execution,
            &self.stages.execution,
            &defaults.execution,
        )?;

        let rate_limits = match &self.rate_limits {
            Some(table) => {
                let mut limits = HashMap::with_capacity(table.len());
                for (model, section) in table {
                    if section.capacity == 0 {
                        return Err(invalid(format!(
                            "rate_limits.\"{model}\".capacity must be at least 1"
                        )));
                    }
                    if !section.refill_per_sec.is_finite() || section.refill_per_sec <= 0.0 {
                        return Err(invalid(format!(
                            "rate_limits.\"{model}\".refill_per_sec must be positive"
                        )));
                    }
                    limits.insert(
                        model.clone(),
                        RateLimit::new(section.capacity, section.refill_per_sec),
                    );
                }
                limits
            }
            None => defaults.rate_limits,
        };

        let r = &self.resilience;
        if r.max_attempts == 0 {
            return Err(invalid("resilience.max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&r.jitter_factor) {
            return Err(invalid("resilience.jitter_factor must be within [0, 1]"));
        }
        if r.base_delay_ms > r.max_delay_ms {
            return Err(invalid(
                "resilience.base_delay_ms must not exceed resilience.max_delay_ms",
            ));
        }
        if self.pipeline.run_timeout_secs == 0 {
            return Err(invalid("pipeline.run_timeout_secs must be positive"));
        }

        Ok(PipelineConfig {
            reasoning,
            planning,
            execution,
            rate_limits,
            rate_limit_max_wait: Duration::from_millis(r.rate_limit_max_wait_ms),
            retry: RetryPolicy {
                max_attempts: r.max_attempts,
                base_delay: Duration::from_millis(r.base_delay_ms),
                max_delay: Duration::from_millis(r.max_delay_ms),
                jitter_factor: r.jitter_factor,
            },
            run_timeout: Duration::from_secs(self.pipeline.run_timeout_secs),
            min_action_chars: self.pipeline.min_action_chars,
            cache_max_entries: r.cache_max_entries,
        })
    }
}

fn stage_settings(
    kind: StageKind,
    section: &StageSection,
    defaults: &StageSettings,
) -> Result<StageSettings, ConfigError> {
    let params = GenerationParams {
        temperature: section.temperature.unwrap_or(defaults.params.temperature),
        top_p: section.top_p.unwrap_or(defaults.params.top_p),
        max_tokens: section.max_tokens.or(defaults.params.max_tokens),
    };
    if !(0.0..=2.0).contains(&params.temperature) {
        return Err(invalid(format!(
            "stages.{kind}.temperature must be within [0, 2], got {}",
            params.temperature
        )));
    }
    if !(0.0..=1.0).contains(&params.top_p) {
        return Err(invalid(format!(
            "stages.{kind}.top_p must be within [0, 1], got {}",
            params.top_p
        )));
    }
    if section.max_tokens == Some(0) {
        return Err(invalid(format!("stages.{kind}.max_tokens must be positive")));
    }

    let model = section
        .model
        .clone()
        .unwrap_or_else(|| defaults.model.clone());
    if model.trim().is_empty() {
        return Err(invalid(format!("stages.{kind}.model must not be empty")));
    }

    let call_timeout = section
        .call_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.call_timeout);
    if call_timeout.is_zero() {
        return Err(invalid(format!(
            "stages.{kind}.call_timeout_secs must be positive"
        )));
    }

    Ok(StageSettings::new(model)
        .with_params(params)
        .with_cache_ttl(
            section
                .cache_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
        )
        .with_call_timeout(call_timeout))
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Message(message.into())
}

/// 加载配置：config/default.toml（若存在）→ 显式路径（必须存在）→ `TRIAD__*` 环境变量
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TRIAD")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
