//! 流水线错误类型
//!
//! 单次调用失败（超时 / 瞬时 / 致命）在 ResilientCaller 内部重试，耗尽后以 RetriesExhausted 上抛；
//! 解析失败、整次运行超时、取消各自独立成类。与 RecoveryEngine 配合决定调用方是否整体重跑。

use std::time::Duration;

use thiserror::Error;

use crate::core::RunPhase;
use crate::stages::StageKind;

/// 一次流水线运行可能出现的错误；携带阶段、模型、尝试次数，便于调用方诊断
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("{stage} call to {model} timed out after {timeout:?}")]
    CallTimeout {
        stage: StageKind,
        model: String,
        timeout: Duration,
    },

    #[error("{stage} call to {model} failed transiently: {message}")]
    ProviderTransient {
        stage: StageKind,
        model: String,
        message: String,
    },

    #[error("{stage} call to {model} rejected by provider: {message}")]
    ProviderFatal {
        stage: StageKind,
        model: String,
        message: String,
    },

    /// 本地限流器在最大等待时间内无法放行
    #[error("{stage} call to {model} not admitted by rate limiter within {max_wait:?}")]
    RateLimitTimeout {
        stage: StageKind,
        model: String,
        max_wait: Duration,
    },

    #[error("{stage} call to {model} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        stage: StageKind,
        model: String,
        attempts: u32,
        #[source]
        last: Box<PipelineError>,
    },

    /// 远端调用成功，但输出不符合阶段要求的结构
    #[error("{stage} output could not be parsed: {reason}")]
    ParseError { stage: StageKind, reason: String },

    #[error("run exceeded its {limit:?} deadline during {phase}")]
    RunTimeout { phase: RunPhase, limit: Duration },

    #[error("run cancelled during {phase}")]
    Cancelled { phase: RunPhase },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl PipelineError {
    /// 出错的阶段；运行级错误取发生时所处阶段
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            Self::CallTimeout { stage, .. }
            | Self::ProviderTransient { stage, .. }
            | Self::ProviderFatal { stage, .. }
            | Self::RateLimitTimeout { stage, .. }
            | Self::RetriesExhausted { stage, .. }
            | Self::ParseError { stage, .. } => Some(*stage),
            Self::RunTimeout { phase, .. } | Self::Cancelled { phase } => phase.stage(),
            Self::InvalidInput(_) => None,
        }
    }

    /// 目标模型（仅调用相关错误有）
    pub fn model(&self) -> Option<&str> {
        match self {
            Self::CallTimeout { model, .. }
            | Self::ProviderTransient { model, .. }
            | Self::ProviderFatal { model, .. }
            | Self::RateLimitTimeout { model, .. }
            | Self::RetriesExhausted { model, .. } => Some(model),
            _ => None,
        }
    }

    /// 单次调用层面是否可重试（由 ResilientCaller 使用）
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CallTimeout { .. } | Self::ProviderTransient { .. })
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
