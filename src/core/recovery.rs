//! 错误恢复引擎
//!
//! 根据 PipelineError 类型返回 RecoveryAction，供调用方决定是整体重跑、改写任务、修正配置还是终止。

use std::time::Duration;

use crate::core::PipelineError;

/// 恢复动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待后整体重跑一次
    RetryRun { after: Duration },
    /// 模型输出不合格：提示调用方改写任务后再试
    Rephrase(String),
    /// 远端拒绝请求：鉴权 / 模型名 / 参数需要修正
    FixConfiguration(String),
    Abort,
}

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &PipelineError) -> RecoveryAction {
        match err {
            PipelineError::RateLimitTimeout { max_wait, .. } => RecoveryAction::RetryRun {
                after: *max_wait,
            },
            PipelineError::RunTimeout { .. } => RecoveryAction::RetryRun {
                after: Duration::ZERO,
            },
            PipelineError::RetriesExhausted { last, .. } if last.is_retryable() => {
                RecoveryAction::RetryRun {
                    after: Duration::from_secs(5),
                }
            }
            PipelineError::ParseError { stage, reason } => RecoveryAction::Rephrase(format!(
                "The {stage} stage produced unusable output ({reason}). \
                 Try a more specific task description."
            )),
            PipelineError::ProviderFatal { model, message, .. } => {
                RecoveryAction::FixConfiguration(format!(
                    "Provider rejected model '{model}': {message}. Check the API key and model name."
                ))
            }
            _ => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunPhase;
    use crate::stages::StageKind;

    #[test]
    fn test_recovery_rate_limit_waits() {
        let engine = RecoveryEngine::new();
        let err = PipelineError::RateLimitTimeout {
            stage: StageKind::Reasoning,
            model: "m".into(),
            max_wait: Duration::from_secs(30),
        };
        assert_eq!(
            engine.handle(&err),
            RecoveryAction::RetryRun {
                after: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn test_recovery_run_timeout() {
        let engine = RecoveryEngine::new();
        let err = PipelineError::RunTimeout {
            phase: RunPhase::Planning,
            limit: Duration::from_secs(2),
        };
        assert!(matches!(engine.handle(&err), RecoveryAction::RetryRun { .. }));
    }

    #[test]
    fn test_recovery_parse_error() {
        let engine = RecoveryEngine::new();
        let err = PipelineError::ParseError {
            stage: StageKind::Execution,
            reason: "too short".into(),
        };
        match engine.handle(&err) {
            RecoveryAction::Rephrase(msg) => assert!(msg.contains("execution")),
            other => panic!("Expected Rephrase, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_fatal_needs_configuration() {
        let engine = RecoveryEngine::new();
        let err = PipelineError::ProviderFatal {
            stage: StageKind::Planning,
            model: "bad/model".into(),
            message: "404 model not found".into(),
        };
        match engine.handle(&err) {
            RecoveryAction::FixConfiguration(msg) => assert!(msg.contains("bad/model")),
            other => panic!("Expected FixConfiguration, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_exhausted_fatal_cause_aborts() {
        let engine = RecoveryEngine::new();
        let err = PipelineError::RetriesExhausted {
            stage: StageKind::Planning,
            model: "m".into(),
            attempts: 1,
            last: Box::new(PipelineError::InvalidInput("x".into())),
        };
        assert_eq!(engine.handle(&err), RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_cancelled() {
        let engine = RecoveryEngine::new();
        let err = PipelineError::Cancelled {
            phase: RunPhase::Reasoning,
        };
        assert_eq!(engine.handle(&err), RecoveryAction::Abort);
    }
}
