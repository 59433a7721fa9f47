//! 阶段模块：Reasoning / Planning / Execution
//!
//! 三个阶段共用同一能力（render + parse），按 StageKind 分派：
//! render 由任务、上下文与前序阶段输出构造 StageRequest；parse 把 StageResult 解析为结构化输出。

pub mod parse;
pub mod prompts;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{Context, PipelineError, StageSettings, Task};
use crate::llm::{CallPolicy, ResilientCaller, StageRequest, StageResult};

/// 阶段种类（封闭集合）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Reasoning,
    Planning,
    Execution,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::Planning => "planning",
            Self::Execution => "execution",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段解析后的结构化输出
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageOutput {
    Thought(String),
    Plan(Vec<String>),
    Action(String),
}

impl StageOutput {
    pub fn into_thought(self) -> Option<String> {
        match self {
            Self::Thought(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_plan(self) -> Option<Vec<String>> {
        match self {
            Self::Plan(steps) => Some(steps),
            _ => None,
        }
    }

    pub fn into_action(self) -> Option<String> {
        match self {
            Self::Action(text) => Some(text),
            _ => None,
        }
    }
}

/// 前序阶段的输出（Planning 需要 thought，Execution 需要 thought + plan）
#[derive(Clone, Debug, Default)]
pub struct PriorOutputs<'a> {
    pub thought: Option<&'a str>,
    pub plan: Option<&'a [String]>,
}

/// 单个阶段：种类 + 模型配置
#[derive(Clone, Debug)]
pub struct StageModule {
    kind: StageKind,
    settings: StageSettings,
    min_action_chars: usize,
}

impl StageModule {
    pub fn new(kind: StageKind, settings: StageSettings) -> Self {
        Self {
            kind,
            settings,
            min_action_chars: 10,
        }
    }

    pub fn with_min_action_chars(mut self, min: usize) -> Self {
        self.min_action_chars = min;
        self
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    pub fn policy(&self) -> CallPolicy {
        CallPolicy {
            call_timeout: self.settings.call_timeout,
            cache_ttl: self.settings.cache_ttl,
        }
    }

    pub fn render(&self, task: &Task, context: &Context, prior: &PriorOutputs<'_>) -> StageRequest {
        let thought = prior.thought.unwrap_or_default();
        let (system, prompt) = match self.kind {
            StageKind::Reasoning => (
                prompts::REASONING_SYSTEM,
                prompts::reasoning_prompt(task, context),
            ),
            StageKind::Planning => (
                prompts::PLANNING_SYSTEM,
                prompts::planning_prompt(task, context, thought),
            ),
            StageKind::Execution => (
                prompts::EXECUTION_SYSTEM,
                prompts::execution_prompt(task, context, thought, prior.plan.unwrap_or_default()),
            ),
        };

        StageRequest::new(self.kind, self.settings.model.clone(), prompt)
            .with_system_prompt(system)
            .with_context(context.clone())
            .with_image(task.image())
            .with_params(self.settings.params)
    }

    pub fn parse(&self, result: &StageResult) -> Result<StageOutput, PipelineError> {
        let parsed = match self.kind {
            StageKind::Reasoning => parse::thought(&result.text).map(StageOutput::Thought),
            StageKind::Planning => parse::plan_steps(&result.text).map(StageOutput::Plan),
            StageKind::Execution => {
                parse::action(&result.text, self.min_action_chars).map(StageOutput::Action)
            }
        };
        parsed.map_err(|reason| PipelineError::ParseError {
            stage: self.kind,
            reason,
        })
    }

    /// render → invoke → parse
    pub async fn run(
        &self,
        caller: &ResilientCaller,
        task: &Task,
        context: &Context,
        prior: &PriorOutputs<'_>,
    ) -> Result<StageOutput, PipelineError> {
        let request = self.render(task, context, prior);
        let key = request.cache_key();
        let result = caller.invoke(request, self.policy()).await?;
        tracing::debug!(
            stage = %self.kind,
            model = %result.model,
            attempts = result.attempts,
            cache_hit = result.cache_hit,
            "stage result received"
        );
        self.parse(&result).inspect_err(|err| {
            // 不合格的输出不留在缓存里
            if caller.cache().remove(&key) {
                tracing::debug!(stage = %self.kind, error = %err, "evicted unparseable result");
            }
        })
    }
}
