//! 数据模型：Task、Context、AgentResponse、HistoryEntry

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::PipelineError;
use crate::stages::StageKind;

/// 调用方提交的任务：自由文本目标 + 可选图片引用（仅透传，不做预处理）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,
}

impl Task {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }
}

/// 键值上下文（领域、熟练度、偏好语言等）；按键有序，保证缓存键与 Prompt 渲染稳定
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(BTreeMap<String, String>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// 合并一组键值，同名键后写覆盖
    pub fn add_context<I, K, V>(&mut self, mapping: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in mapping {
            self.0.insert(k.into(), v.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 渲染为 `key: value` 行
    pub fn to_lines(&self) -> String {
        self.iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut ctx = Context::new();
        ctx.add_context(iter);
        ctx
    }
}

/// 聚合后的最终回复；只有三个阶段全部成功才会构造
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub thought_process: String,
    pub plan: Vec<String>,
    pub action: String,
}

impl AgentResponse {
    pub(crate) fn assemble(
        thought_process: String,
        plan: Vec<String>,
        action: String,
    ) -> Result<Self, PipelineError> {
        if plan.is_empty() {
            return Err(PipelineError::ParseError {
                stage: StageKind::Planning,
                reason: "plan cannot be empty".to_string(),
            });
        }
        Ok(Self {
            thought_process,
            plan,
            action,
        })
    }
}

/// 一次成功运行的历史记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: Uuid,
    pub task: Task,
    pub context: Context,
    pub response: AgentResponse,
    pub timestamp: DateTime<Utc>,
}
