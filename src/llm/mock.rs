//! Mock / Scripted 客户端（用于测试与无 API Key 的本地运行）
//!
//! - MockLlmClient：按阶段返回固定文本，保证三阶段解析均能通过
//! - ScriptedLlmClient：按模型排队的脚本化结果（文本 / 错误 / 延迟），并记录调用次数

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::llm::{CallError, LlmClient, StageRequest};
use crate::stages::StageKind;

/// Mock 客户端：阶段感知的确定性回复，不访问网络
#[derive(Debug, Default)]
pub struct MockLlmClient {
    calls: AtomicU64,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn call(&self, request: &StageRequest, _deadline: Instant) -> Result<String, CallError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let text = match request.stage() {
            StageKind::Reasoning => format!(
                "[mock {}] The request is understood. Key concerns: scope, inputs, and the expected output.",
                request.model()
            ),
            StageKind::Planning => {
                "1. Clarify the goal\n2. Gather the relevant inputs\n3. Produce and review the result"
                    .to_string()
            }
            StageKind::Execution => format!(
                "[mock {}] Executed the plan: goal clarified, inputs gathered, result produced and reviewed.",
                request.model()
            ),
        };
        Ok(text)
    }
}

/// 单条脚本化结果
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(String),
    Fail(CallError),
    /// 先等待，再给出内层结果（用于制造超时）
    Delay(Duration, Box<Scripted>),
}

impl Scripted {
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply(text.into())
    }

    pub fn fail(error: CallError) -> Self {
        Self::Fail(error)
    }

    pub fn delayed(delay: Duration, then: Scripted) -> Self {
        Self::Delay(delay, Box::new(then))
    }
}

/// 脚本化客户端：每个模型一条队列，按调用顺序出队；队列最后一条会被重复使用
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, model: impl Into<String>, outcomes: Vec<Scripted>) -> Self {
        self.push(model, outcomes);
        self
    }

    /// 追加脚本
    pub fn push(&self, model: impl Into<String>, outcomes: Vec<Scripted>) {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(model.into())
            .or_default()
            .extend(outcomes);
    }

    /// 某模型被调用的次数
    pub fn calls(&self, model: &str) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(model)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .sum()
    }

    fn next_outcome(&self, model: &str) -> Option<Scripted> {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        let queue = scripts.get_mut(model)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn call(&self, request: &StageRequest, _deadline: Instant) -> Result<String, CallError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(request.model().to_string())
            .or_insert(0) += 1;

        let mut outcome = self
            .next_outcome(request.model())
            .ok_or_else(|| CallError::fatal(format!("no script for model {}", request.model())))?;

        loop {
            match outcome {
                Scripted::Reply(text) => return Ok(text),
                Scripted::Fail(error) => return Err(error),
                Scripted::Delay(delay, then) => {
                    tokio::time::sleep(delay).await;
                    outcome = *then;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(stage: StageKind, model: &str) -> StageRequest {
        StageRequest::new(stage, model, "task")
    }

    #[tokio::test]
    async fn test_mock_plan_is_numbered() {
        let client = MockLlmClient::new();
        let plan = client
            .call(&request(StageKind::Planning, "m"), Instant::now())
            .await
            .unwrap();
        assert!(plan.starts_with("1. "));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_script_order_and_sticky_tail() {
        let client = ScriptedLlmClient::new().with_script(
            "m",
            vec![
                Scripted::fail(CallError::retryable("busy")),
                Scripted::reply("done"),
            ],
        );
        let req = request(StageKind::Reasoning, "m");
        assert!(client.call(&req, Instant::now()).await.is_err());
        assert_eq!(client.call(&req, Instant::now()).await.unwrap(), "done");
        assert_eq!(client.call(&req, Instant::now()).await.unwrap(), "done");
        assert_eq!(client.calls("m"), 3);
    }

    #[tokio::test]
    async fn test_unscripted_model_is_fatal() {
        let client = ScriptedLlmClient::new();
        let err = client
            .call(&request(StageKind::Reasoning, "ghost"), Instant::now())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(client.total_calls(), 1);
    }
}
