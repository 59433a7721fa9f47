//! 运行状态机：Idle → Reasoning → Planning → Execution → Completed，任一阶段可进入 Failed
//!
//! 每次转换通过 broadcast 通道发出 RunEvent，供 CLI / 测试观察。

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::stages::StageKind;

/// 单次运行所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum RunPhase {
    Idle,
    Reasoning,
    Planning,
    Execution,
    Completed,
    Failed,
}

impl RunPhase {
    /// 阶段型状态对应的 StageKind
    pub fn stage(self) -> Option<StageKind> {
        match self {
            Self::Reasoning => Some(StageKind::Reasoning),
            Self::Planning => Some(StageKind::Planning),
            Self::Execution => Some(StageKind::Execution),
            _ => None,
        }
    }

    /// 合法转换：严格顺序，不跳过阶段；Failed 只能从三个阶段进入
    pub fn can_advance_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Idle, Reasoning)
                | (Reasoning, Planning)
                | (Planning, Execution)
                | (Execution, Completed)
                | (Reasoning | Planning | Execution, Failed)
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Reasoning => "reasoning",
            Self::Planning => "planning",
            Self::Execution => "execution",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 状态转换事件
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub phase: RunPhase,
}

/// 单次运行的状态机实例（每次 process 新建一个）
pub(crate) struct RunMachine {
    run_id: Uuid,
    phase: Mutex<RunPhase>,
    events: broadcast::Sender<RunEvent>,
}

impl RunMachine {
    pub(crate) fn new(run_id: Uuid, events: broadcast::Sender<RunEvent>) -> Self {
        Self {
            run_id,
            phase: Mutex::new(RunPhase::Idle),
            events,
        }
    }

    pub(crate) fn phase(&self) -> RunPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn advance(&self, next: RunPhase) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if !phase.can_advance_to(next) {
            tracing::error!(run_id = %self.run_id, from = %*phase, to = %next, "illegal run phase transition");
            debug_assert!(false, "illegal run phase transition {} -> {}", *phase, next);
            return;
        }
        *phase = next;
        drop(phase);
        tracing::debug!(run_id = %self.run_id, phase = %next, "run phase");
        // 无订阅者时发送失败，忽略
        let _ = self.events.send(RunEvent {
            run_id: self.run_id,
            phase: next,
        });
    }
}
