//! 核心编排层：数据模型、错误与恢复、运行状态机、运行监管、主控流水线

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod settings;
pub mod state;
pub mod supervisor;
pub mod types;

pub use error::PipelineError;
pub use orchestrator::{create_llm_from_config, Orchestrator};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use settings::{
    PipelineConfig, StageSettings, DEFAULT_EXECUTION_MODEL, DEFAULT_PLANNING_MODEL,
    DEFAULT_REASONING_MODEL,
};
pub use state::{RunEvent, RunPhase};
pub use supervisor::{ActiveRun, RunSupervisor};
pub use types::{AgentResponse, Context, HistoryEntry, Task};
