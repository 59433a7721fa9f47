//! Triad - 三段式多模型 Agent 流水线
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量），转换为核心使用的 PipelineConfig
//! - **core**: 编排器、运行状态机、错误类型、恢复建议、运行监管
//! - **llm**: 远端模型调用抽象与韧性层（限流、缓存、重试、单飞）
//! - **memory**: 运行历史与 JSON 导出
//! - **observability**: 日志初始化
//! - **stages**: 推理 / 规划 / 执行三个阶段的 Prompt 渲染与结果解析

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod stages;

pub use crate::core::{AgentResponse, Context, Orchestrator, PipelineConfig, PipelineError, Task};
pub use crate::stages::StageKind;
