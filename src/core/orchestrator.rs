//! Agent 编排器：固定的三阶段流水线
//!
//! 负责：快照上下文、依次驱动 Reasoning → Planning → Execution、执行整次运行的截止时间与外部取消、
//! 成功时聚合 AgentResponse 并写入历史、每次状态转换广播 RunEvent。
//! 缓存、限流器与客户端作为显式对象传入，同一进程内可并存多个独立配置的编排器。

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::state::RunMachine;
use crate::core::{
    AgentResponse, Context, HistoryEntry, PipelineConfig, PipelineError, RunEvent, RunPhase,
    RunSupervisor, Task,
};
use crate::llm::{
    create_openrouter_client, CacheStats, LlmClient, MockLlmClient, OpenAiClient, RateLimiter,
    ResilienceStats, ResilientCaller, ResponseCache,
};
use crate::memory::History;
use crate::stages::{PriorOutputs, StageKind, StageModule};

/// 事件通道容量；慢订阅者只会丢事件，不阻塞运行
const EVENT_CAPACITY: usize = 64;

/// 根据配置与环境变量选择 LLM 后端（OpenRouter / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var(&cfg.llm.api_key_env).ok();

    match (provider.as_str(), api_key) {
        ("mock", _) => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
        ("openrouter", Some(key)) if cfg.llm.base_url.is_none() => {
            tracing::info!("Using OpenRouter LLM");
            Arc::new(create_openrouter_client(Some(&key)))
        }
        (_, Some(key)) => {
            let base = cfg.llm.base_url.as_deref();
            tracing::info!(base_url = base.unwrap_or("default"), "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(base, Some(&key)))
        }
        (_, None) => {
            tracing::warn!(
                env = %cfg.llm.api_key_env,
                "No API key set, using Mock LLM"
            );
            Arc::new(MockLlmClient::new())
        }
    }
}

pub struct Orchestrator {
    reasoning: StageModule,
    planning: StageModule,
    execution: StageModule,
    caller: ResilientCaller,
    run_timeout: Duration,
    /// 调用方通过 add_context 累积的上下文，run() 使用
    context: RwLock<Context>,
    history: History,
    supervisor: RunSupervisor,
    events: broadcast::Sender<RunEvent>,
}

impl Orchestrator {
    /// 按配置新建独享的缓存与限流器
    pub fn new(config: PipelineConfig, client: Arc<dyn LlmClient>) -> Self {
        let cache = Arc::new(match config.cache_max_entries {
            Some(max) => ResponseCache::with_max_entries(max),
            None => ResponseCache::new(),
        });
        let limiter = Arc::new(RateLimiter::new(
            &config.rate_limits,
            config.rate_limit_max_wait,
        ));
        Self::with_shared(config, client, cache, limiter)
    }

    /// 使用外部传入的缓存与限流器（多个编排器可共享同一配额）
    pub fn with_shared(
        config: PipelineConfig,
        client: Arc<dyn LlmClient>,
        cache: Arc<ResponseCache>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let stage = |kind: StageKind| {
            StageModule::new(kind, config.stage(kind).clone())
                .with_min_action_chars(config.min_action_chars)
        };
        Self {
            reasoning: stage(StageKind::Reasoning),
            planning: stage(StageKind::Planning),
            execution: stage(StageKind::Execution),
            caller: ResilientCaller::new(client, cache, limiter, config.retry.clone()),
            run_timeout: config.run_timeout,
            context: RwLock::new(Context::new()),
            history: History::new(),
            supervisor: RunSupervisor::new(),
            events,
        }
    }

    /// 订阅阶段转换事件
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// 合并调用方上下文（同名键覆盖）；只影响之后开始的运行
    pub fn add_context<I, K, V>(&self, mapping: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.context
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .add_context(mapping);
    }

    pub fn context(&self) -> Context {
        self.context
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn stage(&self, kind: StageKind) -> &StageModule {
        match kind {
            StageKind::Reasoning => &self.reasoning,
            StageKind::Planning => &self.planning,
            StageKind::Execution => &self.execution,
        }
    }

    /// 使用编排器持有的上下文处理任务
    pub async fn run(&self, task: Task) -> Result<AgentResponse, PipelineError> {
        let context = self.context();
        self.process(task, &context).await
    }

    /// 使用配置的 run_timeout 处理任务
    pub async fn process(
        &self,
        task: Task,
        context: &Context,
    ) -> Result<AgentResponse, PipelineError> {
        self.process_with_deadline(task, context, self.run_timeout)
            .await
    }

    /// 处理任务；limit 为三个阶段合计的截止时长
    ///
    /// 要么返回完整的 AgentResponse，要么返回一个带阶段信息的错误；失败时不写历史。
    pub async fn process_with_deadline(
        &self,
        task: Task,
        context: &Context,
        limit: Duration,
    ) -> Result<AgentResponse, PipelineError> {
        if task.text().trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "task text must not be empty".to_string(),
            ));
        }

        let run_id = Uuid::new_v4();
        let context = context.clone();
        let machine = RunMachine::new(run_id, self.events.clone());
        let (cancel, _active) = self.supervisor.begin_run();
        let deadline = Instant::now() + limit;
        let span = tracing::info_span!("run", %run_id);

        let outcome = async {
            tracing::info!(limit_ms = limit.as_millis() as u64, "run started");
            machine.advance(RunPhase::Reasoning);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PipelineError::Cancelled {
                    phase: machine.phase(),
                }),
                res = tokio::time::timeout_at(deadline, self.run_stages(&machine, &task, &context)) => {
                    res.unwrap_or_else(|_| Err(PipelineError::RunTimeout {
                        phase: machine.phase(),
                        limit,
                    }))
                }
            }
        }
        .instrument(span)
        .await;

        match outcome {
            Ok(response) => {
                self.history.append(HistoryEntry {
                    run_id,
                    task,
                    context,
                    response: response.clone(),
                    timestamp: Utc::now(),
                });
                machine.advance(RunPhase::Completed);
                tracing::info!(%run_id, steps = response.plan.len(), "run completed");
                Ok(response)
            }
            Err(err) => {
                machine.advance(RunPhase::Failed);
                tracing::warn!(%run_id, error = %err, "run failed");
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        machine: &RunMachine,
        task: &Task,
        context: &Context,
    ) -> Result<AgentResponse, PipelineError> {
        let thought = self
            .reasoning
            .run(&self.caller, task, context, &PriorOutputs::default())
            .await?
            .into_thought()
            .ok_or_else(|| mismatched(StageKind::Reasoning))?;

        machine.advance(RunPhase::Planning);
        let prior = PriorOutputs {
            thought: Some(&thought),
            plan: None,
        };
        let plan = self
            .planning
            .run(&self.caller, task, context, &prior)
            .await?
            .into_plan()
            .ok_or_else(|| mismatched(StageKind::Planning))?;

        machine.advance(RunPhase::Execution);
        let prior = PriorOutputs {
            thought: Some(&thought),
            plan: Some(&plan),
        };
        let action = self
            .execution
            .run(&self.caller, task, context, &prior)
            .await?
            .into_action()
            .ok_or_else(|| mismatched(StageKind::Execution))?;

        AgentResponse::assemble(thought, plan, action)
    }

    /// 历史快照（按完成顺序）
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.snapshot()
    }

    pub fn clear_history(&self) {
        self.history.clear();
    }

    /// 取消所有在途运行，返回受影响的运行数
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.supervisor.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelling in-flight runs");
        }
        cancelled
    }

    pub fn active_runs(&self) -> usize {
        self.supervisor.active_runs()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.caller.cache().stats()
    }

    pub fn resilience_stats(&self) -> ResilienceStats {
        self.caller.stats()
    }

    /// 底层客户端的累计 token 用量
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.caller.client().token_usage()
    }
}

fn mismatched(stage: StageKind) -> PipelineError {
    PipelineError::ParseError {
        stage,
        reason: "stage produced an output of the wrong kind".to_string(),
    }
}
