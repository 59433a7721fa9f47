//! 流水线集成测试：三阶段编排、缓存、单飞、重试、限流、截止时间与取消
//!
//! 全部使用暂停时钟（start_paused），延迟由 ScriptedLlmClient 制造。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use triad::core::{
    PipelineConfig, PipelineError, RecoveryAction, RecoveryEngine, RunPhase, StageSettings,
};
use triad::llm::{
    CallError, RateLimit, RateLimiter, ResponseCache, RetryPolicy, Scripted, ScriptedLlmClient,
};
use triad::{Context, Orchestrator, StageKind, Task};

const REASONER: &str = "test/reasoner";
const PLANNER: &str = "test/planner";
const EXECUTOR: &str = "test/executor";

const THOUGHT: &str = "Q1 revenue, costs and margins need to be compared against Q4.";
const PLAN: &str = "Here is the plan:\n1. Collect the Q1 figures\n2. Compare them with Q4\n   and note outliers\n3. Write the summary";
const ACTION: &str = "Q1 revenue grew 12% while costs stayed flat; margins improved by 3 points.";

fn config() -> PipelineConfig {
    PipelineConfig {
        reasoning: StageSettings::new(REASONER),
        planning: StageSettings::new(PLANNER),
        execution: StageSettings::new(EXECUTOR),
        rate_limits: HashMap::new(),
        retry: RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        },
        ..PipelineConfig::default()
    }
}

fn client() -> ScriptedLlmClient {
    ScriptedLlmClient::new()
        .with_script(REASONER, vec![Scripted::reply(THOUGHT)])
        .with_script(PLANNER, vec![Scripted::reply(PLAN)])
        .with_script(EXECUTOR, vec![Scripted::reply(ACTION)])
}

fn orchestrator(client: &Arc<ScriptedLlmClient>) -> Orchestrator {
    Orchestrator::new(config(), client.clone())
}

#[tokio::test(start_paused = true)]
async fn test_summarize_q1_all_stages_succeed() {
    let client = Arc::new(client());
    let orchestrator = orchestrator(&client);

    let response = orchestrator
        .process(Task::new("Summarize Q1 results"), &Context::new())
        .await
        .unwrap();

    assert_eq!(response.thought_process, THOUGHT);
    assert_eq!(
        response.plan,
        vec![
            "Collect the Q1 figures",
            "Compare them with Q4 and note outliers",
            "Write the summary",
        ]
    );
    assert_eq!(response.action, ACTION);

    let history = orchestrator.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].task.text(), "Summarize Q1 results");
    assert_eq!(history[0].response, response);
    assert!(history[0].context.is_empty());
    assert_eq!(client.total_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_planning_times_out_twice_then_succeeds() {
    // 单次尝试超时 30s，前两次都超时
    let client = Arc::new(
        ScriptedLlmClient::new()
            .with_script(REASONER, vec![Scripted::reply(THOUGHT)])
            .with_script(
                PLANNER,
                vec![
                    Scripted::delayed(Duration::from_secs(60), Scripted::reply(PLAN)),
                    Scripted::delayed(Duration::from_secs(60), Scripted::reply(PLAN)),
                    Scripted::reply(PLAN),
                ],
            )
            .with_script(EXECUTOR, vec![Scripted::reply(ACTION)]),
    );
    let orchestrator = orchestrator(&client);

    let response = orchestrator
        .run(Task::new("Summarize Q1 results"))
        .await
        .unwrap();

    assert_eq!(response.plan.len(), 3);
    assert_eq!(client.calls(PLANNER), 3);
    assert_eq!(client.calls(EXECUTOR), 1);
    let stats = orchestrator.resilience_stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(orchestrator.history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_execution_parse_failure_records_nothing() {
    let client = Arc::new(
        ScriptedLlmClient::new()
            .with_script(REASONER, vec![Scripted::reply(THOUGHT)])
            .with_script(PLANNER, vec![Scripted::reply(PLAN)])
            .with_script(EXECUTOR, vec![Scripted::reply("  ok\0\0  ")]),
    );
    let orchestrator = orchestrator(&client);

    let err = orchestrator
        .run(Task::new("Summarize Q1 results"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::ParseError {
            stage: StageKind::Execution,
            ..
        }
    ));
    assert!(orchestrator.history().is_empty());
    // 解析失败不重试，也不留在缓存里
    assert_eq!(client.calls(EXECUTOR), 1);
    assert_eq!(orchestrator.cache_stats().entries, 2);
    assert!(matches!(
        RecoveryEngine::new().handle(&err),
        RecoveryAction::Rephrase(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_run_deadline_expires_during_planning() {
    let client = Arc::new(
        ScriptedLlmClient::new()
            .with_script(
                REASONER,
                vec![Scripted::delayed(Duration::from_secs(1), Scripted::reply(THOUGHT))],
            )
            .with_script(
                PLANNER,
                vec![Scripted::delayed(
                    Duration::from_millis(1500),
                    Scripted::reply(PLAN),
                )],
            )
            .with_script(EXECUTOR, vec![Scripted::reply(ACTION)]),
    );
    let orchestrator = orchestrator(&client);
    let start = Instant::now();

    let err = orchestrator
        .process_with_deadline(
            Task::new("Summarize Q1 results"),
            &Context::new(),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();

    match err {
        PipelineError::RunTimeout { phase, limit } => {
            assert_eq!(phase, RunPhase::Planning);
            assert_eq!(limit, Duration::from_secs(2));
        }
        other => panic!("expected RunTimeout, got {other:?}"),
    }
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(start.elapsed() < Duration::from_millis(2100));
    assert_eq!(client.calls(EXECUTOR), 0);
    assert!(orchestrator.history().is_empty());
    assert_eq!(orchestrator.active_runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_identical_run_is_served_from_cache() {
    let client = Arc::new(client());
    let orchestrator = orchestrator(&client);
    let mut ctx = Context::new();
    ctx.add_context([("domain", "finance")]);

    let first = orchestrator
        .process(Task::new("Summarize Q1 results"), &ctx)
        .await
        .unwrap();
    let second = orchestrator
        .process(Task::new("Summarize Q1 results"), &ctx)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(client.total_calls(), 3);
    assert_eq!(orchestrator.cache_stats().hits, 3);
    assert_eq!(orchestrator.history().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_context_change_misses_cache() {
    let client = Arc::new(client());
    let orchestrator = orchestrator(&client);

    orchestrator.add_context([("expertise_level", "novice")]);
    orchestrator.run(Task::new("Summarize Q1 results")).await.unwrap();
    orchestrator.add_context([("expertise_level", "expert")]);
    orchestrator.run(Task::new("Summarize Q1 results")).await.unwrap();

    assert_eq!(client.calls(REASONER), 2);
    let history = orchestrator.history();
    assert_eq!(history[0].context.get("expertise_level"), Some("novice"));
    assert_eq!(history[1].context.get("expertise_level"), Some("expert"));
}

#[tokio::test(start_paused = true)]
async fn test_expired_entries_trigger_new_calls() {
    let client = Arc::new(client());
    let mut cfg = config();
    for stage in [&mut cfg.reasoning, &mut cfg.planning, &mut cfg.execution] {
        stage.cache_ttl = Duration::from_secs(10);
    }
    let orchestrator = Orchestrator::new(cfg, client.clone());

    orchestrator.run(Task::new("Summarize Q1 results")).await.unwrap();
    tokio::time::advance(Duration::from_secs(11)).await;
    orchestrator.run(Task::new("Summarize Q1 results")).await.unwrap();

    assert_eq!(client.total_calls(), 6);
    let stats = orchestrator.cache_stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.expired, 3);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_identical_runs_share_remote_calls() {
    let client = Arc::new(
        ScriptedLlmClient::new()
            .with_script(
                REASONER,
                vec![Scripted::delayed(Duration::from_secs(1), Scripted::reply(THOUGHT))],
            )
            .with_script(PLANNER, vec![Scripted::reply(PLAN)])
            .with_script(EXECUTOR, vec![Scripted::reply(ACTION)]),
    );
    let orchestrator = orchestrator(&client);
    let ctx = Context::new();

    let (a, b) = tokio::join!(
        orchestrator.process(Task::new("Summarize Q1 results"), &ctx),
        orchestrator.process(Task::new("Summarize Q1 results"), &ctx),
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(client.calls(REASONER), 1);
    assert_eq!(client.calls(PLANNER), 1);
    assert_eq!(client.calls(EXECUTOR), 1);
    assert!(orchestrator.resilience_stats().coalesced >= 1);
    assert_eq!(orchestrator.history().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_is_not_retried() {
    let client = Arc::new(
        ScriptedLlmClient::new()
            .with_script(
                REASONER,
                vec![Scripted::fail(CallError::fatal("401 Unauthorized: invalid api key"))],
            )
            .with_script(PLANNER, vec![Scripted::reply(PLAN)])
            .with_script(EXECUTOR, vec![Scripted::reply(ACTION)]),
    );
    let orchestrator = orchestrator(&client);

    let err = orchestrator
        .run(Task::new("Summarize Q1 results"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::ProviderFatal {
            stage: StageKind::Reasoning,
            ..
        }
    ));
    assert_eq!(client.calls(REASONER), 1);
    assert_eq!(client.calls(PLANNER), 0);
    assert!(matches!(
        RecoveryEngine::new().handle(&err),
        RecoveryAction::FixConfiguration(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_incorrect_api_key_fails_without_retries() {
    let client = Arc::new(
        ScriptedLlmClient::new()
            .with_script(
                REASONER,
                vec![Scripted::fail(CallError::classify(
                    "invalid_request_error: Incorrect API key provided: sk-abc***. (code: invalid_api_key)",
                ))],
            )
            .with_script(PLANNER, vec![Scripted::reply(PLAN)])
            .with_script(EXECUTOR, vec![Scripted::reply(ACTION)]),
    );
    let orchestrator = orchestrator(&client);

    let err = orchestrator
        .run(Task::new("Summarize Q1 results"))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::ProviderFatal { .. }));
    assert_eq!(client.calls(REASONER), 1);
    assert_eq!(orchestrator.resilience_stats().retries, 0);
    assert!(matches!(
        RecoveryEngine::new().handle(&err),
        RecoveryAction::FixConfiguration(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_persistent_timeouts_exhaust_retries() {
    let client = Arc::new(
        ScriptedLlmClient::new()
            .with_script(REASONER, vec![Scripted::reply(THOUGHT)])
            .with_script(
                PLANNER,
                vec![Scripted::delayed(Duration::from_secs(600), Scripted::reply(PLAN))],
            )
            .with_script(EXECUTOR, vec![Scripted::reply(ACTION)]),
    );
    let orchestrator = orchestrator(&client);

    let err = orchestrator
        .run(Task::new("Summarize Q1 results"))
        .await
        .unwrap_err();

    match &err {
        PipelineError::RetriesExhausted {
            stage,
            model,
            attempts,
            last,
        } => {
            assert_eq!(*stage, StageKind::Planning);
            assert_eq!(model, PLANNER);
            assert_eq!(*attempts, 3);
            assert!(matches!(**last, PipelineError::CallTimeout { .. }));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(client.calls(PLANNER), 3);
    assert!(orchestrator.history().is_empty());
    assert!(matches!(
        RecoveryEngine::new().handle(&err),
        RecoveryAction::RetryRun { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_phase_events_for_successful_run() {
    let client = Arc::new(client());
    let orchestrator = orchestrator(&client);
    let mut events = orchestrator.subscribe();

    orchestrator.run(Task::new("Summarize Q1 results")).await.unwrap();

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        phases.push(event.phase);
    }
    assert_eq!(
        phases,
        vec![
            RunPhase::Reasoning,
            RunPhase::Planning,
            RunPhase::Execution,
            RunPhase::Completed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_phase_events_for_failed_run() {
    let client = Arc::new(
        ScriptedLlmClient::new()
            .with_script(REASONER, vec![Scripted::reply(THOUGHT)])
            .with_script(PLANNER, vec![Scripted::reply("no steps here at all")])
            .with_script(EXECUTOR, vec![Scripted::reply(ACTION)]),
    );
    let orchestrator = orchestrator(&client);
    let mut events = orchestrator.subscribe();

    let err = orchestrator
        .run(Task::new("Summarize Q1 results"))
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(StageKind::Planning));

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        phases.push(event.phase);
    }
    assert_eq!(
        phases,
        vec![RunPhase::Reasoning, RunPhase::Planning, RunPhase::Failed]
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_limiter_spaces_runs() {
    let client = Arc::new(client());
    let mut cfg = config();
    cfg.rate_limits
        .insert(REASONER.to_string(), RateLimit::new(1, 1.0));
    cfg.rate_limit_max_wait = Duration::from_secs(10);
    let orchestrator = Orchestrator::new(cfg, client.clone());
    let start = Instant::now();

    orchestrator.run(Task::new("first task")).await.unwrap();
    assert_eq!(start.elapsed(), Duration::ZERO);
    orchestrator.run(Task::new("second task")).await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(client.calls(REASONER), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_wait_beyond_max_fails() {
    let client = Arc::new(client());
    let mut cfg = config();
    cfg.rate_limits
        .insert(REASONER.to_string(), RateLimit::new(1, 0.01));
    cfg.rate_limit_max_wait = Duration::from_secs(5);
    let orchestrator = Orchestrator::new(cfg, client.clone());

    orchestrator.run(Task::new("first task")).await.unwrap();
    let err = orchestrator
        .run(Task::new("second task"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::RateLimitTimeout {
            stage: StageKind::Reasoning,
            max_wait,
            ..
        } if max_wait == Duration::from_secs(5)
    ));
    assert_eq!(client.calls(REASONER), 1);
    assert_eq!(
        RecoveryEngine::new().handle(&err),
        RecoveryAction::RetryRun {
            after: Duration::from_secs(5)
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_shared_limiter_across_orchestrators() {
    let client = Arc::new(client());
    let cache = Arc::new(ResponseCache::new());
    let limiter = Arc::new(RateLimiter::new(
        &HashMap::from([(REASONER.to_string(), RateLimit::new(1, 0.01))]),
        Duration::from_secs(1),
    ));
    let a = Orchestrator::with_shared(config(), client.clone(), cache.clone(), limiter.clone());
    let b = Orchestrator::with_shared(config(), client.clone(), cache.clone(), limiter);

    a.run(Task::new("first task")).await.unwrap();
    // 同一任务命中共享缓存，不消耗令牌
    b.run(Task::new("first task")).await.unwrap();
    let err = b.run(Task::new("other task")).await.unwrap_err();

    assert!(matches!(err, PipelineError::RateLimitTimeout { .. }));
    assert_eq!(client.calls(REASONER), 1);
    assert_eq!(cache.stats().hits, 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_all_stops_in_flight_runs() {
    let client = Arc::new(
        ScriptedLlmClient::new()
            .with_script(
                REASONER,
                vec![Scripted::delayed(Duration::from_secs(10), Scripted::reply(THOUGHT))],
            )
            .with_script(PLANNER, vec![Scripted::reply(PLAN)])
            .with_script(EXECUTOR, vec![Scripted::reply(ACTION)]),
    );
    let orchestrator = Arc::new(orchestrator(&client));

    let handle = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(Task::new("Summarize Q1 results")).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(orchestrator.active_runs(), 1);
    assert_eq!(orchestrator.cancel_all(), 1);

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Cancelled {
            phase: RunPhase::Reasoning
        }
    ));
    assert_eq!(client.calls(PLANNER), 0);
    assert!(orchestrator.history().is_empty());
    assert_eq!(orchestrator.active_runs(), 0);

    // 取消只影响当时在途的运行
    orchestrator.run(Task::new("another task")).await.unwrap();
    assert_eq!(orchestrator.history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_context_added_mid_run_does_not_affect_that_run() {
    let client = Arc::new(
        ScriptedLlmClient::new()
            .with_script(
                REASONER,
                vec![Scripted::delayed(Duration::from_secs(5), Scripted::reply(THOUGHT))],
            )
            .with_script(PLANNER, vec![Scripted::reply(PLAN)])
            .with_script(EXECUTOR, vec![Scripted::reply(ACTION)]),
    );
    let orchestrator = Arc::new(orchestrator(&client));
    orchestrator.add_context([("domain", "finance")]);

    let handle = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(Task::new("Summarize Q1 results")).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    orchestrator.add_context([("domain", "retail"), ("preferred_language", "de")]);

    handle.await.unwrap().unwrap();

    let history = orchestrator.history();
    assert_eq!(history.len(), 1);
    let expected: Context = [("domain", "finance")].into_iter().collect();
    assert_eq!(history[0].context, expected);
    assert_eq!(orchestrator.context().get("domain"), Some("retail"));
    assert_eq!(orchestrator.context().get("preferred_language"), Some("de"));
}

#[tokio::test(start_paused = true)]
async fn test_image_reference_changes_cache_key() {
    let client = Arc::new(client());
    let orchestrator = orchestrator(&client);

    orchestrator.run(Task::new("Describe the chart")).await.unwrap();
    orchestrator
        .run(Task::new("Describe the chart").with_image("https://example.com/q1.png"))
        .await
        .unwrap();

    assert_eq!(client.calls(REASONER), 2);
    assert_eq!(
        orchestrator.history()[1].task.image(),
        Some("https://example.com/q1.png")
    );
}

#[tokio::test(start_paused = true)]
async fn test_blank_task_is_invalid_input() {
    let client = Arc::new(client());
    let orchestrator = orchestrator(&client);
    let mut events = orchestrator.subscribe();

    let err = orchestrator.run(Task::new(" \n\t ")).await.unwrap_err();

    assert!(matches!(err, PipelineError::InvalidInput(_)));
    assert_eq!(client.total_calls(), 0);
    assert!(events.try_recv().is_err());
}
