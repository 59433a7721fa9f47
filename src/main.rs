//! Triad - 三段式多模型 Agent 流水线
//!
//! 入口：初始化日志、加载配置、创建编排器，运行单个任务并打印 思考 / 计划 / 动作。
//!
//! 用法：`triad [--config PATH] [--context key=value]... [--image REF] [--export] <task...>`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use triad::config::{load_config, AppConfig};
use triad::core::{create_llm_from_config, RecoveryAction, RecoveryEngine};
use triad::memory::HistoryExporter;
use triad::{AgentResponse, Orchestrator, Task};

const USAGE: &str = "Usage: triad [--config PATH] [--context key=value]... [--image REF] [--export] <task...>";

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    config: Option<PathBuf>,
    context: Vec<(String, String)>,
    image: Option<String>,
    export: bool,
    help: bool,
    task: String,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut words = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => parsed.help = true,
            "--export" => parsed.export = true,
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--image" => {
                parsed.image = Some(args.next().context("--image needs a reference")?);
            }
            "--context" => {
                let pair = args.next().context("--context needs key=value")?;
                let Some((key, value)) = pair.split_once('=') else {
                    bail!("invalid --context '{pair}', expected key=value");
                };
                parsed
                    .context
                    .push((key.trim().to_string(), value.trim().to_string()));
            }
            "--" => words.extend(args.by_ref()),
            flag if flag.starts_with("--") => bail!("unknown option '{flag}'\n{USAGE}"),
            _ => words.push(arg),
        }
    }

    parsed.task = words.join(" ");
    Ok(parsed)
}

fn print_response(response: &AgentResponse) {
    println!("== Thought process ==\n{}\n", response.thought_process);
    println!("== Plan ==");
    for (i, step) in response.plan.iter().enumerate() {
        println!("{}. {}", i + 1, step);
    }
    println!("\n== Action ==\n{}", response.action);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    triad::observability::init();

    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        println!("{USAGE}");
        return Ok(());
    }
    if args.task.trim().is_empty() {
        bail!("no task given\n{USAGE}");
    }

    // 显式指定的配置文件必须可用；否则加载失败时退回默认配置
    let cfg = match load_config(args.config.clone()) {
        Ok(cfg) => cfg,
        Err(e) if args.config.is_some() => {
            return Err(anyhow::Error::new(e).context("Failed to load the given config file"));
        }
        Err(e) => {
            tracing::warn!("Config load failed ({}), using defaults", e);
            AppConfig::default()
        }
    };
    let pipeline = cfg
        .pipeline_config()
        .context("Invalid pipeline configuration")?;

    let orchestrator = Arc::new(Orchestrator::new(pipeline, create_llm_from_config(&cfg)));
    orchestrator.add_context(args.context.iter().cloned());

    // Ctrl+C：取消在途运行
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                orchestrator.cancel_all();
            }
        });
    }

    let mut task = Task::new(args.task.clone());
    if let Some(image) = &args.image {
        task = task.with_image(image.clone());
    }

    let recovery = RecoveryEngine::new();
    let response = match orchestrator.run(task.clone()).await {
        Ok(response) => response,
        Err(err) => match recovery.handle(&err) {
            RecoveryAction::RetryRun { after } => {
                tracing::warn!(error = %err, retry_in_ms = after.as_millis() as u64, "run failed, retrying once");
                tokio::time::sleep(after).await;
                orchestrator
                    .run(task)
                    .await
                    .context("Run failed after retry")?
            }
            RecoveryAction::Rephrase(hint) | RecoveryAction::FixConfiguration(hint) => {
                return Err(anyhow::Error::new(err).context(hint));
            }
            RecoveryAction::Abort => return Err(err.into()),
        },
    };

    print_response(&response);

    if args.export {
        let exporter = HistoryExporter::new(&cfg.history.export_dir, cfg.history.keep_files);
        let path = exporter
            .save(&orchestrator.history())
            .context("Failed to export history")?;
        println!("\nHistory exported to {}", path.display());
    }

    let (prompt, completion, total) = orchestrator.token_usage();
    let stats = orchestrator.resilience_stats();
    let cache = orchestrator.cache_stats();
    tracing::info!(
        prompt_tokens = prompt,
        completion_tokens = completion,
        total_tokens = total,
        remote_attempts = stats.remote_attempts,
        retries = stats.retries,
        cache_hits = stats.cache_hits,
        cache_hit_rate = cache.hit_rate(),
        "done"
    );

    Ok(())
}
