//! Quill 入口：初始化日志与配置，组装存储、生成服务、流水线与调度器，运行到收到关闭信号。
//!
//! 用法：`quill [jobs.json]`，jobs.json 为任务数组（title / priority / plan），启动时入队。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio::sync::broadcast;

use quill::config::{load_config, LlmSection, StoreSection};
use quill::core::{serve_until_shutdown, ShutdownSequence, ShutdownSignal, StopScheduler};
use quill::job::{Job, JobPlan};
use quill::llm::{GenerationCaller, GenerativeService, OpenAiService, ScriptedService};
use quill::pipeline::{JobPipeline, TracingObserver};
use quill::scheduler::{JobScheduler, SchedulerEvent};
use quill::store::{InMemoryStore, JobStore, StoreUsageSink};

/// jobs.json 中的一项
#[derive(Debug, Deserialize)]
struct JobSpec {
    title: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    plan: JobPlan,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    quill::observability::init();

    let config = load_config(None).context("Failed to load configuration")?;
    let store = build_store(&config.store).await?;
    let service = build_service(&config.llm);

    let caller = GenerationCaller::new(service, config.generation.retry_policy())
        .with_usage_sink(Arc::new(StoreUsageSink::new(store.clone())))
        .with_pricing(config.generation.pricing.clone());
    let pipeline = Arc::new(JobPipeline::new(
        Arc::new(caller),
        store.clone(),
        config.pipeline.clone(),
    ));
    pipeline.subscribe(Arc::new(TracingObserver));

    let scheduler = JobScheduler::new(
        store.clone(),
        pipeline,
        config.scheduler.scheduler_config(),
    );

    if let Some(path) = std::env::args().nth(1) {
        enqueue_from_file(&scheduler, Path::new(&path)).await?;
    }

    let demoted = scheduler
        .initialize()
        .await
        .context("Failed to reconcile queue state")?;
    if demoted == 0 {
        scheduler.start().await;
    }

    let sequence =
        ShutdownSequence::new(Duration::from_secs(10)).with_hook(StopScheduler(scheduler.clone()));

    let mut events = scheduler.subscribe();
    let app = async move {
        loop {
            match events.recv().await {
                Ok(SchedulerEvent::QueueEmpty) => tracing::debug!("Queue empty, waiting for work"),
                Ok(event) => tracing::info!("Scheduler event: {:?}", event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} scheduler events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    if let Some(reason) = serve_until_shutdown(ShutdownSignal::new(), app, sequence).await {
        tracing::info!("Exited on {}", reason);
    }

    Ok(())
}

async fn build_store(section: &StoreSection) -> anyhow::Result<Arc<dyn JobStore>> {
    match section.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "async-sqlite")]
        "sqlite" => {
            if let Some(dir) = section.path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            let store = quill::store::SqliteStore::open(&section.path)
                .await
                .with_context(|| format!("Failed to open {}", section.path.display()))?;
            tracing::info!("Using SQLite store at {}", section.path.display());
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "async-sqlite"))]
        "sqlite" => anyhow::bail!("store.backend = \"sqlite\" requires the async-sqlite feature"),
        other => anyhow::bail!("Unknown store backend: {}", other),
    }
}

fn build_service(section: &LlmSection) -> Arc<dyn GenerativeService> {
    let api_key = section
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());

    match (section.provider.as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!("Using OpenAI-compatible backend, model {}", section.model);
            Arc::new(OpenAiService::new(
                section.base_url.as_deref(),
                &section.model,
                Some(&key),
            ))
        }
        ("openai", None) => {
            tracing::warn!("No API key configured, falling back to mock backend");
            Arc::new(ScriptedService::new())
        }
        _ => {
            tracing::info!("Using mock backend");
            Arc::new(ScriptedService::new())
        }
    }
}

async fn enqueue_from_file(scheduler: &JobScheduler, path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let specs: Vec<JobSpec> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    for spec in specs {
        let job = Job::new(spec.title, spec.plan);
        let item = scheduler
            .enqueue(&job, spec.priority)
            .await
            .with_context(|| format!("Failed to enqueue {}", job.title))?;
        tracing::info!(
            "Queued \"{}\" ({} sections) as {}",
            job.title,
            job.sections.len(),
            item.id
        );
    }
    Ok(())
}
