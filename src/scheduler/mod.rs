//! 任务调度器：全进程唯一知道「当前在跑哪个任务」的组件
//!
//! - 派发：在派发锁内完成「是否有任务在跑 → 选下一个 → 标记 processing → 启动」整段检查与执行
//! - 监管：内存心跳定时器（快速发现进程内卡死）+ 持久化活动巡检（跨进程重启）
//! - 恢复：降级为 waiting、清理租约、设置待重试标记、计数，延迟后重新派发；超过上限则标记失败
//! - 控制：start / stop / pause / resume / skip_current / cancel / enqueue / remove

pub mod heartbeat;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::{PipelineError, SchedulerError};
use crate::job::{
    Job, JobEvent, JobEventKind, JobId, JobStatus, QueueItem, QueueItemId, QueueStatus,
};
use crate::pipeline::{JobPipeline, JobRunSummary};
use crate::store::{JobStore, StoreResult};

pub use heartbeat::{Heartbeat, HeartbeatObserver};
pub use registry::{ActiveRun, RunRegistry};

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 任务完成后自动派发下一个；队列为空时轮询
    pub auto_advance: bool,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// 心跳间隔超过该值视为冻结
    pub freeze_threshold: Duration,
    pub sweep_interval: Duration,
    /// 持久化活动时间超过该值视为冻结
    pub sweep_threshold: Duration,
    /// 恢复后重新派发前的等待
    pub recovery_delay: Duration,
    /// 启动对账后自动开始派发前的等待
    pub restart_delay: Duration,
    /// 限流失败后重试同一任务前的等待
    pub rate_limit_backoff: Duration,
    /// 阶段失败时标记失败并继续下一个（否则暂停队列）
    pub skip_on_error: bool,
    /// 单个任务的最大恢复次数，0 表示不限
    pub max_recovery_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_advance: true,
            poll_interval: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(30),
            freeze_threshold: Duration::from_secs(240),
            sweep_interval: Duration::from_secs(60),
            sweep_threshold: Duration::from_secs(600),
            recovery_delay: Duration::from_secs(5),
            restart_delay: Duration::from_secs(3),
            rate_limit_backoff: Duration::from_secs(120),
            skip_on_error: false,
            max_recovery_attempts: 5,
        }
    }
}

/// 调度器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

/// 触发恢复的监管机制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    Heartbeat,
    Sweep,
}

impl RecoveryTrigger {
    fn event_kind(&self) -> JobEventKind {
        match self {
            RecoveryTrigger::Heartbeat => JobEventKind::HeartbeatRecovery,
            RecoveryTrigger::Sweep => JobEventKind::SweepRecovery,
        }
    }
}

/// 一次运行的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed,
    RateLimited,
    Cancelled,
    Skipped,
}

/// 对外广播的调度器事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Started,
    Stopped,
    Paused,
    Resumed,
    JobDispatched {
        job_id: JobId,
        queue_item_id: QueueItemId,
    },
    JobFinished {
        job_id: JobId,
        outcome: JobOutcome,
    },
    QueueEmpty,
    Recovered {
        job_id: JobId,
        attempt: u32,
        trigger: RecoveryTrigger,
    },
    RecoveryExhausted {
        job_id: JobId,
        attempts: u32,
    },
}

/// get_state 返回的快照
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub state: SchedulerState,
    pub active_job: Option<JobId>,
    pub active_queue_item: Option<QueueItemId>,
    pub pending_retry: Option<JobId>,
    pub waiting: usize,
    pub recovery_attempts: HashMap<JobId, u32>,
    /// 距上次心跳的秒数（无活动任务时为 None）
    pub heartbeat_age_secs: Option<u64>,
}

/// 派发锁保护的全部可变状态
struct DispatchState {
    state: SchedulerState,
    runs: RunRegistry,
    /// 恢复或失败后优先重试的任务
    pending_retry: Option<JobId>,
    recovery_attempts: HashMap<JobId, u32>,
    /// 退避期内不派发
    not_before: Option<Instant>,
    /// 队列为空时等待下一次轮询的任务
    poll: Option<JoinHandle<()>>,
}

struct SchedulerInner {
    store: Arc<dyn JobStore>,
    pipeline: Arc<JobPipeline>,
    config: SchedulerConfig,
    heartbeat: Heartbeat,
    events: broadcast::Sender<SchedulerEvent>,
    dispatch: Mutex<DispatchState>,
    sweep: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// 任务调度器（克隆共享同一实例）
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        pipeline: Arc<JobPipeline>,
        config: SchedulerConfig,
    ) -> Self {
        let heartbeat = Heartbeat::new();
        pipeline.subscribe(Arc::new(HeartbeatObserver::new(heartbeat.clone())));
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                pipeline,
                config,
                heartbeat,
                events,
                dispatch: Mutex::new(DispatchState {
                    state: SchedulerState::Stopped,
                    runs: RunRegistry::new(),
                    pending_retry: None,
                    recovery_attempts: HashMap::new(),
                    not_before: None,
                    poll: None,
                }),
                sweep: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.inner.events.send(event);
    }

    /// 进程启动时对账上次遗留的 processing 项；返回被降级的数量
    pub async fn initialize(&self) -> Result<usize, SchedulerError> {
        let store = &self.inner.store;
        let mut demoted = 0;

        for item in store.processing_items().await? {
            match store.get_job(&item.job_id).await? {
                Some(job) if job.status == JobStatus::Completed => {
                    tracing::info!(
                        "Closing out queue item {} (job {} already completed)",
                        item.id,
                        job.id
                    );
                    store.set_queue_status(&item.id, QueueStatus::Completed, None).await?;
                }
                Some(job) => {
                    tracing::warn!(
                        "Demoting leftover processing item {} (job {})",
                        item.id,
                        job.id
                    );
                    store.set_queue_status(&item.id, QueueStatus::Waiting, None).await?;
                    if job.status == JobStatus::Generating {
                        store.update_job_status(&job.id, JobStatus::Paused, None).await?;
                    }
                    store
                        .record_event(JobEvent::new(
                            job.id.clone(),
                            JobEventKind::Demoted,
                            "left processing by a previous run",
                        ))
                        .await?;
                    demoted += 1;
                }
                None => {
                    tracing::warn!("Queue item {} references missing job {}", item.id, item.job_id);
                    let reason = Some("job missing".to_string());
                    store
                        .set_queue_status(&item.id, QueueStatus::Failed, reason)
                        .await?;
                }
            }
        }
        store.set_active_job(None).await?;

        if demoted > 0 {
            let this = self.clone();
            let delay = self.inner.config.restart_delay;
            tracing::info!(
                "Restarting dispatch in {}s after reconciling {} item(s)",
                delay.as_secs(),
                demoted
            );
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.start().await;
            });
        }
        Ok(demoted)
    }

    /// stopped / paused → running，并开始派发
    pub async fn start(&self) {
        {
            let mut guard = self.inner.dispatch.lock().await;
            if guard.state == SchedulerState::Running {
                return;
            }
            guard.state = SchedulerState::Running;
        }
        self.start_sweep();
        tracing::info!("Scheduler started");
        self.emit(SchedulerEvent::Started);
        self.process_queue().await;
    }

    /// 任意状态 → stopped：取消当前任务并降级为 waiting
    pub async fn stop(&self) {
        let mut guard = self.inner.dispatch.lock().await;
        guard.state = SchedulerState::Stopped;
        if let Some(poll) = guard.poll.take() {
            poll.abort();
        }
        let current = guard.runs.current_job_id();
        if let Some(job_id) = current {
            if let Some(run) = guard.runs.remove(&job_id) {
                let item_id = run.queue_item_id.clone();
                run.terminate().await;
                self.demote(&job_id, &item_id, JobEventKind::Demoted, "scheduler stopped")
                    .await;
                guard.pending_retry = Some(job_id);
            }
        }
        drop(guard);

        self.stop_sweep();
        tracing::info!("Scheduler stopped");
        self.emit(SchedulerEvent::Stopped);
    }

    /// running → paused：不再派发，当前任务继续跑到自然结束
    pub async fn pause(&self) {
        let mut guard = self.inner.dispatch.lock().await;
        if guard.state == SchedulerState::Running {
            guard.state = SchedulerState::Paused;
            tracing::info!("Scheduler paused");
            self.emit(SchedulerEvent::Paused);
        }
    }

    /// paused → running
    pub async fn resume(&self) {
        {
            let mut guard = self.inner.dispatch.lock().await;
            if guard.state != SchedulerState::Paused {
                return;
            }
            guard.state = SchedulerState::Running;
        }
        tracing::info!("Scheduler resumed");
        self.emit(SchedulerEvent::Resumed);
        self.process_queue().await;
    }

    /// 把当前队列项标记为 skipped 并释放槽位（不取消任务）
    pub async fn skip_current(&self) -> Result<Option<JobId>, SchedulerError> {
        let mut guard = self.inner.dispatch.lock().await;
        let Some(job_id) = guard.runs.current_job_id() else {
            return Ok(None);
        };
        let Some(mut run) = guard.runs.remove(&job_id) else {
            return Ok(None);
        };
        run.stop_heartbeat();

        let store = &self.inner.store;
        store
            .set_queue_status(&run.queue_item_id, QueueStatus::Skipped, None)
            .await?;
        self.release_lease(&job_id).await;
        if let Some(job) = store.get_job(&job_id).await? {
            if job.status == JobStatus::Generating {
                store.update_job_status(&job_id, JobStatus::Paused, None).await?;
            }
        }
        let event = JobEvent::new(job_id.clone(), JobEventKind::Skipped, "skipped by request");
        store.record_event(event).await?;
        if guard.pending_retry.as_deref() == Some(job_id.as_str()) {
            guard.pending_retry = None;
        }
        tracing::info!("Skipped job {}", job_id);
        self.emit(SchedulerEvent::JobFinished {
            job_id: job_id.clone(),
            outcome: JobOutcome::Skipped,
        });

        if guard.state == SchedulerState::Running {
            self.schedule_dispatch(Duration::ZERO);
        }
        Ok(Some(job_id))
    }

    /// 取消任务：任务 → cancelled，队列项 → skipped；正在运行则取消令牌并释放槽位
    pub async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        let store = &self.inner.store;
        let mut guard = self.inner.dispatch.lock().await;
        if store.get_job(job_id).await?.is_none() {
            return Err(SchedulerError::JobNotFound(job_id.to_string()));
        }

        let was_active = match guard.runs.remove(job_id) {
            Some(run) => {
                run.terminate().await;
                self.release_lease(job_id).await;
                true
            }
            None => false,
        };

        store
            .update_job_status(job_id, JobStatus::Cancelled, None)
            .await?;
        if let Some(item) = store.queue_item_for_job(job_id).await? {
            if !item.status.is_finished() {
                store
                    .set_queue_status(&item.id, QueueStatus::Skipped, Some("cancelled".to_string()))
                    .await?;
            }
        }
        store
            .record_event(JobEvent::new(job_id, JobEventKind::Cancelled, "cancelled by request"))
            .await?;
        if guard.pending_retry.as_deref() == Some(job_id) {
            guard.pending_retry = None;
        }
        guard.recovery_attempts.remove(job_id);
        tracing::info!("Cancelled job {}", job_id);

        if was_active {
            self.emit(SchedulerEvent::JobFinished {
                job_id: job_id.to_string(),
                outcome: JobOutcome::Cancelled,
            });
            if guard.state == SchedulerState::Running {
                self.schedule_dispatch(Duration::ZERO);
            }
        }
        Ok(())
    }

    /// 保存任务并入队；运行中且空闲时立即尝试派发
    pub async fn enqueue(&self, job: &Job, priority: i32) -> Result<QueueItem, SchedulerError> {
        self.inner.store.save_job(job).await?;
        let item = self.inner.store.enqueue(&job.id, priority).await?;
        tracing::info!("Enqueued job {} as {} (priority {})", job.id, item.id, priority);
        self.process_queue().await;
        Ok(item)
    }

    /// 移除 waiting 队列项；不存在返回 false
    pub async fn remove(&self, queue_item_id: &str) -> Result<bool, SchedulerError> {
        let store = &self.inner.store;
        let Some(item) = store.get_queue_item(queue_item_id).await? else {
            return Ok(false);
        };
        if item.status != QueueStatus::Waiting {
            return Err(SchedulerError::NotWaiting(queue_item_id.to_string()));
        }
        Ok(store.remove_queue_item(queue_item_id).await?)
    }

    pub async fn list_queue(&self) -> Result<Vec<QueueItem>, SchedulerError> {
        Ok(self.inner.store.list_queue().await?)
    }

    pub async fn get_state(&self) -> Result<SchedulerSnapshot, SchedulerError> {
        let waiting = self
            .inner
            .store
            .list_queue()
            .await?
            .iter()
            .filter(|i| i.status == QueueStatus::Waiting)
            .count();
        let guard = self.inner.dispatch.lock().await;
        let current = guard.runs.current();
        Ok(SchedulerSnapshot {
            state: guard.state,
            active_job: current.map(|r| r.job_id.clone()),
            active_queue_item: current.map(|r| r.queue_item_id.clone()),
            pending_retry: guard.pending_retry.clone(),
            waiting,
            recovery_attempts: guard.recovery_attempts.clone(),
            heartbeat_age_secs: current.map(|_| self.inner.heartbeat.elapsed().as_secs()),
        })
    }

    pub async fn recovery_attempts(&self, job_id: &str) -> u32 {
        let guard = self.inner.dispatch.lock().await;
        guard.recovery_attempts.get(job_id).copied().unwrap_or(0)
    }

    /// 派发：整段在派发锁内完成
    pub async fn process_queue(&self) {
        let store = &self.inner.store;
        let mut guard = self.inner.dispatch.lock().await;

        if guard.state != SchedulerState::Running || !guard.runs.is_empty() {
            return;
        }
        if let Some(not_before) = guard.not_before {
            let now = Instant::now();
            if now < not_before {
                self.schedule_dispatch(not_before - now);
                return;
            }
            guard.not_before = None;
        }

        // 持久化租约：防止进程重启竞态下重复派发
        match store.active_job().await {
            Ok(Some(job_id)) => match store.get_job(&job_id).await {
                Ok(Some(job)) if job.status == JobStatus::Generating => {
                    tracing::debug!(
                        "Persisted active job {} still generating, not dispatching",
                        job_id
                    );
                    return;
                }
                _ => {
                    tracing::warn!("Clearing stale active job lease {}", job_id);
                    if let Err(e) = store.set_active_job(None).await {
                        tracing::error!("Failed to clear stale lease: {}", e);
                        return;
                    }
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Failed to read active job lease: {}", e);
                return;
            }
        }

        let mut next = None;
        if let Some(job_id) = guard.pending_retry.take() {
            match store.queue_item_for_job(&job_id).await {
                Ok(Some(item)) if item.status == QueueStatus::Waiting => {
                    tracing::info!("Retrying job {} before the rest of the queue", job_id);
                    next = Some(item);
                }
                Ok(_) => tracing::info!("Pending retry for job {} is no longer waiting", job_id),
                Err(e) => tracing::warn!("Failed to load pending retry {}: {}", job_id, e),
            }
        }
        if next.is_none() {
            next = match store.next_waiting_queue_item().await {
                Ok(item) => item,
                Err(e) => {
                    tracing::error!("Failed to select next queue item: {}", e);
                    return;
                }
            };
        }

        let Some(item) = next else {
            tracing::debug!("Queue is empty");
            self.emit(SchedulerEvent::QueueEmpty);
            if self.inner.config.auto_advance && guard.poll.is_none() {
                guard.poll = Some(self.schedule_poll());
            }
            return;
        };

        self.dispatch(&mut guard, item).await;
    }

    async fn dispatch(&self, guard: &mut DispatchState, item: QueueItem) {
        let store = &self.inner.store;
        let job = match store.get_job(&item.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!("Queue item {} references missing job {}", item.id, item.job_id);
                let reason = Some("job missing".to_string());
                log_err(
                    store
                        .set_queue_status(&item.id, QueueStatus::Failed, reason)
                        .await,
                    "mark orphan item failed",
                );
                self.schedule_dispatch(Duration::ZERO);
                return;
            }
            Err(e) => {
                tracing::error!("Failed to load job {}: {}", item.job_id, e);
                return;
            }
        };

        if job.status.is_terminal() {
            let status = if job.status == JobStatus::Completed {
                QueueStatus::Completed
            } else {
                QueueStatus::Skipped
            };
            tracing::info!(
                "Job {} is already {}, closing out {}",
                job.id,
                job.status.as_str(),
                item.id
            );
            log_err(store.set_queue_status(&item.id, status, None).await, "close out item");
            self.schedule_dispatch(Duration::ZERO);
            return;
        }

        if let Err(e) = store.mark_processing(&item.id).await {
            tracing::error!("Failed to mark {} processing: {}", item.id, e);
            return;
        }
        log_err(store.set_active_job(Some(&job.id)).await, "set active job");
        log_err(
            store.update_job_status(&job.id, JobStatus::Generating, None).await,
            "mark job generating",
        );
        log_err(store.update_heartbeat(&job.id).await, "refresh activity");
        log_err(
            store
                .record_event(JobEvent::new(
                    job.id.clone(),
                    JobEventKind::Dispatched,
                    format!("queue item {}", item.id),
                ))
                .await,
            "record dispatch",
        );

        let generation = guard.runs.next_generation();
        let mut run = ActiveRun::new(job.id.clone(), item.id.clone(), generation);
        self.inner.heartbeat.beat();

        let this = self.clone();
        let cancel = run.cancel.clone();
        let mut job = job;
        run.set_run_handle(tokio::spawn(async move {
            let result = this.inner.pipeline.resume_job(&mut job, &cancel).await;
            this.on_run_finished(job.id.clone(), generation, result).await;
        }));
        run.set_heartbeat_handle(self.spawn_heartbeat_monitor(run.job_id.clone(), generation));

        tracing::info!("Dispatched job {} ({})", run.job_id, item.id);
        self.emit(SchedulerEvent::JobDispatched {
            job_id: run.job_id.clone(),
            queue_item_id: item.id,
        });
        guard.runs.insert(run);
    }

    /// 流水线返回后：释放槽位，按结局决定下一步
    async fn on_run_finished(
        &self,
        job_id: JobId,
        generation: u64,
        result: Result<JobRunSummary, PipelineError>,
    ) {
        let store = &self.inner.store;
        let config = &self.inner.config;
        let mut guard = self.inner.dispatch.lock().await;
        let Some(mut run) = guard.runs.remove_if_current(&job_id, generation) else {
            tracing::debug!("Ignoring result of superseded run for job {}", job_id);
            return;
        };
        run.stop_heartbeat();
        let item_id = run.queue_item_id.clone();
        self.release_lease(&job_id).await;

        let running = guard.state == SchedulerState::Running;
        match result {
            Ok(summary) => {
                log_err(
                    store.set_queue_status(&item_id, QueueStatus::Completed, None).await,
                    "complete item",
                );
                guard.recovery_attempts.remove(&job_id);
                self.record(
                    &job_id,
                    JobEventKind::Completed,
                    format!(
                        "{} section(s) this run, {} words total",
                        summary.sections_completed, summary.total_words
                    ),
                )
                .await;
                tracing::info!("Job {} completed", job_id);
                self.emit(SchedulerEvent::JobFinished {
                    job_id,
                    outcome: JobOutcome::Completed,
                });

                if running {
                    if config.auto_advance {
                        self.schedule_dispatch(Duration::ZERO);
                    } else {
                        guard.state = SchedulerState::Paused;
                        tracing::info!("Auto-advance disabled, pausing after job");
                        self.emit(SchedulerEvent::Paused);
                    }
                }
            }
            Err(e) if e.is_rate_limited() => {
                log_err(
                    store
                        .set_queue_status(&item_id, QueueStatus::Waiting, Some(e.to_string()))
                        .await,
                    "demote rate-limited item",
                );
                guard.pending_retry = Some(job_id.clone());
                guard.not_before = Some(Instant::now() + config.rate_limit_backoff);
                self.record(&job_id, JobEventKind::RateLimited, e.to_string()).await;
                tracing::warn!(
                    "Job {} rate limited, retrying in {}s",
                    job_id,
                    config.rate_limit_backoff.as_secs()
                );
                self.emit(SchedulerEvent::JobFinished {
                    job_id,
                    outcome: JobOutcome::RateLimited,
                });
                if running {
                    self.schedule_dispatch(config.rate_limit_backoff);
                }
            }
            Err(e) => {
                self.record(&job_id, JobEventKind::Failed, e.to_string()).await;
                if config.skip_on_error {
                    log_err(
                        store
                            .set_queue_status(&item_id, QueueStatus::Failed, Some(e.to_string()))
                            .await,
                        "fail item",
                    );
                    tracing::error!("Job {} failed, moving on: {}", job_id, e);
                    self.emit(SchedulerEvent::JobFinished {
                        job_id,
                        outcome: JobOutcome::Failed,
                    });
                    if running {
                        self.schedule_dispatch(Duration::ZERO);
                    }
                } else {
                    log_err(
                        store
                            .set_queue_status(&item_id, QueueStatus::Waiting, Some(e.to_string()))
                            .await,
                        "demote failed item",
                    );
                    guard.pending_retry = Some(job_id.clone());
                    tracing::error!("Job {} failed, pausing queue: {}", job_id, e);
                    self.emit(SchedulerEvent::JobFinished {
                        job_id,
                        outcome: JobOutcome::Failed,
                    });
                    if running {
                        guard.state = SchedulerState::Paused;
                        self.emit(SchedulerEvent::Paused);
                    }
                }
            }
        }
    }

    /// 恢复冻结任务（心跳与巡检共用）。`generation` 为 Some 时只恢复该代次的运行
    pub async fn recover(&self, job_id: &str, trigger: RecoveryTrigger, generation: Option<u64>) {
        let store = &self.inner.store;
        let config = &self.inner.config;
        let mut guard = self.inner.dispatch.lock().await;

        if let Some(generation) = generation {
            match guard.runs.get(job_id) {
                Some(run) if run.generation == generation => {}
                _ => return,
            }
        }

        let item_id = match guard.runs.remove(job_id) {
            Some(run) => {
                let id = run.queue_item_id.clone();
                run.terminate().await;
                Some(id)
            }
            None => match store.queue_item_for_job(job_id).await {
                Ok(item) => item.filter(|i| !i.status.is_finished()).map(|i| i.id),
                Err(e) => {
                    tracing::error!("Failed to load queue item for {}: {}", job_id, e);
                    None
                }
            },
        };
        self.release_lease(job_id).await;

        let attempts = {
            let counter = guard.recovery_attempts.entry(job_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        if config.max_recovery_attempts > 0 && attempts > config.max_recovery_attempts {
            if let Some(item_id) = &item_id {
                log_err(
                    store
                        .set_queue_status(
                            item_id,
                            QueueStatus::Failed,
                            Some("recovery attempts exhausted".to_string()),
                        )
                        .await,
                    "fail exhausted item",
                );
            }
            log_err(
                store
                    .update_job_status(
                        job_id,
                        JobStatus::Error,
                        Some(format!("frozen {} times, giving up", attempts)),
                    )
                    .await,
                "mark exhausted job",
            );
            if guard.pending_retry.as_deref() == Some(job_id) {
                guard.pending_retry = None;
            }
            let limit = config.max_recovery_attempts;
            self.record(
                job_id,
                JobEventKind::RecoveryExhausted,
                format!("{} recoveries exceed the limit of {}", attempts, limit),
            )
            .await;
            tracing::error!("Job {} exhausted {} recovery attempts", job_id, limit);
            self.emit(SchedulerEvent::RecoveryExhausted {
                job_id: job_id.to_string(),
                attempts,
            });
        } else {
            if let Some(item_id) = &item_id {
                log_err(
                    store.set_queue_status(item_id, QueueStatus::Waiting, None).await,
                    "demote frozen item",
                );
            }
            log_err(
                store.update_job_status(job_id, JobStatus::Paused, None).await,
                "pause frozen job",
            );
            guard.pending_retry = Some(job_id.to_string());
            self.record(
                job_id,
                trigger.event_kind(),
                format!("recovery attempt {}", attempts),
            )
            .await;
            tracing::warn!("Recovered frozen job {} ({:?}, attempt {})", job_id, trigger, attempts);
            self.emit(SchedulerEvent::Recovered {
                job_id: job_id.to_string(),
                attempt: attempts,
                trigger,
            });
        }

        if guard.state == SchedulerState::Running {
            guard.not_before = Some(Instant::now() + config.recovery_delay);
            self.schedule_dispatch(config.recovery_delay);
        }
    }

    /// 巡检一次：按持久化活动时间检查所有 generating 任务，返回触发恢复的任务
    pub async fn sweep_once(&self) -> Result<Vec<JobId>, SchedulerError> {
        let store = &self.inner.store;
        let threshold = chrono::Duration::from_std(self.inner.config.sweep_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let now = Utc::now();
        let mut recovered = Vec::new();

        for job in store.jobs_with_status(JobStatus::Generating).await? {
            let last = store
                .last_activity_time(&job.id)
                .await?
                .unwrap_or(job.last_activity_at);
            let gap = now - last;
            if gap > threshold {
                tracing::warn!(
                    "Job {} has no persisted activity for {}s",
                    job.id,
                    gap.num_seconds()
                );
                self.recover(&job.id, RecoveryTrigger::Sweep, None).await;
                recovered.push(job.id);
            }
        }
        Ok(recovered)
    }

    fn spawn_heartbeat_monitor(&self, job_id: JobId, generation: u64) -> JoinHandle<()> {
        let this = self.clone();
        let interval = self.inner.config.heartbeat_interval;
        let threshold = self.inner.config.freeze_threshold;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let gap = this.inner.heartbeat.elapsed();
                if gap > threshold {
                    tracing::warn!(
                        "Job {} heartbeat silent for {}s (threshold {}s)",
                        job_id,
                        gap.as_secs(),
                        threshold.as_secs()
                    );
                    // 恢复会中止本定时器，放到独立任务里执行
                    let recovery = this.clone();
                    tokio::spawn(async move {
                        recovery
                            .recover(&job_id, RecoveryTrigger::Heartbeat, Some(generation))
                            .await;
                    });
                    break;
                }
            }
        })
    }

    fn start_sweep(&self) {
        let mut sweep = self.inner.sweep.lock().unwrap_or_else(|e| e.into_inner());
        if sweep.is_some() {
            return;
        }
        let this = self.clone();
        let interval = self.inner.config.sweep_interval;
        *sweep = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                if let Err(e) = this.sweep_once().await {
                    tracing::warn!("Activity sweep failed: {}", e);
                }
            }
        }));
    }

    fn stop_sweep(&self) {
        let handle = self
            .inner
            .sweep
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn schedule_dispatch(&self, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            this.process_queue().await;
        });
    }

    fn schedule_poll(&self) -> JoinHandle<()> {
        let this = self.clone();
        let delay = self.inner.config.poll_interval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.inner.dispatch.lock().await.poll = None;
            this.process_queue().await;
        })
    }

    /// 降级：队列项 → waiting，任务 → paused，清理租约并记录事件
    async fn demote(&self, job_id: &str, item_id: &str, kind: JobEventKind, detail: &str) {
        let store = &self.inner.store;
        log_err(
            store.set_queue_status(item_id, QueueStatus::Waiting, None).await,
            "demote item",
        );
        log_err(
            store.update_job_status(job_id, JobStatus::Paused, None).await,
            "pause job",
        );
        self.release_lease(job_id).await;
        self.record(job_id, kind, detail).await;
        tracing::info!("Demoted job {} to waiting: {}", job_id, detail);
    }

    /// 仅当租约属于该任务时清除
    async fn release_lease(&self, job_id: &str) {
        let store = &self.inner.store;
        match store.active_job().await {
            Ok(Some(active)) if active == job_id => {
                log_err(store.set_active_job(None).await, "release lease");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to read active job lease: {}", e),
        }
    }

    async fn record(&self, job_id: &str, kind: JobEventKind, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::debug!("Job {} event {}: {}", job_id, kind.as_str(), detail);
        log_err(
            self.inner
                .store
                .record_event(JobEvent::new(job_id, kind, detail))
                .await,
            "record job event",
        );
    }
}

fn log_err<T>(result: StoreResult<T>, what: &str) {
    if let Err(e) = result {
        tracing::error!("Store operation failed ({}): {}", what, e);
    }
}
