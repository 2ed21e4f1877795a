//! 持久化接口：任务 / 分节 / 队列项 CRUD、心跳时间戳、用量与事件记录
//!
//! 调度器与流水线只依赖 JobStore trait；默认实现为内存版，`async-sqlite` 特性下提供 SQLite 版。

pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::StoreError;
use crate::job::{Job, JobEvent, JobId, JobStatus, QueueItem, QueueStatus, UsageEvent};
use crate::llm::UsageSink;

pub use memory::InMemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// 任务存储
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 插入或整体覆盖任务（last_activity_at 取已存与新值中的较大者）
    async fn save_job(&self, job: &Job) -> StoreResult<()>;

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>>;

    async fn jobs_with_status(&self, status: JobStatus) -> StoreResult<Vec<Job>>;

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> StoreResult<()>;

    /// 为任务创建 waiting 队列项，位置追加到队尾
    async fn enqueue(&self, job_id: &str, priority: i32) -> StoreResult<QueueItem>;

    async fn get_queue_item(&self, id: &str) -> StoreResult<Option<QueueItem>>;

    /// 任务最近一次入队的队列项
    async fn queue_item_for_job(&self, job_id: &str) -> StoreResult<Option<QueueItem>>;

    /// 全部队列项，按派发顺序排列
    async fn list_queue(&self) -> StoreResult<Vec<QueueItem>>;

    /// 优先级最高、位置最靠前的 waiting 项
    async fn next_waiting_queue_item(&self) -> StoreResult<Option<QueueItem>>;

    /// 标记为 processing；已有其它 processing 项时返回 Conflict
    async fn mark_processing(&self, id: &str) -> StoreResult<()>;

    async fn set_queue_status(
        &self,
        id: &str,
        status: QueueStatus,
        error: Option<String>,
    ) -> StoreResult<()>;

    /// 删除队列项，返回是否存在
    async fn remove_queue_item(&self, id: &str) -> StoreResult<bool>;

    async fn processing_items(&self) -> StoreResult<Vec<QueueItem>>;

    /// 持久化的「当前任务」租约
    async fn set_active_job(&self, job_id: Option<&str>) -> StoreResult<()>;

    async fn active_job(&self) -> StoreResult<Option<JobId>>;

    /// 刷新任务的持久化活动时间（单调不减）
    async fn update_heartbeat(&self, job_id: &str) -> StoreResult<()>;

    async fn last_activity_time(&self, job_id: &str) -> StoreResult<Option<DateTime<Utc>>>;

    async fn record_usage(&self, event: UsageEvent) -> StoreResult<()>;

    async fn usage_events(&self, job_id: &str) -> StoreResult<Vec<UsageEvent>>;

    async fn record_event(&self, event: JobEvent) -> StoreResult<()>;

    async fn events(&self, job_id: &str) -> StoreResult<Vec<JobEvent>>;
}

/// 把 JobStore 适配为生成调用的用量记账出口
pub struct StoreUsageSink {
    store: Arc<dyn JobStore>,
}

impl StoreUsageSink {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UsageSink for StoreUsageSink {
    async fn record(&self, event: UsageEvent) {
        let job_id = event.job_id.clone();
        if let Err(e) = self.store.record_usage(event).await {
            tracing::warn!("Failed to record usage for job {}: {}", job_id, e);
        }
    }
}
