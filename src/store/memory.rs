//! 内存版任务存储
//!
//! 单把 RwLock 保护全部状态，mark_processing 的「检查再写入」因此是原子的。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{JobStore, StoreResult};
use crate::core::StoreError;
use crate::job::{Job, JobEvent, JobId, JobStatus, QueueItem, QueueStatus, UsageEvent};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    queue: HashMap<String, QueueItem>,
    next_position: u64,
    active_job: Option<JobId>,
    usage: Vec<UsageEvent>,
    events: Vec<JobEvent>,
}

/// 内存存储（进程重启后丢失）
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn save_job(&self, job: &Job) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let mut job = job.clone();
        if let Some(existing) = inner.jobs.get(&job.id) {
            if existing.last_activity_at > job.last_activity_at {
                job.last_activity_at = existing.last_activity_at;
            }
        }
        inner.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(job_id).cloned())
    }

    async fn jobs_with_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        job.status = status;
        job.error = error;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn enqueue(&self, job_id: &str, priority: i32) -> StoreResult<QueueItem> {
        let mut inner = self.inner.write().await;
        if !inner.jobs.contains_key(job_id) {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        let position = inner.next_position;
        inner.next_position += 1;
        let item = QueueItem::new(job_id, priority, position);
        inner.queue.insert(item.id.clone(), item.clone());
        Ok(item)
    }

    async fn get_queue_item(&self, id: &str) -> StoreResult<Option<QueueItem>> {
        Ok(self.inner.read().await.queue.get(id).cloned())
    }

    async fn queue_item_for_job(&self, job_id: &str) -> StoreResult<Option<QueueItem>> {
        let inner = self.inner.read().await;
        Ok(inner
            .queue
            .values()
            .filter(|i| i.job_id == job_id)
            .max_by_key(|i| i.position)
            .cloned())
    }

    async fn list_queue(&self) -> StoreResult<Vec<QueueItem>> {
        let inner = self.inner.read().await;
        let mut items: Vec<QueueItem> = inner.queue.values().cloned().collect();
        items.sort_by(QueueItem::dispatch_order);
        Ok(items)
    }

    async fn next_waiting_queue_item(&self) -> StoreResult<Option<QueueItem>> {
        let inner = self.inner.read().await;
        Ok(inner
            .queue
            .values()
            .filter(|i| i.status == QueueStatus::Waiting)
            .min_by(|a, b| QueueItem::dispatch_order(a, b))
            .cloned())
    }

    async fn mark_processing(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(other) = inner
            .queue
            .values()
            .find(|i| i.status == QueueStatus::Processing && i.id != id)
        {
            return Err(StoreError::Conflict(format!(
                "queue item {} is already processing",
                other.id
            )));
        }
        let item = inner
            .queue
            .get_mut(id)
            .ok_or_else(|| StoreError::QueueItemNotFound(id.to_string()))?;
        item.status = QueueStatus::Processing;
        item.started_at = Some(Utc::now());
        item.completed_at = None;
        Ok(())
    }

    async fn set_queue_status(
        &self,
        id: &str,
        status: QueueStatus,
        error: Option<String>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let item = inner
            .queue
            .get_mut(id)
            .ok_or_else(|| StoreError::QueueItemNotFound(id.to_string()))?;
        item.status = status;
        if error.is_some() {
            item.last_error = error;
        }
        item.completed_at = status.is_finished().then(Utc::now);
        Ok(())
    }

    async fn remove_queue_item(&self, id: &str) -> StoreResult<bool> {
        Ok(self.inner.write().await.queue.remove(id).is_some())
    }

    async fn processing_items(&self) -> StoreResult<Vec<QueueItem>> {
        let inner = self.inner.read().await;
        Ok(inner
            .queue
            .values()
            .filter(|i| i.status == QueueStatus::Processing)
            .cloned()
            .collect())
    }

    async fn set_active_job(&self, job_id: Option<&str>) -> StoreResult<()> {
        self.inner.write().await.active_job = job_id.map(String::from);
        Ok(())
    }

    async fn active_job(&self) -> StoreResult<Option<JobId>> {
        Ok(self.inner.read().await.active_job.clone())
    }

    async fn update_heartbeat(&self, job_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        let now = Utc::now();
        if now > job.last_activity_at {
            job.last_activity_at = now;
        }
        Ok(())
    }

    async fn last_activity_time(&self, job_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .get(job_id)
            .map(|j| j.last_activity_at))
    }

    async fn record_usage(&self, event: UsageEvent) -> StoreResult<()> {
        self.inner.write().await.usage.push(event);
        Ok(())
    }

    async fn usage_events(&self, job_id: &str) -> StoreResult<Vec<UsageEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .usage
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn record_event(&self, event: JobEvent) -> StoreResult<()> {
        self.inner.write().await.events.push(event);
        Ok(())
    }

    async fn events(&self, job_id: &str) -> StoreResult<Vec<JobEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobEventKind, JobPlan};

    fn plan() -> JobPlan {
        JobPlan {
            chapter_count: 1,
            ..Default::default()
        }
    }

    async fn store_with_jobs(n: usize) -> (InMemoryStore, Vec<Job>) {
        let store = InMemoryStore::new();
        let mut jobs = Vec::new();
        for i in 0..n {
            let job = Job::new(format!("job {i}"), plan());
            store.save_job(&job).await.unwrap();
            jobs.push(job);
        }
        (store, jobs)
    }

    #[tokio::test]
    async fn next_waiting_respects_priority_then_position() {
        let (store, jobs) = store_with_jobs(3).await;
        store.enqueue(&jobs[0].id, 0).await.unwrap();
        store.enqueue(&jobs[1].id, 0).await.unwrap();
        store.enqueue(&jobs[2].id, 10).await.unwrap();

        let next = store.next_waiting_queue_item().await.unwrap().unwrap();
        assert_eq!(next.job_id, jobs[2].id);

        store
            .set_queue_status(&next.id, QueueStatus::Completed, None)
            .await
            .unwrap();
        let next = store.next_waiting_queue_item().await.unwrap().unwrap();
        assert_eq!(next.job_id, jobs[0].id);
    }

    #[tokio::test]
    async fn only_one_item_may_be_processing() {
        let (store, jobs) = store_with_jobs(2).await;
        let a = store.enqueue(&jobs[0].id, 0).await.unwrap();
        let b = store.enqueue(&jobs[1].id, 0).await.unwrap();

        store.mark_processing(&a.id).await.unwrap();
        let err = store.mark_processing(&b.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.processing_items().await.unwrap().len(), 1);

        store
            .set_queue_status(&a.id, QueueStatus::Waiting, None)
            .await
            .unwrap();
        store.mark_processing(&b.id).await.unwrap();
        let item = store.get_queue_item(&b.id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Processing);
        assert!(item.started_at.is_some());
    }

    #[tokio::test]
    async fn enqueue_unknown_job_fails() {
        let store = InMemoryStore::new();
        let err = store.enqueue("missing", 0).await.unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn heartbeat_never_moves_backwards() {
        let (store, jobs) = store_with_jobs(1).await;
        let id = &jobs[0].id;
        store.update_heartbeat(id).await.unwrap();
        let first = store.last_activity_time(id).await.unwrap().unwrap();

        // 带旧时间戳的整体覆盖不会回退活动时间
        let mut stale = jobs[0].clone();
        stale.last_activity_at = first - chrono::Duration::hours(1);
        store.save_job(&stale).await.unwrap();
        let after = store.last_activity_time(id).await.unwrap().unwrap();
        assert!(after >= first);
    }

    #[tokio::test]
    async fn events_are_filtered_by_job() {
        let (store, jobs) = store_with_jobs(2).await;
        store
            .record_event(JobEvent::new(&jobs[0].id, JobEventKind::HeartbeatRecovery, "gap 300s"))
            .await
            .unwrap();
        store
            .record_event(JobEvent::new(&jobs[1].id, JobEventKind::Skipped, ""))
            .await
            .unwrap();
        let events = store.events(&jobs[0].id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, JobEventKind::HeartbeatRecovery);
    }

    #[tokio::test]
    async fn queue_item_for_job_returns_latest() {
        let (store, jobs) = store_with_jobs(1).await;
        let first = store.enqueue(&jobs[0].id, 0).await.unwrap();
        store
            .set_queue_status(&first.id, QueueStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        let second = store.enqueue(&jobs[0].id, 0).await.unwrap();
        let found = store.queue_item_for_job(&jobs[0].id).await.unwrap().unwrap();
        assert_eq!(found.id, second.id);
        let failed = store.get_queue_item(&first.id).await.unwrap().unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
        assert!(failed.completed_at.is_some());
    }
}
