//! 活动运行登记表
//!
//! 按任务 ID 记录正在运行的任务：取消令牌、运行句柄、心跳定时器句柄与代次号。
//! 派发时插入，完成 / 恢复 / 停止时移除；只在调度器的派发锁内读写。

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::job::{JobId, QueueItemId};

/// 一次运行
#[derive(Debug)]
pub struct ActiveRun {
    pub job_id: JobId,
    pub queue_item_id: QueueItemId,
    pub cancel: CancellationToken,
    /// 代次号：运行结束回报时据此判断自己是否仍是登记的那一次
    pub generation: u64,
    run_handle: Option<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
}

impl ActiveRun {
    pub fn new(job_id: JobId, queue_item_id: QueueItemId, generation: u64) -> Self {
        Self {
            job_id,
            queue_item_id,
            cancel: CancellationToken::new(),
            generation,
            run_handle: None,
            heartbeat_handle: None,
        }
    }

    pub fn set_run_handle(&mut self, handle: JoinHandle<()>) {
        self.run_handle = Some(handle);
    }

    pub fn set_heartbeat_handle(&mut self, handle: JoinHandle<()>) {
        self.heartbeat_handle = Some(handle);
    }

    /// 停止心跳定时器（运行自然结束时）
    pub fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat_handle.take() {
            handle.abort();
        }
    }

    /// 取消令牌、中止运行并等待其真正退出（恢复 / 停止 / 取消时）
    ///
    /// 返回后流水线不会再写任何状态，调用方随后写入的任务状态不会被覆盖。
    pub async fn terminate(mut self) {
        self.cancel.cancel();
        self.stop_heartbeat();
        if let Some(handle) = self.run_handle.take() {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!("Run for job {} panicked: {}", self.job_id, e),
            }
        }
    }
}

/// 活动运行登记表
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: HashMap<JobId, ActiveRun>,
    next_generation: u64,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn insert(&mut self, run: ActiveRun) {
        self.runs.insert(run.job_id.clone(), run);
    }

    pub fn get(&self, job_id: &str) -> Option<&ActiveRun> {
        self.runs.get(job_id)
    }

    pub fn remove(&mut self, job_id: &str) -> Option<ActiveRun> {
        self.runs.remove(job_id)
    }

    /// 仅当代次号一致时移除
    pub fn remove_if_current(&mut self, job_id: &str, generation: u64) -> Option<ActiveRun> {
        match self.runs.get(job_id) {
            Some(run) if run.generation == generation => self.runs.remove(job_id),
            _ => None,
        }
    }

    /// 当前运行（至多一个）
    pub fn current(&self) -> Option<&ActiveRun> {
        self.runs.values().next()
    }

    pub fn current_job_id(&self) -> Option<JobId> {
        self.current().map(|r| r.job_id.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }
}
