//! 流水线过程事件与观察者
//!
//! 事件是封闭集合（阶段状态、重试、分节完成、任务完成、错误），可序列化为 JSON 供前端展示；
//! 日志、心跳、外部展示各自订阅，互不影响。

use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::job::{JobId, TokenUsage};

/// 分节内的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Write,
    Critique,
    Polish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Write => "write",
            Stage::Critique => "critique",
            Stage::Polish => "polish",
        }
    }
}

/// 单个过程事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// 某分节进入某阶段（attempt 为精修轮次，从 1 开始）
    StageStatus {
        job_id: JobId,
        section: i32,
        stage: Stage,
        attempt: u32,
    },
    /// 生成调用即将重试
    Retrying {
        job_id: JobId,
        section: i32,
        stage: Stage,
        attempt: u32,
        reason: String,
        delay_secs: u64,
    },
    SectionComplete {
        job_id: JobId,
        section: i32,
        title: String,
        word_count: usize,
        score: Option<f32>,
        accepted_unverified: bool,
    },
    JobComplete {
        job_id: JobId,
        sections: usize,
        total_words: usize,
        usage: TokenUsage,
    },
    Error {
        job_id: JobId,
        section: Option<i32>,
        message: String,
    },
}

impl PipelineEvent {
    pub fn job_id(&self) -> &str {
        match self {
            PipelineEvent::StageStatus { job_id, .. }
            | PipelineEvent::Retrying { job_id, .. }
            | PipelineEvent::SectionComplete { job_id, .. }
            | PipelineEvent::JobComplete { job_id, .. }
            | PipelineEvent::Error { job_id, .. } => job_id,
        }
    }
}

/// 事件观察者（同步回调，不应阻塞）
pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// 多观察者集合，可在运行期追加订阅
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Arc<RwLock<Vec<Arc<dyn PipelineObserver>>>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn PipelineObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn emit(&self, event: PipelineEvent) {
        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
        for observer in observers.iter() {
            observer.on_event(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 将事件写入 tracing 日志
#[derive(Debug, Default)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageStatus {
                job_id,
                section,
                stage,
                attempt,
            } => {
                tracing::debug!(
                    "[{}] section {} -> {} (attempt {})",
                    job_id,
                    section,
                    stage.as_str(),
                    attempt
                );
            }
            PipelineEvent::Retrying {
                job_id,
                section,
                stage,
                attempt,
                reason,
                delay_secs,
            } => {
                tracing::info!(
                    "[{}] section {} {} retry after attempt {} ({}), waiting {}s",
                    job_id,
                    section,
                    stage.as_str(),
                    attempt,
                    reason,
                    delay_secs
                );
            }
            PipelineEvent::SectionComplete {
                job_id,
                section,
                word_count,
                accepted_unverified,
                ..
            } => {
                if *accepted_unverified {
                    tracing::warn!(
                        "[{}] section {} accepted unverified ({} words)",
                        job_id,
                        section,
                        word_count
                    );
                } else {
                    tracing::info!(
                        "[{}] section {} completed ({} words)",
                        job_id,
                        section,
                        word_count
                    );
                }
            }
            PipelineEvent::JobComplete {
                job_id,
                sections,
                total_words,
                usage,
            } => {
                tracing::info!(
                    "[{}] job completed: {} sections, {} words, {} tokens",
                    job_id,
                    sections,
                    total_words,
                    usage.total()
                );
            }
            PipelineEvent::Error {
                job_id,
                section,
                message,
            } => {
                tracing::error!("[{}] section {:?} failed: {}", job_id, section, message);
            }
        }
    }
}

/// 将事件转发到通道，供外部展示层消费
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PipelineObserver for ChannelObserver {
    fn on_event(&self, event: &PipelineEvent) {
        let _ = self.tx.send(event.clone());
    }
}
