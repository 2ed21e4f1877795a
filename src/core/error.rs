//! 错误类型：生成调用分类、存储、流水线与调度器
//!
//! GenerationErrorKind 是生成调用的封闭分类；包装器只返回数据（GenerationResult），
//! 由上层根据分类决定重试、暂停队列或跳过任务。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobStatus;

/// 生成调用失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationErrorKind {
    /// 取消令牌已触发，未发起（或未继续）调用
    Cancelled,
    /// 限流预算耗尽
    RateLimited,
    /// 超时重试耗尽
    Timeout,
    /// 普通错误重试耗尽
    TransientError,
    /// 不可重试（鉴权失败、非法请求等）
    FatalError,
    /// 输出无法解析为结构化结果
    MalformedOutput,
}

impl GenerationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::TransientError => "transient_error",
            Self::FatalError => "fatal_error",
            Self::MalformedOutput => "malformed_output",
        }
    }
}

impl std::fmt::Display for GenerationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 持久化层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Queue item not found: {0}")]
    QueueItemNotFound(String),

    /// 违反单一 processing 约束等
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// 流水线错误：某一阶段的生成调用升级失败，或持久化失败
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{stage} stage failed for section {section} ({kind}): {message}")]
    Generation {
        section: i32,
        stage: &'static str,
        kind: GenerationErrorKind,
        message: String,
    },

    #[error("Job cancelled at section {section}")]
    Cancelled { section: i32 },

    #[error("Section not found: {0}")]
    SectionNotFound(i32),

    #[error("Job {job_id} cannot run from status {status:?}")]
    InvalidStatus { job_id: String, status: JobStatus },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// 失败的生成分类（非生成错误返回 None）
    pub fn kind(&self) -> Option<GenerationErrorKind> {
        match self {
            PipelineError::Generation { kind, .. } => Some(*kind),
            PipelineError::Cancelled { .. } => Some(GenerationErrorKind::Cancelled),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == Some(GenerationErrorKind::Cancelled)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind() == Some(GenerationErrorKind::RateLimited)
    }
}

/// 调度器错误
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Queue item {0} is not waiting")]
    NotWaiting(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_error_display() {
        let err = PipelineError::Generation {
            section: 3,
            stage: "critique",
            kind: GenerationErrorKind::RateLimited,
            message: "429 Too Many Requests".into(),
        };
        assert_eq!(
            err.to_string(),
            "critique stage failed for section 3 (rate_limited): 429 Too Many Requests"
        );
        assert!(err.is_rate_limited());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn cancelled_maps_to_cancelled_kind() {
        let err = PipelineError::Cancelled { section: 1 };
        assert!(err.is_cancelled());
        assert_eq!(err.kind(), Some(GenerationErrorKind::Cancelled));
    }

    #[test]
    fn store_error_is_not_a_generation_failure() {
        let err = PipelineError::from(StoreError::Backend("disk full".into()));
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineError>();
        assert_send_sync::<SchedulerError>();
    }
}
