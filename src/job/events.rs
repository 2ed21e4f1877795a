//! 持久化事件：恢复 / 失败记录与用量记账
//!
//! 冻结的任务从不静默丢失：每次恢复、降级、失败、取消、跳过都写入 JobEvent，供事后查看。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{JobId, TokenUsage};

/// 任务事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Dispatched,
    Completed,
    /// 心跳超时触发的恢复
    HeartbeatRecovery,
    /// 持久化活动巡检触发的恢复
    SweepRecovery,
    /// 恢复次数超过上限，任务被标记失败
    RecoveryExhausted,
    /// 停止调度或启动对账时降级为 waiting
    Demoted,
    Failed,
    RateLimited,
    Cancelled,
    Skipped,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::Dispatched => "dispatched",
            JobEventKind::Completed => "completed",
            JobEventKind::HeartbeatRecovery => "heartbeat_recovery",
            JobEventKind::SweepRecovery => "sweep_recovery",
            JobEventKind::RecoveryExhausted => "recovery_exhausted",
            JobEventKind::Demoted => "demoted",
            JobEventKind::Failed => "failed",
            JobEventKind::RateLimited => "rate_limited",
            JobEventKind::Cancelled => "cancelled",
            JobEventKind::Skipped => "skipped",
        }
    }
}

/// 单条任务事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobEventKind,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: impl Into<JobId>, kind: JobEventKind, detail: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

/// 一次成功生成调用的用量与估算费用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub job_id: JobId,
    /// 调用所用角色（writer / critic / editor）
    pub persona: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub at: DateTime<Utc>,
}
