//! 内存心跳
//!
//! 流水线每个过程事件刷新一次；心跳定时器比较「距上次心跳」与冻结阈值。
//! 使用 tokio Instant，便于在暂停时间的测试里推进。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::pipeline::{PipelineEvent, PipelineObserver};

/// 单调不减的心跳时间戳
#[derive(Debug, Clone)]
pub struct Heartbeat {
    last: Arc<Mutex<Instant>>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn beat(&self) {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if now > *last {
            *last = now;
        }
    }

    pub fn last(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last())
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// 把流水线事件转为心跳
pub struct HeartbeatObserver {
    heartbeat: Heartbeat,
}

impl HeartbeatObserver {
    pub fn new(heartbeat: Heartbeat) -> Self {
        Self { heartbeat }
    }
}

impl PipelineObserver for HeartbeatObserver {
    fn on_event(&self, _event: &PipelineEvent) {
        self.heartbeat.beat();
    }
}
