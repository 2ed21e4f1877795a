//! 任务模型：Job、Section、QueueItem 与持久化事件

pub mod events;
pub mod types;

pub use events::{JobEvent, JobEventKind, UsageEvent};
pub use types::{
    build_sections, word_count, Job, JobId, JobPlan, JobStatus, QueueItem, QueueItemId,
    QueueStatus, Section, SectionKind, SectionStatus, TokenUsage,
};
