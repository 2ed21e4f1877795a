//! Quill - 长时间运行的分节生成任务调度器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、优雅关闭
//! - **job**: 任务 / 分节 / 队列项数据模型与持久化事件
//! - **llm**: 生成服务抽象、调用包装器（超时、重试、取消、记账）、OpenAI 兼容与 Mock 实现
//! - **observability**: tracing 初始化
//! - **pipeline**: 单个任务的分节状态机（写作 → 评审 → 精修 → 润色）
//! - **scheduler**: 单任务派发、心跳与持久化巡检、冻结恢复
//! - **store**: 持久化接口与内存 / SQLite 实现

pub mod config;
pub mod core;
pub mod job;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod scheduler;
pub mod store;

pub use job::{Job, JobPlan, JobStatus, QueueItem, QueueStatus, Section, SectionKind};
pub use pipeline::{JobPipeline, PipelineEvent, PipelineObserver};
pub use scheduler::{JobScheduler, SchedulerEvent, SchedulerState};
