//! 核心层：错误分类与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{GenerationErrorKind, PipelineError, SchedulerError, StoreError};
pub use shutdown::{
    serve_until_shutdown, ShutdownHook, ShutdownReason, ShutdownSequence, ShutdownSignal,
    StopScheduler,
};
