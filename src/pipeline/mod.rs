//! 任务流水线：分节状态机、评审解析、提示词模板与过程事件

pub mod critique;
pub mod events;
pub mod prompts;
pub mod runner;

pub use critique::CritiqueVerdict;
pub use events::{
    ChannelObserver, ObserverSet, PipelineEvent, PipelineObserver, Stage, TracingObserver,
};
pub use prompts::{PromptBuilder, PromptTemplates};
pub use runner::{JobPipeline, JobRunSummary, PipelineConfig};
