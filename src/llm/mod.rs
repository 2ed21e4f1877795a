//! LLM 层：生成服务抽象、调用包装器（超时 / 重试 / 取消 / 记账）与实现（OpenAI 兼容 / Mock）

pub mod caller;
pub mod mock;
pub mod openai;
pub mod traits;

pub use caller::{
    CallContext, GenerationCaller, GenerationResult, ModelPricing, RetryHook, RetryNotice,
    RetryPolicy, RetryReason, UsageSink,
};
pub use mock::{Reply, ScriptedService};
pub use openai::OpenAiService;
pub use traits::{GenerationRequest, GenerativeService, ProviderError, ProviderOutput, StageConfig};
