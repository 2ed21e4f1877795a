//! 生成服务抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 GenerativeService：一次 generate 调用返回内容与用量。
//! 超时、重试与取消不在这里处理，而是由 GenerationCaller 统一负责。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::TokenUsage;

/// 单个阶段的调用参数（写作 / 评审 / 润色各一份）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// 角色名（writer / critic / editor），同时用于用量记账
    pub persona: String,
    /// 为空时使用后端默认模型
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// 系统提示词
    pub system_prompt: String,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            persona: "writer".to_string(),
            model: None,
            temperature: 0.8,
            max_tokens: 8192,
            system_prompt: String::new(),
        }
    }
}

impl StageConfig {
    pub fn with_persona(persona: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            ..Default::default()
        }
    }
}

/// 一次生成请求：提示词 + 阶段配置
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub config: StageConfig,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, config: StageConfig) -> Self {
        Self {
            prompt: prompt.into(),
            config,
        }
    }
}

/// 后端返回的原始结果
#[derive(Debug, Clone, Default)]
pub struct ProviderOutput {
    pub content: String,
    pub usage: TokenUsage,
    /// 实际使用的模型（后端可能替换）
    pub model: Option<String>,
}

/// 后端错误；GenerationCaller 在此基础上再按消息特征细分
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// 鉴权失败、非法请求等不可重试错误
    #[error("Fatal provider error: {0}")]
    Fatal(String),

    #[error("Provider error: {0}")]
    Transient(String),
}

const RATE_LIMIT_SIGNATURES: [&str; 6] = [
    "429",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota",
];

impl ProviderError {
    /// 是否属于限流：显式变体或消息中带有限流特征
    pub fn is_rate_limit(&self) -> bool {
        match self {
            ProviderError::RateLimited(_) => true,
            ProviderError::Fatal(_) => false,
            ProviderError::Transient(msg) => {
                let lower = msg.to_lowercase();
                RATE_LIMIT_SIGNATURES.iter().any(|s| lower.contains(s))
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::Fatal(_))
    }
}

/// 外部生成服务
#[async_trait]
pub trait GenerativeService: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<ProviderOutput, ProviderError>;

    /// 未指定模型时使用的默认模型名（用于记账）
    fn default_model(&self) -> &str {
        "default"
    }
}
