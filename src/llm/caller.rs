//! 生成调用包装器
//!
//! invoke(request, ctx) 对单个工作单元调用外部生成服务，负责：
//! - 每次尝试前检查取消令牌（已取消则不发起调用）
//! - 单次尝试的整体超时；超时与普通错误共用标准重试预算，普通错误延迟随次数线性增长
//! - 限流使用独立的、更大的预算与固定递增延迟表（超出表长取最后一项）
//! - 成功时提取内容与用量，并向用量出口记账
//!
//! 普通失败从不以 Err 返回：结果里带 error / timed_out，调用方按数据分支。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::core::GenerationErrorKind;
use crate::job::{JobId, TokenUsage, UsageEvent};
use crate::llm::{GenerationRequest, GenerativeService};

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 单次尝试的整体期限
    pub call_timeout: Duration,
    /// 超时与普通错误共用的重试次数
    pub max_retries: u32,
    /// 超时后的固定等待
    pub timeout_retry_delay: Duration,
    /// 普通错误等待基数（第 n 次重试等待 n 倍）
    pub error_retry_delay: Duration,
    /// 限流重试次数（独立计数）
    pub rate_limit_retries: u32,
    /// 限流等待表，按限流重试序号索引
    pub rate_limit_delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(180),
            max_retries: 2,
            timeout_retry_delay: Duration::from_secs(5),
            error_retry_delay: Duration::from_secs(5),
            rate_limit_retries: 5,
            rate_limit_delays: [30, 60, 90, 120, 180]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// 第 `retry` 次（从 0 开始）限流重试前的等待
    pub fn rate_limit_delay(&self, retry: u32) -> Duration {
        match self.rate_limit_delays.len() {
            0 => Duration::from_secs(60),
            len => self.rate_limit_delays[(retry as usize).min(len - 1)],
        }
    }

    /// 第 `retry` 次（从 1 开始）普通错误重试前的等待
    pub fn error_delay(&self, retry: u32) -> Duration {
        self.error_retry_delay * retry.max(1)
    }
}

/// 模型单价（美元 / 百万 token）
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// 一次包装调用的结果（不落库，由调用方决定保存什么）
#[derive(Debug, Clone, Default)]
pub struct GenerationResult {
    pub content: String,
    pub error: Option<GenerationErrorKind>,
    pub error_message: Option<String>,
    pub timed_out: bool,
    /// 不可用时为 0
    pub usage: TokenUsage,
    pub attempts: u32,
    pub model: Option<String>,
}

impl GenerationResult {
    fn failure(kind: GenerationErrorKind, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            error: Some(kind),
            error_message: Some(message.into()),
            timed_out: kind == GenerationErrorKind::Timeout,
            attempts,
            ..Default::default()
        }
    }

    fn cancelled(attempts: u32) -> Self {
        Self::failure(GenerationErrorKind::Cancelled, "cancelled before attempt", attempts)
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        self.error == Some(GenerationErrorKind::Cancelled)
    }

    pub fn error_text(&self) -> String {
        self.error_message
            .clone()
            .or_else(|| self.error.map(|k| k.to_string()))
            .unwrap_or_default()
    }
}

/// 重试原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Timeout,
    RateLimited,
    Transient,
}

/// 即将重试的通知（等待开始前发出）
#[derive(Debug, Clone)]
pub struct RetryNotice {
    /// 刚失败的尝试序号（从 1 开始）
    pub attempt: u32,
    pub reason: RetryReason,
    pub delay: Duration,
    pub message: String,
}

pub type RetryHook = Arc<dyn Fn(&RetryNotice) + Send + Sync>;

/// 调用上下文：所属任务、取消令牌、重试回调
#[derive(Clone)]
pub struct CallContext {
    pub job_id: Option<JobId>,
    pub cancel: CancellationToken,
    pub on_retry: Option<RetryHook>,
}

impl CallContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            job_id: None,
            cancel,
            on_retry: None,
        }
    }

    pub fn for_job(job_id: impl Into<JobId>, cancel: CancellationToken) -> Self {
        Self {
            job_id: Some(job_id.into()),
            cancel,
            on_retry: None,
        }
    }

    pub fn with_retry_hook(mut self, hook: RetryHook) -> Self {
        self.on_retry = Some(hook);
        self
    }
}

/// 用量记账出口
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, event: UsageEvent);
}

/// 生成调用包装器：持有后端、重试策略、可选记账出口与价格表
pub struct GenerationCaller {
    service: Arc<dyn GenerativeService>,
    policy: RetryPolicy,
    usage_sink: Option<Arc<dyn UsageSink>>,
    pricing: HashMap<String, ModelPricing>,
}

impl GenerationCaller {
    pub fn new(service: Arc<dyn GenerativeService>, policy: RetryPolicy) -> Self {
        Self {
            service,
            policy,
            usage_sink: None,
            pricing: HashMap::new(),
        }
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    pub fn with_pricing(mut self, pricing: HashMap<String, ModelPricing>) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 执行一次带重试的生成调用
    pub async fn invoke(&self, request: &GenerationRequest, ctx: &CallContext) -> GenerationResult {
        let mut attempts = 0u32;
        let mut standard_retries = 0u32;
        let mut rate_limit_retries = 0u32;

        loop {
            if ctx.cancel.is_cancelled() {
                tracing::debug!(
                    "Generation cancelled before attempt {} ({})",
                    attempts + 1,
                    request.config.persona
                );
                return GenerationResult::cancelled(attempts);
            }
            attempts += 1;

            let call = self.service.generate(request);
            let outcome = tokio::time::timeout(self.policy.call_timeout, call).await;

            let (reason, delay, message) = match outcome {
                Ok(Ok(output)) => {
                    let model = output
                        .model
                        .or_else(|| request.config.model.clone())
                        .unwrap_or_else(|| self.service.default_model().to_string());
                    self.record_usage(ctx, &request.config.persona, &model, &output.usage)
                        .await;
                    return GenerationResult {
                        content: output.content,
                        usage: output.usage,
                        attempts,
                        model: Some(model),
                        ..Default::default()
                    };
                }
                Err(_elapsed) => {
                    let message = format!(
                        "call exceeded {}s deadline",
                        self.policy.call_timeout.as_secs()
                    );
                    if standard_retries >= self.policy.max_retries {
                        tracing::warn!(
                            "Generation timed out after {} attempts ({})",
                            attempts,
                            request.config.persona
                        );
                        return GenerationResult::failure(
                            GenerationErrorKind::Timeout,
                            message,
                            attempts,
                        );
                    }
                    standard_retries += 1;
                    (RetryReason::Timeout, self.policy.timeout_retry_delay, message)
                }
                Ok(Err(e)) if e.is_fatal() => {
                    tracing::error!("Fatal generation error ({}): {}", request.config.persona, e);
                    return GenerationResult::failure(
                        GenerationErrorKind::FatalError,
                        e.to_string(),
                        attempts,
                    );
                }
                Ok(Err(e)) if e.is_rate_limit() => {
                    if rate_limit_retries >= self.policy.rate_limit_retries {
                        tracing::warn!(
                            "Rate limit budget exhausted after {} attempts ({})",
                            attempts,
                            request.config.persona
                        );
                        return GenerationResult::failure(
                            GenerationErrorKind::RateLimited,
                            e.to_string(),
                            attempts,
                        );
                    }
                    let delay = self.policy.rate_limit_delay(rate_limit_retries);
                    rate_limit_retries += 1;
                    (RetryReason::RateLimited, delay, e.to_string())
                }
                Ok(Err(e)) => {
                    if standard_retries >= self.policy.max_retries {
                        return GenerationResult::failure(
                            GenerationErrorKind::TransientError,
                            e.to_string(),
                            attempts,
                        );
                    }
                    standard_retries += 1;
                    (
                        RetryReason::Transient,
                        self.policy.error_delay(standard_retries),
                        e.to_string(),
                    )
                }
            };

            tracing::warn!(
                "Generation attempt {} failed ({:?}, {}): {}; retrying in {}s",
                attempts,
                reason,
                request.config.persona,
                message,
                delay.as_secs()
            );
            if let Some(hook) = &ctx.on_retry {
                hook(&RetryNotice {
                    attempt: attempts,
                    reason,
                    delay,
                    message,
                });
            }

            // 等待期间取消则立即进入下一轮，由循环顶部返回 Cancelled
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => {}
            }
        }
    }

    async fn record_usage(
        &self,
        ctx: &CallContext,
        persona: &str,
        model: &str,
        usage: &TokenUsage,
    ) {
        let (Some(sink), Some(job_id)) = (&self.usage_sink, &ctx.job_id) else {
            return;
        };
        let event = UsageEvent {
            job_id: job_id.clone(),
            persona: persona.to_string(),
            model: model.to_string(),
            usage: *usage,
            cost_usd: self.estimate_cost(model, usage),
            at: Utc::now(),
        };
        sink.record(event).await;
    }

    /// 按价格表估算费用；思考 token 按输出计价，未知模型为 0
    pub fn estimate_cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        let Some(price) = self.pricing.get(model) else {
            return 0.0;
        };
        let input = usage.input_tokens as f64 * price.input_per_mtok;
        let output = (usage.output_tokens + usage.thinking_tokens) as f64 * price.output_per_mtok;
        (input + output) / 1_000_000.0
    }
}
