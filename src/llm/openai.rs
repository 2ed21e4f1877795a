//! OpenAI 兼容 API 生成服务
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 错误按消息特征映射为 ProviderError，重试与超时交给 GenerationCaller。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CompletionUsage, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::job::TokenUsage;
use crate::llm::{GenerationRequest, GenerativeService, ProviderError, ProviderOutput};

/// OpenAI 兼容客户端：持有 Client 与默认 model 名
pub struct OpenAiService {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiService {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    fn to_messages(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, ProviderError> {
        let mut messages = Vec::with_capacity(2);
        if !request.config.system_prompt.is_empty() {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(request.config.system_prompt.clone())
                    .build()
                    .map_err(|e| ProviderError::Fatal(e.to_string()))?,
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.prompt.clone())
                .build()
                .map_err(|e| ProviderError::Fatal(e.to_string()))?,
        ));
        Ok(messages)
    }
}

/// 将 async_openai 错误映射为后端错误分类
fn classify(err: OpenAIError) -> ProviderError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    match err {
        OpenAIError::InvalidArgument(_) => ProviderError::Fatal(message),
        _ if lower.contains("invalid_api_key")
            || lower.contains("incorrect api key")
            || lower.contains("401")
            || lower.contains("invalid_request_error") =>
        {
            ProviderError::Fatal(message)
        }
        _ => {
            let err = ProviderError::Transient(message.clone());
            if err.is_rate_limit() {
                ProviderError::RateLimited(message)
            } else {
                err
            }
        }
    }
}

/// completion_tokens 已包含推理 token；推理部分另记为 thinking
fn usage_of(u: &CompletionUsage) -> TokenUsage {
    let reasoning = u
        .completion_tokens_details
        .as_ref()
        .and_then(|d| d.reasoning_tokens)
        .unwrap_or(0);
    TokenUsage::new(u.prompt_tokens as u64, u.completion_tokens as u64, reasoning as u64)
}

#[async_trait]
impl GenerativeService for OpenAiService {
    async fn generate(&self, request: &GenerationRequest) -> Result<ProviderOutput, ProviderError> {
        let model = request
            .config
            .model
            .clone()
            .unwrap_or_else(|| self.model.clone());

        let api_request = CreateChatCompletionRequestArgs::default()
            .model(&model)
            .messages(self.to_messages(request)?)
            .temperature(request.config.temperature)
            .max_completion_tokens(request.config.max_tokens)
            .build()
            .map_err(|e| ProviderError::Fatal(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(api_request)
            .await
            .map_err(classify)?;

        let usage = response.usage.as_ref().map(usage_of).unwrap_or_default();

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(ProviderOutput {
            content,
            usage,
            model: Some(response.model),
        })
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}
