//! Mock 生成服务（用于测试与离线运行，无需 API）
//!
//! 按角色（persona）预置回复脚本：文本、错误或永不返回；脚本耗尽后给出默认回复。
//! 记录每次调用的角色、提示词与时间，便于断言调用次数与退避间隔。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::job::TokenUsage;
use crate::llm::{GenerationRequest, GenerativeService, ProviderError, ProviderOutput};

/// 预置回复
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Error(ProviderError),
    /// 永不返回（模拟卡死的调用）
    Hang,
    /// 延迟后返回文本
    Delayed(Duration, String),
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Reply::Text(s.into())
    }

    pub fn rate_limited() -> Self {
        Reply::Error(ProviderError::RateLimited("429 Too Many Requests".into()))
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Reply::Error(ProviderError::Transient(msg.into()))
    }
}

/// 单次调用记录
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub persona: String,
    pub prompt: String,
    pub at: Instant,
}

/// 脚本化生成服务
#[derive(Debug, Default)]
pub struct ScriptedService {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<CallRecord>>,
    usage_per_call: TokenUsage,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self {
            usage_per_call: TokenUsage::new(100, 200, 0),
            ..Default::default()
        }
    }

    /// 为角色追加一组回复（按顺序消费）
    pub fn with_replies(self, persona: &str, replies: Vec<Reply>) -> Self {
        self.push_replies(persona, replies);
        self
    }

    pub fn push_replies(&self, persona: &str, replies: Vec<Reply>) {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        scripts
            .entry(persona.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn calls_for(&self, persona: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.persona == persona)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn call_log(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn next_reply(&self, persona: &str) -> Option<Reply> {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        scripts.get_mut(persona).and_then(|q| q.pop_front())
    }

    fn default_reply(persona: &str, prompt: &str) -> String {
        match persona {
            "critic" => {
                r#"{"score": 8.5, "approved": true, "diagnosis": "Reads cleanly."}"#.to_string()
            }
            "editor" => format!("Polished: {}", first_line(prompt)),
            "writer" => format!(
                "Draft for {}.\n### EXIT STATE\nThe section closes on a quiet note.",
                first_line(prompt)
            ),
            _ => "ok".to_string(),
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

#[async_trait]
impl GenerativeService for ScriptedService {
    async fn generate(&self, request: &GenerationRequest) -> Result<ProviderOutput, ProviderError> {
        let persona = request.config.persona.clone();
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            calls.push(CallRecord {
                persona: persona.clone(),
                prompt: request.prompt.clone(),
                at: Instant::now(),
            });
        }

        let content = match self.next_reply(&persona) {
            Some(Reply::Text(s)) => s,
            Some(Reply::Error(e)) => return Err(e),
            Some(Reply::Hang) => std::future::pending::<String>().await,
            Some(Reply::Delayed(delay, s)) => {
                tokio::time::sleep(delay).await;
                s
            }
            None => Self::default_reply(&persona, &request.prompt),
        };

        Ok(ProviderOutput {
            content,
            usage: self.usage_per_call,
            model: request.config.model.clone(),
        })
    }

    fn default_model(&self) -> &str {
        "mock"
    }
}
