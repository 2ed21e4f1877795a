//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `QUILL__*` 覆盖（双下划线表示嵌套，如 `QUILL__SCHEDULER__AUTO_ADVANCE=false`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::{ModelPricing, RetryPolicy};
use crate::pipeline::PipelineConfig;
use crate::scheduler::SchedulerConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub generation: GenerationSection,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerSection,
    pub store: StoreSection,
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / mock；openai 缺少 API Key 时回退到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [generation] 段：单次调用超时与重试预算、模型价格表
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationSection {
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub timeout_retry_delay_secs: u64,
    /// 第 n 次普通错误重试等待 n 倍
    #[serde(default = "default_retry_delay_secs")]
    pub error_retry_delay_secs: u64,
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,
    #[serde(default = "default_rate_limit_delays_secs")]
    pub rate_limit_delays_secs: Vec<u64>,
    /// 模型名 → 每百万 token 美元价格
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_max_retries(),
            timeout_retry_delay_secs: default_retry_delay_secs(),
            error_retry_delay_secs: default_retry_delay_secs(),
            rate_limit_retries: default_rate_limit_retries(),
            rate_limit_delays_secs: default_rate_limit_delays_secs(),
            pricing: HashMap::new(),
        }
    }
}

impl GenerationSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            max_retries: self.max_retries,
            timeout_retry_delay: Duration::from_secs(self.timeout_retry_delay_secs),
            error_retry_delay: Duration::from_secs(self.error_retry_delay_secs),
            rate_limit_retries: self.rate_limit_retries,
            rate_limit_delays: self
                .rate_limit_delays_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

fn default_call_timeout_secs() -> u64 {
    180
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_rate_limit_retries() -> u32 {
    5
}

fn default_rate_limit_delays_secs() -> Vec<u64> {
    vec![30, 60, 90, 120, 180]
}

/// [scheduler] 段：派发、监管与恢复参数（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub auto_advance: bool,
    pub poll_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub freeze_threshold_secs: u64,
    pub sweep_interval_secs: u64,
    pub sweep_threshold_secs: u64,
    pub recovery_delay_secs: u64,
    pub restart_delay_secs: u64,
    pub rate_limit_backoff_secs: u64,
    pub skip_on_error: bool,
    /// 0 表示不限
    pub max_recovery_attempts: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            auto_advance: true,
            poll_interval_secs: 15,
            heartbeat_interval_secs: 30,
            freeze_threshold_secs: 240,
            sweep_interval_secs: 60,
            sweep_threshold_secs: 600,
            recovery_delay_secs: 5,
            restart_delay_secs: 3,
            rate_limit_backoff_secs: 120,
            skip_on_error: false,
            max_recovery_attempts: 5,
        }
    }
}

impl SchedulerSection {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            auto_advance: self.auto_advance,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            freeze_threshold: Duration::from_secs(self.freeze_threshold_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            sweep_threshold: Duration::from_secs(self.sweep_threshold_secs),
            recovery_delay: Duration::from_secs(self.recovery_delay_secs),
            restart_delay: Duration::from_secs(self.restart_delay_secs),
            rate_limit_backoff: Duration::from_secs(self.rate_limit_backoff_secs),
            skip_on_error: self.skip_on_error,
            max_recovery_attempts: self.max_recovery_attempts,
        }
    }
}

/// [store] 段：持久化后端
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// memory / sqlite（sqlite 需启用 async-sqlite 特性）
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/quill.db")
}

/// 从 config 目录加载配置，环境变量 QUILL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 QUILL__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("QUILL")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
