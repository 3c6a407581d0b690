//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__LLM__PROVIDER=openai`）。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::completion::CompletionSettings;
use crate::sync::ReplicatorSettings;
use crate::turns::ClausePolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub conversation: ConversationSection,
    pub sync: SyncSection,
}

/// [app] 段：应用名、系统指令模板、开场白
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 系统指令模板文件；未设置时用内置指令
    pub instructions_path: Option<PathBuf>,
    /// 接通后先说的开场白
    pub greeting: Option<String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: Some("bee-call".to_string()),
            instructions_path: None,
            greeting: Some("Hello! How can I help you today?".to_string()),
        }
    }
}

/// [llm] 段：后端选择、模型与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    /// 打开流失败后的最大重试次数
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl LlmSection {
    /// 实际请求的模型名；deepseek 后端未显式配置时用 deepseek-chat
    pub fn effective_model(&self) -> String {
        if self.provider.eq_ignore_ascii_case("deepseek") && self.model.starts_with("gpt-") {
            crate::llm::DEEPSEEK_CHAT.to_string()
        } else {
            self.model.clone()
        }
    }
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: None,
            max_retries: 3,
            retry_backoff_ms: 1000,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
        }
    }
}

/// [conversation] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationSection {
    /// 打断清理时，被打断的那一句是否保留在记录里
    pub include_interrupted_clause: bool,
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            include_interrupted_clause: true,
        }
    }
}

impl ConversationSection {
    pub fn clause_policy(&self) -> ClausePolicy {
        if self.include_interrupted_clause {
            ClausePolicy::Include
        } else {
            ClausePolicy::Exclude
        }
    }
}

/// [sync] 段：外部同步存储与复制队列参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// none / memory / twilio
    pub backend: String,
    /// 未设置时读 TWILIO_ACCOUNT_SID
    pub account_sid: Option<String>,
    /// 未设置时读 TWILIO_AUTH_TOKEN
    pub auth_token: Option<String>,
    /// 未设置时读 TWILIO_SYNC_SVC_SID
    pub service_sid: Option<String>,
    pub burst_limit: usize,
    pub burst_window_ms: u64,
    pub write_timeout_ms: u64,
    pub debounce_min_ms: u64,
    pub debounce_max_wait_ms: u64,
    pub lane_capacity: usize,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            backend: "none".to_string(),
            account_sid: None,
            auth_token: None,
            service_sid: None,
            burst_limit: 10,
            burst_window_ms: 1000,
            write_timeout_ms: 5000,
            debounce_min_ms: 150,
            debounce_max_wait_ms: 1000,
            lane_capacity: 64,
        }
    }
}

impl SyncSection {
    pub fn replicator_settings(&self) -> ReplicatorSettings {
        ReplicatorSettings {
            burst_limit: self.burst_limit,
            burst_window: Duration::from_millis(self.burst_window_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            debounce_min: Duration::from_millis(self.debounce_min_ms),
            debounce_max_wait: Duration::from_millis(self.debounce_max_wait_ms),
            lane_capacity: self.lane_capacity.max(1),
        }
    }
}

/// 内置系统指令（未配置 instructions_path 时使用）
pub const DEFAULT_INSTRUCTIONS: &str = "You are a friendly voice agent on a phone call. \
Answer in one or two short, speakable sentences without markdown. \
Caller number: {{call.from}}. Known facts about the caller: {{user}}.";

impl AppConfig {
    /// 读取系统指令模板；文件不可读时退回内置指令
    pub fn instructions(&self) -> String {
        match &self.app.instructions_path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "instructions file unreadable, using built-in");
                    DEFAULT_INSTRUCTIONS.to_string()
                }
            },
            None => DEFAULT_INSTRUCTIONS.to_string(),
        }
    }

    pub fn completion_settings(&self) -> CompletionSettings {
        CompletionSettings {
            model: self.llm.effective_model(),
            temperature: self.llm.temperature,
            max_retries: self.llm.max_retries,
            retry_backoff: Duration::from_millis(self.llm.retry_backoff_ms),
            instructions: self.instructions(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if Path::new(&format!("{name}.toml")).exists() {
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
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
