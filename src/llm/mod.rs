//! LLM 层：流式补全抽象与实现（OpenAI 兼容 / DeepSeek / 脚本化 Mock）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT};
pub use mock::{Script, ScriptedLlmClient};
pub use openai::OpenAiClient;
pub use traits::{
    AssistantToolCall, ChatMessage, ChatRequest, ChunkStream, FinishReason, LlmClient, LlmError,
    StreamChunk, ToolCallDelta,
};

use std::sync::Arc;

use crate::config::LlmSection;

/// 按配置选择 LLM 后端；缺少 API Key 时退回脚本化 Mock（回显）
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let provider = cfg.provider.to_lowercase();
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    match provider.as_str() {
        "deepseek" if has_deepseek_key || openai_key.is_some() => {
            tracing::info!(model = %cfg.effective_model(), "using DeepSeek LLM");
            Arc::new(create_deepseek_client())
        }
        "openai" if openai_key.is_some() => {
            tracing::info!(model = %cfg.effective_model(), "using OpenAI LLM");
            Arc::new(OpenAiClient::new(cfg.base_url.as_deref(), openai_key.as_deref()))
        }
        "mock" => Arc::new(ScriptedLlmClient::default()),
        other => {
            tracing::warn!(provider = other, "no API key set or provider unknown, using mock LLM");
            Arc::new(ScriptedLlmClient::default())
        }
    }
}
