//! LLM 客户端抽象
//!
//! 流式补全的请求 / 增量形状与后端无关：请求携带模型配置、完整消息列表与工具清单，
//! 响应是有序的 StreamChunk 流，每个 chunk 含文本片段或工具调用片段，最后一个带 finish_reason。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::turns::FunctionCall;

#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Invalid request: {0}")]
    Request(String),

    /// 流未能打开（网络 / 鉴权 / 5xx 等），可重试
    #[error("Transport error: {0}")]
    Transport(String),

    /// 流打开后中途出错
    #[error("Stream error: {0}")]
    Stream(String),
}

/// 流结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    FunctionCall,
}

/// 工具调用片段：只有新调用的第一个片段带 id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

impl ToolCallDelta {
    /// 新调用的首个片段
    pub fn start(index: usize, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            index,
            id: Some(id.into()),
            name: Some(name.into()),
            arguments: Some(String::new()),
        }
    }

    /// 续写参数片段
    pub fn args(index: usize, fragment: impl Into<String>) -> Self {
        Self {
            index,
            arguments: Some(fragment.into()),
            ..Default::default()
        }
    }
}

/// 一个流式增量
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<FinishReason>,
}

impl StreamChunk {
    pub fn text(fragment: impl Into<String>) -> Self {
        Self {
            content: Some(fragment.into()),
            ..Default::default()
        }
    }

    pub fn tool(delta: ToolCallDelta) -> Self {
        Self {
            tool_calls: vec![delta],
            ..Default::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Default::default()
        }
    }
}

/// 助手消息里携带的工具调用
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

/// 发往 LLM 的消息（OpenAI chat 形状）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<AssistantToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System { content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User { content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }
}

/// 一次流式补全请求
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// OpenAI function tool 定义
    pub tools: Vec<Value>,
    pub temperature: Option<f32>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// LLM 客户端 trait：打开一个流式补全
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 打开失败返回 Err（由编排器按重试策略处理）
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_tool_message_shape() {
        let msg = ChatMessage::Assistant {
            content: None,
            tool_calls: vec![AssistantToolCall {
                id: "call_1".into(),
                kind: "function".into(),
                function: FunctionCall {
                    name: "getUser".into(),
                    arguments: "{}".into(),
                },
            }],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert!(json.get("content").is_none());
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "getUser");
    }

    #[test]
    fn test_tool_message_shape() {
        let msg = ChatMessage::Tool {
            tool_call_id: "call_1".into(),
            content: "{\"ok\":true}".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
        assert_eq!(msg.role(), "tool");
    }
}
