//! OpenAI 兼容 API 客户端（流式）
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 OpenAI、DeepSeek、自建代理等。
//! 请求先拼成 JSON 再反序列化为 async_openai 的请求类型，响应 chunk 序列化回 JSON 后归一化为 StreamChunk，
//! 与具体 SDK 版本的 builder 细节解耦。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::CreateChatCompletionRequest;
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;

use crate::llm::{ChatRequest, ChunkStream, FinishReason, LlmClient, LlmError, StreamChunk, ToolCallDelta};

/// OpenAI 兼容流式客户端
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
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
        }
    }
}

/// 组装请求 JSON：model / messages / tools / stream / temperature
pub fn request_body(request: &ChatRequest) -> Result<Value, LlmError> {
    let messages =
        serde_json::to_value(&request.messages).map_err(|e| LlmError::Request(e.to_string()))?;
    let mut body = serde_json::json!({
        "model": request.model,
        "messages": messages,
        "stream": true,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.clone());
    }
    if let Some(t) = request.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    Ok(body)
}

pub fn map_finish_reason(reason: &str) -> Option<FinishReason> {
    match reason {
        "stop" => Some(FinishReason::Stop),
        "tool_calls" => Some(FinishReason::ToolCalls),
        "length" => Some(FinishReason::Length),
        "content_filter" => Some(FinishReason::ContentFilter),
        "function_call" => Some(FinishReason::FunctionCall),
        other => {
            tracing::warn!(reason = other, "unknown finish reason");
            None
        }
    }
}

/// 将一个 chat.completion.chunk（JSON）归一化为 StreamChunk；只看第一个 choice
pub fn parse_stream_chunk(data: &Value) -> StreamChunk {
    let mut chunk = StreamChunk::default();
    let Some(choice) = data
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        return chunk;
    };

    if let Some(delta) = choice.get("delta") {
        chunk.content = delta
            .get("content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .map(String::from);

        if let Some(calls) = delta.get("tool_calls").and_then(|tc| tc.as_array()) {
            chunk.tool_calls = calls
                .iter()
                .map(|tc| {
                    let function = tc.get("function");
                    let field = |name: &str| {
                        function
                            .and_then(|f| f.get(name))
                            .and_then(|v| v.as_str())
                            .map(String::from)
                    };
                    ToolCallDelta {
                        index: tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize,
                        id: tc.get("id").and_then(|v| v.as_str()).map(String::from),
                        name: field("name"),
                        arguments: field("arguments"),
                    }
                })
                .collect();
        }
    }

    chunk.finish_reason = choice
        .get("finish_reason")
        .and_then(|r| r.as_str())
        .and_then(map_finish_reason);
    chunk
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, LlmError> {
        let body = request_body(&request)?;
        let request: CreateChatCompletionRequest =
            serde_json::from_value(body).map_err(|e| LlmError::Request(e.to_string()))?;

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let chunks = stream.map(|item| match item {
            Ok(response) => serde_json::to_value(&response)
                .map(|v| parse_stream_chunk(&v))
                .map_err(|e| LlmError::Stream(e.to_string())),
            Err(e) => Err(LlmError::Stream(e.to_string())),
        });
        Ok(Box::pin(chunks))
    }
}
