//! 脚本化 LLM 客户端（用于测试与无 API Key 时的本地运行）
//!
//! 每次 stream_chat 消费一段脚本：打开失败、一组 chunk、或发完 chunk 后挂起不结束。
//! 脚本用尽后回显最后一条 user 消息，便于本地跑通整个通话流程。

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use crate::llm::{ChatMessage, ChatRequest, ChunkStream, FinishReason, LlmClient, LlmError, StreamChunk};

/// 单次 stream_chat 的剧本
#[derive(Debug, Clone)]
pub enum Script {
    /// 打开流失败
    Fail(String),
    /// 依次产出这些 chunk 后结束
    Chunks(Vec<StreamChunk>),
    /// 产出这些 chunk 后永不结束（用于打断 / 取消测试）
    Hang(Vec<StreamChunk>),
    /// 产出这些 chunk 后中途报错
    BreakAfter(Vec<StreamChunk>, String),
}

/// 脚本化客户端：记录每一次请求
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlmClient {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(script);
    }

    /// 至今收到的全部请求
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// 把一段文本切成若干文本 chunk，末尾加 stop
    pub fn text_script(text: &str, chunk_chars: usize) -> Script {
        let chars: Vec<char> = text.chars().collect();
        let mut chunks: Vec<StreamChunk> = chars
            .chunks(chunk_chars.max(1))
            .map(|c| StreamChunk::text(c.iter().collect::<String>()))
            .collect();
        chunks.push(StreamChunk::finish(FinishReason::Stop));
        Script::Chunks(chunks)
    }
}

fn echo_script(request: &ChatRequest) -> Script {
    let last_user = request
        .messages
        .iter()
        .rev()
        .find_map(|m| match m {
            ChatMessage::User { content } => Some(content.as_str()),
            _ => None,
        })
        .unwrap_or("(no input)");
    ScriptedLlmClient::text_script(&format!("Echo from Mock: {}", last_user), 6)
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, LlmError> {
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| echo_script(&request));
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        match script {
            Script::Fail(msg) => Err(LlmError::Transport(msg)),
            Script::Chunks(chunks) => Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok::<_, LlmError>)))),
            Script::Hang(chunks) => Ok(Box::pin(
                stream::iter(chunks.into_iter().map(Ok::<_, LlmError>)).chain(stream::pending()),
            )),
            Script::BreakAfter(chunks, msg) => Ok(Box::pin(
                stream::iter(chunks.into_iter().map(Ok::<_, LlmError>))
                    .chain(stream::once(async move { Err(LlmError::Stream(msg)) })),
            )),
        }
    }
}
