//! 轮次数据模型
//!
//! Turn 由公共字段（id / callId / createdAt / order / version）与按 role、type 区分的主体组成。
//! 序列化形状即复制到外部存储的 JSON。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 轮次 ID（进程内唯一）
pub type TurnId = String;

/// Bot 轮次状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Streaming,
    Complete,
    Interrupted,
}

/// Bot 轮次来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotOrigin {
    #[default]
    Llm,
    Greeting,
    Filler,
}

/// System 轮次来源（目前仅有人工坐席回复）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemOrigin {
    #[default]
    Human,
}

/// 工具函数名与参数；两者都由流式片段逐段拼接
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// 单个工具调用；result 在执行完成前为 None
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub index: usize,
    pub function: FunctionCall,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        index: usize,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            index,
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
            result: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotText {
    pub content: String,
    pub interrupted: bool,
    pub status: TurnStatus,
    pub origin: BotOrigin,
}

/// Bot 发送的按键音；content 为按键序列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotDtmf {
    pub content: String,
    pub interrupted: bool,
    pub status: TurnStatus,
    pub origin: BotOrigin,
}

/// 一次 LLM 回复中并行请求的 N 个工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotTool {
    pub tool_calls: Vec<ToolCall>,
    pub status: TurnStatus,
    pub origin: BotOrigin,
}

impl BotTool {
    /// 全部调用都有结果后才允许发给 LLM
    pub fn is_resolved(&self) -> bool {
        self.tool_calls.iter().all(ToolCall::is_resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HumanTurn {
    Text { content: String },
    Dtmf { content: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotTurn {
    Text(BotText),
    Dtmf(BotDtmf),
    Tool(BotTool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemTurn {
    pub content: String,
    pub origin: SystemOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TurnBody {
    Human(HumanTurn),
    Bot(BotTurn),
    System(SystemTurn),
}

/// 一个对话事件：身份不可变、内容可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: TurnId,
    pub call_id: String,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    pub order: u64,
    pub version: u64,
    #[serde(flatten)]
    pub body: TurnBody,
}

impl Turn {
    pub fn is_bot(&self) -> bool {
        matches!(self.body, TurnBody::Bot(_))
    }

    pub fn as_bot_text(&self) -> Option<&BotText> {
        match &self.body {
            TurnBody::Bot(BotTurn::Text(t)) => Some(t),
            _ => None,
        }
    }

    pub fn as_bot_text_mut(&mut self) -> Option<&mut BotText> {
        match &mut self.body {
            TurnBody::Bot(BotTurn::Text(t)) => Some(t),
            _ => None,
        }
    }

    pub fn as_bot_tool(&self) -> Option<&BotTool> {
        match &self.body {
            TurnBody::Bot(BotTurn::Tool(t)) => Some(t),
            _ => None,
        }
    }

    pub fn as_bot_tool_mut(&mut self) -> Option<&mut BotTool> {
        match &mut self.body {
            TurnBody::Bot(BotTurn::Tool(t)) => Some(t),
            _ => None,
        }
    }

    /// Bot 轮次的状态；human / system 轮次没有状态
    pub fn status(&self) -> Option<TurnStatus> {
        match &self.body {
            TurnBody::Bot(BotTurn::Text(t)) => Some(t.status),
            TurnBody::Bot(BotTurn::Dtmf(t)) => Some(t.status),
            TurnBody::Bot(BotTurn::Tool(t)) => Some(t.status),
            _ => None,
        }
    }

    pub fn set_status(&mut self, status: TurnStatus) {
        match &mut self.body {
            TurnBody::Bot(BotTurn::Text(t)) => t.status = status,
            TurnBody::Bot(BotTurn::Dtmf(t)) => t.status = status,
            TurnBody::Bot(BotTurn::Tool(t)) => t.status = status,
            _ => {}
        }
    }

    /// 文本 / 按键类 Bot 轮次的可追加内容
    pub fn bot_content_mut(&mut self) -> Option<&mut String> {
        match &mut self.body {
            TurnBody::Bot(BotTurn::Text(t)) => Some(&mut t.content),
            TurnBody::Bot(BotTurn::Dtmf(t)) => Some(&mut t.content),
            _ => None,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match &self.body {
            TurnBody::Human(HumanTurn::Text { .. }) => "human_text",
            TurnBody::Human(HumanTurn::Dtmf { .. }) => "human_dtmf",
            TurnBody::Bot(BotTurn::Text(_)) => "bot_text",
            TurnBody::Bot(BotTurn::Dtmf(_)) => "bot_dtmf",
            TurnBody::Bot(BotTurn::Tool(_)) => "bot_tool",
            TurnBody::System(_) => "system",
        }
    }
}

/// 新增 human 轮次的参数
#[derive(Debug, Clone, Default)]
pub struct HumanParams {
    pub id: Option<TurnId>,
    pub content: String,
}

impl HumanParams {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// 新增 Bot 文本 / 按键轮次的参数
#[derive(Debug, Clone)]
pub struct BotTextParams {
    pub id: Option<TurnId>,
    pub content: String,
    pub status: TurnStatus,
    pub origin: BotOrigin,
}

impl BotTextParams {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
            status: TurnStatus::Streaming,
            origin: BotOrigin::Llm,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_status(mut self, status: TurnStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_origin(mut self, origin: BotOrigin) -> Self {
        self.origin = origin;
        self
    }
}

/// 新增 Bot 工具轮次的参数
#[derive(Debug, Clone)]
pub struct BotToolParams {
    pub id: Option<TurnId>,
    pub tool_calls: Vec<ToolCall>,
    pub status: TurnStatus,
    pub origin: BotOrigin,
}

impl BotToolParams {
    pub fn new(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            id: None,
            tool_calls,
            status: TurnStatus::Streaming,
            origin: BotOrigin::Llm,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_status(mut self, status: TurnStatus) -> Self {
        self.status = status;
        self
    }
}

/// 新增 System 轮次的参数
#[derive(Debug, Clone, Default)]
pub struct SystemParams {
    pub id: Option<TurnId>,
    pub content: String,
    pub origin: SystemOrigin,
}

impl SystemParams {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
            origin: SystemOrigin::Human,
        }
    }
}
