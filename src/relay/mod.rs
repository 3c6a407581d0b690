//! 语音中继协议（ConversationRelay 风格 JSON）
//!
//! 入站：setup / prompt / interrupt / dtmf / error；出站：text token、sendDigits、end（携带 handoffData）。
//! 传输层（WebSocket / webhook）不在本 crate 内，这里只定义线上形状。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 中继发来的消息
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    Setup {
        call_sid: String,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        custom_parameters: Option<Value>,
    },
    /// 语音转写；只有 last = true 才是一句话的最终结果
    Prompt {
        voice_prompt: String,
        #[serde(default = "default_true")]
        last: bool,
    },
    /// 来电者打断了播放；utterance 为打断时正在播放的那一段
    Interrupt {
        utterance_until_interrupt: String,
        #[serde(default)]
        duration_until_interrupt_ms: Option<u64>,
    },
    Dtmf {
        digit: String,
    },
    Error {
        description: String,
    },
}

fn default_true() -> bool {
    true
}

impl RelayMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// 通话结束 / 转人工时附带的数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffData {
    pub reason_code: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl HandoffData {
    pub fn new(reason_code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.into(),
            reason: reason.into(),
            payload: Value::Null,
        }
    }

    /// 重试耗尽等不可恢复错误
    pub fn error(reason: impl Into<String>) -> Self {
        Self::new("error", reason)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// 发往中继的事件
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// 可播放的文本片段；last = true 表示这一轮说完
    Text { token: String, last: bool },
    SendDigits { digits: String },
    End { handoff: HandoffData },
}

impl RelayEvent {
    /// 线上 JSON；end 的 handoffData 是字符串化的 JSON
    pub fn to_wire(&self) -> Value {
        match self {
            RelayEvent::Text { token, last } => serde_json::json!({
                "type": "text",
                "token": token,
                "last": last,
            }),
            RelayEvent::SendDigits { digits } => serde_json::json!({
                "type": "sendDigits",
                "digits": digits,
            }),
            RelayEvent::End { handoff } => serde_json::json!({
                "type": "end",
                "handoffData": serde_json::to_string(handoff).unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inbound_messages() {
        let setup = RelayMessage::parse(
            r#"{"type":"setup","sessionId":"VX1","callSid":"CA1","from":"+15550100","to":"+15550199","customParameters":{"lang":"en"}}"#,
        )
        .unwrap();
        assert!(matches!(setup, RelayMessage::Setup { ref call_sid, .. } if call_sid == "CA1"));

        let prompt =
            RelayMessage::parse(r#"{"type":"prompt","voicePrompt":"Hi there","lang":"en-US","last":true}"#)
                .unwrap();
        assert_eq!(
            prompt,
            RelayMessage::Prompt {
                voice_prompt: "Hi there".into(),
                last: true
            }
        );

        let interrupt = RelayMessage::parse(
            r#"{"type":"interrupt","utteranceUntilInterrupt":"would you like","durationUntilInterruptMs":820}"#,
        )
        .unwrap();
        assert!(matches!(
            interrupt,
            RelayMessage::Interrupt { duration_until_interrupt_ms: Some(820), .. }
        ));

        assert_eq!(
            RelayMessage::parse(r#"{"type":"dtmf","digit":"5"}"#).unwrap(),
            RelayMessage::Dtmf { digit: "5".into() }
        );
        assert!(RelayMessage::parse(r#"{"type":"mystery"}"#).is_err());
    }

    #[test]
    fn test_outbound_wire_shapes() {
        let text = RelayEvent::Text {
            token: "Hello".into(),
            last: false,
        };
        assert_eq!(text.to_wire(), serde_json::json!({"type":"text","token":"Hello","last":false}));

        let end = RelayEvent::End {
            handoff: HandoffData::error("LLM unavailable"),
        };
        let wire = end.to_wire();
        assert_eq!(wire["type"], "end");
        let data: HandoffData = serde_json::from_str(wire["handoffData"].as_str().unwrap()).unwrap();
        assert_eq!(data.reason_code, "error");
        assert_eq!(data.payload, Value::Null);
    }
}
