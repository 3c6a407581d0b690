//! 消息组装：系统指令渲染 + 轮次到 LLM 消息的翻译
//!
//! 系统指令是一个带 `{{ key.path }}` 占位符的模板，用当前会话上下文填充。
//! 轮次按 order 依次翻译为 OpenAI chat 消息；结果未全部就绪的工具轮次属于不变量破坏，记录后过滤掉。

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::llm::{AssistantToolCall, ChatMessage};
use crate::turns::{BotTurn, HumanTurn, Turn, TurnBody};

static PLACEHOLDER_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn placeholder() -> Option<&'static Regex> {
    PLACEHOLDER_RE
        .get_or_init(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").ok())
        .as_ref()
}

fn lookup<'a>(context: &'a BTreeMap<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = context.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// 渲染系统指令：字符串原样填入，其他值填 JSON；缺失的键替换为空串
pub fn render_instructions(template: &str, context: &BTreeMap<String, Value>) -> String {
    let Some(re) = placeholder() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures<'_>| {
        let path = &caps[1];
        match lookup(context, path) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => {
                tracing::debug!(path, "instruction placeholder has no value");
                String::new()
            }
            Some(other) => other.to_string(),
        }
    })
    .into_owned()
}

fn result_content(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 把轮次列表翻译为 LLM 消息（不含系统指令）
pub fn turns_to_messages(turns: &[Turn]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(turns.len());
    for turn in turns {
        match &turn.body {
            TurnBody::Human(HumanTurn::Text { content }) => {
                messages.push(ChatMessage::user(content.clone()));
            }
            TurnBody::Human(HumanTurn::Dtmf { content }) => {
                messages.push(ChatMessage::user(format!("Pressed keypad: {content}")));
            }
            TurnBody::Bot(BotTurn::Text(text)) => {
                if !text.content.is_empty() {
                    messages.push(ChatMessage::assistant(text.content.clone()));
                }
            }
            TurnBody::Bot(BotTurn::Dtmf(dtmf)) => {
                messages.push(ChatMessage::assistant(format!(
                    "Sent keypad tones: {}",
                    dtmf.content
                )));
            }
            TurnBody::Bot(BotTurn::Tool(tool)) => {
                if !tool.is_resolved() {
                    tracing::error!(
                        call_id = %turn.call_id,
                        turn_id = %turn.id,
                        "tool turn with unresolved results excluded from completion request"
                    );
                    continue;
                }
                messages.push(ChatMessage::Assistant {
                    content: None,
                    tool_calls: tool
                        .tool_calls
                        .iter()
                        .map(|call| AssistantToolCall {
                            id: call.id.clone(),
                            kind: "function".to_string(),
                            function: call.function.clone(),
                        })
                        .collect(),
                });
                for call in &tool.tool_calls {
                    if let Some(result) = &call.result {
                        messages.push(ChatMessage::Tool {
                            tool_call_id: call.id.clone(),
                            content: result_content(result),
                        });
                    }
                }
            }
            TurnBody::System(system) => {
                messages.push(ChatMessage::system(system.content.clone()));
            }
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EventHub;
    use crate::turns::{BotTextParams, BotToolParams, HumanParams, SystemParams, ToolCall, TurnStore};
    use serde_json::json;

    #[test]
    fn test_render_nested_paths() {
        let mut ctx = BTreeMap::new();
        ctx.insert("user".to_string(), json!({"name": "Ada", "tier": 2}));
        ctx.insert("company".to_string(), json!("Owl Shoes"));

        let out = render_instructions(
            "You work for {{company}}. Caller: {{ user.name }} (tier {{user.tier}}). {{missing.key}}!",
            &ctx,
        );
        assert_eq!(out, "You work for Owl Shoes. Caller: Ada (tier 2). !");
    }

    #[test]
    fn test_render_without_placeholders_is_identity() {
        let out = render_instructions("Be brief.", &BTreeMap::new());
        assert_eq!(out, "Be brief.");
    }

    #[test]
    fn test_translate_all_turn_kinds() {
        let store = TurnStore::new("CA1", EventHub::new());
        store.add_human_text(HumanParams::new("what's my balance?"));
        store.add_human_dtmf(HumanParams::new("42"));
        store.add_bot_text(BotTextParams::new(""));
        store.add_bot_text(BotTextParams::new("One moment."));
        let tool = store.add_bot_tool(BotToolParams::new(vec![ToolCall::new(
            "call_1", 0, "getUser", "{}",
        )]));
        store.set_tool_result("call_1", json!({"balance": 10}));
        store.add_system(SystemParams::new("Agent note: VIP"));
        store.add_bot_dtmf(BotTextParams::new("9"));

        let messages = turns_to_messages(&store.list());
        let roles: Vec<_> = messages.iter().map(ChatMessage::role).collect();
        assert_eq!(
            roles,
            vec!["user", "user", "assistant", "assistant", "tool", "system", "assistant"]
        );
        assert_eq!(messages[1], ChatMessage::user("Pressed keypad: 42"));
        assert_eq!(
            messages[4],
            ChatMessage::Tool {
                tool_call_id: "call_1".into(),
                content: "{\"balance\":10}".into()
            }
        );
        assert!(tool.snapshot().is_some());
    }

    #[test]
    fn test_unresolved_tool_turn_is_filtered() {
        let store = TurnStore::new("CA1", EventHub::new());
        store.add_human_text(HumanParams::new("refund please"));
        store.add_bot_tool(BotToolParams::new(vec![
            ToolCall::new("call_1", 0, "refund", "{}"),
            ToolCall::new("call_2", 1, "notify", "{}"),
        ]));
        store.set_tool_result("call_1", json!("ok"));

        let messages = turns_to_messages(&store.list());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role(), "user");
    }
}
