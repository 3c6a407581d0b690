//! 增量装配：把一次补全的流式增量折叠为轮次修改
//!
//! 一次补全要么全是文本、要么全是工具调用。第一个文本增量创建 BotText，之后逐段追加；
//! 第一个工具增量创建 BotTool。带 id 的增量是新调用，按 index 插入；不带 id 的是续写，
//! name / arguments 只拼接。两类增量交错视为不变量破坏。

use crate::core::CallError;
use crate::llm::ToolCallDelta;
use crate::turns::{BotTextParams, BotToolParams, ToolCall, TurnHandle, TurnStatus, TurnStore};

/// 当前补全正在写的轮次
#[derive(Debug, Clone)]
enum OpenTurn {
    Text(TurnHandle),
    Tool(TurnHandle),
}

/// 一次文本追加后的进度
#[derive(Debug, Clone, PartialEq)]
pub struct TextProgress {
    pub turn_id: String,
    pub fragment: String,
    pub accumulated: String,
}

/// 提前收尾的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 被 abort 或新的 run 取代
    Aborted,
    /// 流异常结束、非常规 finish reason 或不变量破坏
    Failed,
}

/// 单次补全的装配器；每次打开新流时新建
#[derive(Debug)]
pub struct TurnAssembler {
    store: TurnStore,
    open: Option<OpenTurn>,
    saw_delta: bool,
}

impl TurnAssembler {
    pub fn new(store: TurnStore) -> Self {
        Self {
            store,
            open: None,
            saw_delta: false,
        }
    }

    /// 是否已经应用过任何增量
    pub fn has_output(&self) -> bool {
        self.saw_delta
    }

    pub fn open_turn_id(&self) -> Option<&str> {
        match &self.open {
            Some(OpenTurn::Text(h)) | Some(OpenTurn::Tool(h)) => Some(h.id()),
            None => None,
        }
    }

    pub fn apply_text(&mut self, fragment: &str) -> Result<TextProgress, CallError> {
        self.saw_delta = true;
        match self.open.clone() {
            None => {
                let handle = self.store.add_bot_text(BotTextParams::new(fragment));
                let progress = TextProgress {
                    turn_id: handle.id().to_string(),
                    fragment: fragment.to_string(),
                    accumulated: fragment.to_string(),
                };
                self.open = Some(OpenTurn::Text(handle));
                Ok(progress)
            }
            Some(OpenTurn::Text(handle)) => {
                let accumulated = handle.append_content(fragment)?;
                Ok(TextProgress {
                    turn_id: handle.id().to_string(),
                    fragment: fragment.to_string(),
                    accumulated,
                })
            }
            Some(OpenTurn::Tool(_)) => Err(CallError::InterleavedDelta {
                open: "tool",
                got: "text",
            }),
        }
    }

    pub fn apply_tool(&mut self, delta: &ToolCallDelta) -> Result<(), CallError> {
        self.saw_delta = true;
        match (self.open.clone(), &delta.id) {
            (Some(OpenTurn::Text(_)), _) => Err(CallError::InterleavedDelta {
                open: "text",
                got: "tool",
            }),
            (None, Some(id)) => {
                let call = ToolCall::new(
                    id.clone(),
                    delta.index,
                    delta.name.clone().unwrap_or_default(),
                    delta.arguments.clone().unwrap_or_default(),
                );
                let handle = self.store.add_bot_tool(BotToolParams::new(vec![call]));
                self.open = Some(OpenTurn::Tool(handle));
                Ok(())
            }
            (None, None) => Err(CallError::OrphanToolDelta(delta.index)),
            (Some(OpenTurn::Tool(handle)), Some(id)) => handle.push_tool_call(ToolCall::new(
                id.clone(),
                delta.index,
                delta.name.clone().unwrap_or_default(),
                delta.arguments.clone().unwrap_or_default(),
            )),
            (Some(OpenTurn::Tool(handle)), None) => handle.extend_tool_call(
                delta.index,
                delta.name.as_deref(),
                delta.arguments.as_deref(),
            ),
        }
    }

    /// finish_reason = stop：文本轮次标记 complete，返回 (turn_id, 全文)
    pub fn finish_text(&mut self) -> Result<Option<(String, String)>, CallError> {
        match self.open.take() {
            None => Ok(None),
            Some(OpenTurn::Text(handle)) => {
                handle.finish(TurnStatus::Complete)?;
                let turn = handle
                    .snapshot()
                    .ok_or_else(|| CallError::MissingTurn(handle.id().to_string()))?;
                let content = turn
                    .as_bot_text()
                    .map(|t| t.content.clone())
                    .unwrap_or_default();
                Ok(Some((turn.id, content)))
            }
            Some(open @ OpenTurn::Tool(_)) => {
                self.open = Some(open);
                Err(CallError::InterleavedDelta {
                    open: "tool",
                    got: "stop",
                })
            }
        }
    }

    /// finish_reason = tool_calls：工具轮次标记 complete（结果尚未就绪），返回其句柄
    pub fn finish_tools(&mut self) -> Result<TurnHandle, CallError> {
        match self.open.take() {
            Some(OpenTurn::Tool(handle)) => {
                handle.finish(TurnStatus::Complete)?;
                Ok(handle)
            }
            Some(open @ OpenTurn::Text(_)) => {
                self.open = Some(open);
                Err(CallError::InterleavedDelta {
                    open: "text",
                    got: "tool_calls",
                })
            }
            None => Err(CallError::MissingTurn("tool_calls finish without a tool turn".into())),
        }
    }

    /// 提前收尾仍在 streaming 的轮次
    ///
    /// 文本轮次：Aborted → interrupted，Failed → complete；返回已说出的全文供发送最终 token。
    /// 工具轮次：调用从未执行，直接删除。
    pub fn close(&mut self, reason: CloseReason) -> Option<(String, String)> {
        match self.open.take()? {
            OpenTurn::Text(handle) => {
                let status = match reason {
                    CloseReason::Aborted => TurnStatus::Interrupted,
                    CloseReason::Failed => TurnStatus::Complete,
                };
                let closed = handle.update(|turn| {
                    let text = turn.as_bot_text_mut()?;
                    if text.status == TurnStatus::Streaming {
                        text.status = status;
                        if status == TurnStatus::Interrupted {
                            text.interrupted = true;
                        }
                    }
                    Some(text.content.clone())
                });
                closed.flatten().map(|content| (handle.id().to_string(), content))
            }
            OpenTurn::Tool(handle) => {
                let still_streaming = handle
                    .snapshot()
                    .is_some_and(|t| t.status() == Some(TurnStatus::Streaming));
                if still_streaming {
                    self.store.delete(handle.id());
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EventHub;

    fn assembler() -> (TurnStore, TurnAssembler) {
        let store = TurnStore::new("CA1", EventHub::new());
        (store.clone(), TurnAssembler::new(store))
    }

    #[test]
    fn test_text_deltas_accumulate() {
        let (store, mut asm) = assembler();
        assert!(!asm.has_output());
        let first = asm.apply_text("Hello").unwrap();
        let second = asm.apply_text(", world").unwrap();
        assert_eq!(first.accumulated, "Hello");
        assert_eq!(second.accumulated, "Hello, world");
        assert_eq!(store.len(), 1);

        let (id, text) = asm.finish_text().unwrap().unwrap();
        assert_eq!(text, "Hello, world");
        assert_eq!(store.get(&id).unwrap().status(), Some(TurnStatus::Complete));
    }

    #[test]
    fn test_tool_call_delta_assembly() {
        let (store, mut asm) = assembler();
        asm.apply_tool(&ToolCallDelta::start(0, "call_1", "getUser")).unwrap();
        asm.apply_tool(&ToolCallDelta::args(0, "{\"e")).unwrap();
        asm.apply_tool(&ToolCallDelta::args(0, "mail\":\"a@b.com\"}")).unwrap();
        let handle = asm.finish_tools().unwrap();

        let turn = store.get(handle.id()).unwrap();
        let tool = turn.as_bot_tool().unwrap();
        assert_eq!(tool.tool_calls.len(), 1);
        let call = &tool.tool_calls[0];
        assert_eq!(call.id, "call_1");
        assert_eq!(call.function.name, "getUser");
        assert_eq!(call.function.arguments, "{\"email\":\"a@b.com\"}");
        let parsed: serde_json::Value = serde_json::from_str(&call.function.arguments).unwrap();
        assert_eq!(parsed["email"], "a@b.com");
        assert_eq!(tool.status, TurnStatus::Complete);
        assert!(!tool.is_resolved());
    }

    #[test]
    fn test_parallel_calls_keep_index_positions() {
        let (store, mut asm) = assembler();
        asm.apply_tool(&ToolCallDelta::start(0, "call_a", "lookup")).unwrap();
        asm.apply_tool(&ToolCallDelta::start(1, "call_b", "notify")).unwrap();
        asm.apply_tool(&ToolCallDelta::args(1, "{}")).unwrap();
        asm.apply_tool(&ToolCallDelta::args(0, "{\"id\":1}")).unwrap();
        let handle = asm.finish_tools().unwrap();

        let turn = store.get(handle.id()).unwrap();
        let calls = &turn.as_bot_tool().unwrap().tool_calls;
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].function.arguments, "{\"id\":1}");
        assert_eq!(calls[1].id, "call_b");
        assert_eq!(calls[1].function.arguments, "{}");
    }

    #[test]
    fn test_interleaved_deltas_are_rejected() {
        let (_, mut asm) = assembler();
        asm.apply_text("Let me check").unwrap();
        let err = asm
            .apply_tool(&ToolCallDelta::start(0, "call_1", "getUser"))
            .unwrap_err();
        assert!(matches!(err, CallError::InterleavedDelta { open: "text", got: "tool" }));

        let (_, mut asm) = assembler();
        asm.apply_tool(&ToolCallDelta::start(0, "call_1", "getUser")).unwrap();
        assert!(asm.apply_text("oops").is_err());
    }

    #[test]
    fn test_continuation_without_open_call() {
        let (_, mut asm) = assembler();
        assert!(matches!(
            asm.apply_tool(&ToolCallDelta::args(0, "{}")),
            Err(CallError::OrphanToolDelta(0))
        ));
        asm.apply_tool(&ToolCallDelta::start(0, "call_1", "x")).unwrap();
        assert!(matches!(
            asm.apply_tool(&ToolCallDelta::args(3, "{}")),
            Err(CallError::OrphanToolDelta(3))
        ));
    }

    #[test]
    fn test_close_on_abort_marks_interrupted() {
        let (store, mut asm) = assembler();
        asm.apply_text("Your order ships").unwrap();
        let (id, content) = asm.close(CloseReason::Aborted).unwrap();
        assert_eq!(content, "Your order ships");
        let turn = store.get(&id).unwrap();
        let text = turn.as_bot_text().unwrap();
        assert!(text.interrupted);
        assert_eq!(text.status, TurnStatus::Interrupted);
        assert!(asm.close(CloseReason::Aborted).is_none());
    }

    #[test]
    fn test_fragment_after_redaction_is_rejected() {
        let (store, mut asm) = assembler();
        asm.apply_text("Your total is $20. ").unwrap();
        asm.apply_text("Anything else?").unwrap();
        store.redact_interruption("Your total is $20.").unwrap();

        assert!(matches!(
            asm.apply_text(" I can also email it."),
            Err(CallError::TurnClosed(_))
        ));
        assert!(matches!(asm.finish_text(), Err(CallError::TurnClosed(_))));
        let turn = &store.list()[0];
        assert_eq!(turn.as_bot_text().unwrap().content, "Your total is $20.");
        assert_eq!(turn.status(), Some(TurnStatus::Interrupted));
    }

    #[test]
    fn test_close_deletes_streaming_tool_turn() {
        let (store, mut asm) = assembler();
        asm.apply_tool(&ToolCallDelta::start(0, "call_1", "getUser")).unwrap();
        assert_eq!(store.len(), 1);
        assert!(asm.close(CloseReason::Failed).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_close_failed_completes_text() {
        let (store, mut asm) = assembler();
        asm.apply_text("Partial answer").unwrap();
        let (id, _) = asm.close(CloseReason::Failed).unwrap();
        let turn = store.get(&id).unwrap();
        assert_eq!(turn.status(), Some(TurnStatus::Complete));
        assert!(!turn.as_bot_text().unwrap().interrupted);
    }
}
