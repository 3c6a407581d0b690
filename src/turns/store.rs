//! 轮次存储
//!
//! 一次通话的有序轮次集合：创建 / 读取 / 删除、工具结果回写、打断清理。
//! 每个轮次以 Versioned 包装保存，任何经由 TurnHandle 的修改都会 version +1 并发布 TurnUpdated。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use serde_json::Value;

use crate::core::{CallError, ChangeCallback, Versioned};
use crate::session::{EventHub, SessionEvent};
use crate::turns::types::{
    BotDtmf, BotText, BotTextParams, BotTool, BotToolParams, BotTurn, HumanParams, HumanTurn,
    SystemParams, SystemTurn, ToolCall, Turn, TurnBody, TurnId, TurnStatus,
};

/// 打断清理时，被打断的那一句是否视为已说完
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClausePolicy {
    #[default]
    Include,
    Exclude,
}

#[derive(Debug, Default)]
struct StoreInner {
    /// 按创建顺序排列
    turns: Vec<Versioned<Turn>>,
    next_order: u64,
}

/// 一次通话的轮次存储；Clone 共享同一份数据
#[derive(Debug, Clone)]
pub struct TurnStore {
    call_id: Arc<str>,
    inner: Arc<Mutex<StoreInner>>,
    hub: EventHub,
    clause_policy: ClausePolicy,
}

fn snapshot(v: &Versioned<Turn>) -> Turn {
    let mut turn = v.get().clone();
    turn.version = v.version();
    turn
}

fn new_turn_id() -> TurnId {
    format!("turn_{}", uuid::Uuid::new_v4())
}

impl TurnStore {
    pub fn new(call_id: impl Into<String>, hub: EventHub) -> Self {
        Self {
            call_id: Arc::from(call_id.into()),
            inner: Arc::new(Mutex::new(StoreInner::default())),
            hub,
            clause_policy: ClausePolicy::default(),
        }
    }

    pub fn with_clause_policy(mut self, policy: ClausePolicy) -> Self {
        self.clause_policy = policy;
        self
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: Option<TurnId>, body: TurnBody) -> TurnHandle {
        let id = id.unwrap_or_else(new_turn_id);
        let mut inner = self.lock();
        if inner.turns.iter().any(|v| v.get().id == id) {
            tracing::warn!(call_id = %self.call_id, turn_id = %id, "duplicate turn id");
        }
        inner.next_order += 1;
        let turn = Turn {
            id: id.clone(),
            call_id: self.call_id.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            order: inner.next_order,
            version: 0,
            body,
        };

        let hub = self.hub.clone();
        let on_change: ChangeCallback<Turn> = Arc::new(move |t: &Turn, version: u64| {
            let mut turn = t.clone();
            turn.version = version;
            hub.publish(&SessionEvent::TurnUpdated { turn });
        });

        tracing::debug!(
            call_id = %self.call_id,
            turn_id = %id,
            order = turn.order,
            kind = turn.kind_label(),
            "turn added"
        );
        self.hub.publish(&SessionEvent::TurnAdded { turn: turn.clone() });
        inner.turns.push(Versioned::with_callback(turn, on_change));

        TurnHandle {
            id,
            store: self.clone(),
        }
    }

    pub fn add_human_text(&self, params: HumanParams) -> TurnHandle {
        self.insert(
            params.id,
            TurnBody::Human(HumanTurn::Text { content: params.content }),
        )
    }

    pub fn add_human_dtmf(&self, params: HumanParams) -> TurnHandle {
        self.insert(
            params.id,
            TurnBody::Human(HumanTurn::Dtmf { content: params.content }),
        )
    }

    pub fn add_bot_text(&self, params: BotTextParams) -> TurnHandle {
        self.insert(
            params.id,
            TurnBody::Bot(BotTurn::Text(BotText {
                content: params.content,
                interrupted: false,
                status: params.status,
                origin: params.origin,
            })),
        )
    }

    pub fn add_bot_dtmf(&self, params: BotTextParams) -> TurnHandle {
        self.insert(
            params.id,
            TurnBody::Bot(BotTurn::Dtmf(BotDtmf {
                content: params.content,
                interrupted: false,
                status: params.status,
                origin: params.origin,
            })),
        )
    }

    pub fn add_bot_tool(&self, params: BotToolParams) -> TurnHandle {
        self.insert(
            params.id,
            TurnBody::Bot(BotTurn::Tool(BotTool {
                tool_calls: params.tool_calls,
                status: params.status,
                origin: params.origin,
            })),
        )
    }

    pub fn add_system(&self, params: SystemParams) -> TurnHandle {
        self.insert(
            params.id,
            TurnBody::System(SystemTurn {
                content: params.content,
                origin: params.origin,
            }),
        )
    }

    pub fn get(&self, id: &str) -> Option<Turn> {
        self.lock()
            .turns
            .iter()
            .find(|v| v.get().id == id)
            .map(snapshot)
    }

    /// 已存在轮次的可变句柄
    pub fn handle(&self, id: &str) -> Option<TurnHandle> {
        let exists = self.lock().turns.iter().any(|v| v.get().id == id);
        exists.then(|| TurnHandle {
            id: id.to_string(),
            store: self.clone(),
        })
    }

    /// 按创建顺序的快照
    pub fn list(&self) -> Vec<Turn> {
        self.lock().turns.iter().map(snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().turns.is_empty()
    }

    /// 对指定轮次做一次逻辑修改；轮次不存在时返回 None
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Turn) -> R) -> Option<R> {
        let mut inner = self.lock();
        let entry = inner.turns.iter_mut().find(|v| v.get().id == id)?;
        Some(entry.update(f))
    }

    /// 只对仍在 streaming 的轮次做修改；已收尾（包括已被打断清理）的轮次拒绝写入
    fn update_streaming<R>(&self, id: &str, f: impl FnOnce(&mut Turn) -> R) -> Result<R, CallError> {
        let mut inner = self.lock();
        let entry = inner
            .turns
            .iter_mut()
            .find(|v| v.get().id == id)
            .ok_or_else(|| CallError::MissingTurn(id.to_string()))?;
        if entry.get().status() != Some(TurnStatus::Streaming) {
            return Err(CallError::TurnClosed(id.to_string()));
        }
        Ok(entry.update(f))
    }

    /// 删除轮次；不存在时静默返回 None，其余轮次的 order 不变
    pub fn delete(&self, id: &str) -> Option<Turn> {
        let mut inner = self.lock();
        let pos = inner.turns.iter().position(|v| v.get().id == id)?;
        let removed = inner.turns.remove(pos);
        self.hub.publish(&SessionEvent::TurnDeleted { id: id.to_string() });
        tracing::debug!(call_id = %self.call_id, turn_id = %id, "turn deleted");
        Some(snapshot(&removed))
    }

    /// 回写工具结果；找不到对应调用时为 no-op（可能已被打断清理删除）
    pub fn set_tool_result(&self, tool_call_id: &str, result: Value) -> bool {
        let mut inner = self.lock();
        let entry = inner.turns.iter_mut().find(|v| {
            v.get()
                .as_bot_tool()
                .is_some_and(|t| t.tool_calls.iter().any(|c| c.id == tool_call_id))
        });
        let Some(entry) = entry else {
            tracing::debug!(
                call_id = %self.call_id,
                tool_call_id,
                "tool result has no matching call, ignored"
            );
            return false;
        };
        entry.update(|turn| {
            if let Some(call) = turn
                .as_bot_tool_mut()
                .and_then(|t| t.tool_calls.iter_mut().find(|c| c.id == tool_call_id))
            {
                call.result = Some(result);
            }
        });
        true
    }

    /// 打断清理：让存储的对话与来电者实际听到的内容一致
    ///
    /// 1. 倒序找到最近一个 content 包含 clause 的 BotText；找不到则忽略
    /// 2. 删除其后所有 bot 轮次（human / system 保留）
    /// 3. 截断到 clause 之前，按策略补回 clause，trim，并标记 interrupted
    pub fn redact_interruption(&self, interrupted_clause: &str) -> Option<Turn> {
        let clause = interrupted_clause.trim();
        if clause.is_empty() {
            tracing::debug!(call_id = %self.call_id, "empty interrupted clause, nothing to redact");
            return None;
        }

        let mut inner = self.lock();
        let Some(pos) = inner.turns.iter().rposition(|v| {
            v.get()
                .as_bot_text()
                .is_some_and(|t| t.content.contains(clause))
        }) else {
            tracing::info!(call_id = %self.call_id, clause, "no bot turn contains interrupted clause");
            return None;
        };

        let cut_order = inner.turns[pos].get().order;
        let mut removed = Vec::new();
        inner.turns.retain(|v| {
            let t = v.get();
            if t.order > cut_order && t.is_bot() {
                removed.push(t.id.clone());
                false
            } else {
                true
            }
        });
        for id in &removed {
            self.hub.publish(&SessionEvent::TurnDeleted { id: id.clone() });
        }

        let policy = self.clause_policy;
        let entry = &mut inner.turns[pos];
        entry.update(|turn| {
            if let Some(text) = turn.as_bot_text_mut() {
                let at = text.content.find(clause).unwrap_or(text.content.len());
                let mut heard = text.content[..at].to_string();
                if policy == ClausePolicy::Include {
                    heard.push_str(clause);
                }
                text.content = heard.trim().to_string();
                text.interrupted = true;
                text.status = TurnStatus::Interrupted;
            }
        });
        let redacted = snapshot(entry);

        tracing::info!(
            call_id = %self.call_id,
            turn_id = %redacted.id,
            deleted = removed.len(),
            "interruption redacted"
        );
        Some(redacted)
    }
}

/// 轮次可变句柄：所有写操作都经由存储，逐次 version +1 并发布 TurnUpdated
#[derive(Debug, Clone)]
pub struct TurnHandle {
    id: TurnId,
    store: TurnStore,
}

impl TurnHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> Option<Turn> {
        self.store.get(&self.id)
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Turn) -> R) -> Option<R> {
        self.store.update(&self.id, f)
    }

    /// 向 streaming 中的文本 / 按键轮次追加片段，返回累计内容
    pub fn append_content(&self, fragment: &str) -> Result<String, CallError> {
        self.store
            .update_streaming(&self.id, |turn| {
                turn.bot_content_mut().map(|c| {
                    c.push_str(fragment);
                    c.clone()
                })
            })?
            .ok_or_else(|| CallError::MissingTurn(self.id.clone()))
    }

    pub fn set_status(&self, status: TurnStatus) -> bool {
        self.update(|turn| turn.set_status(status)).is_some()
    }

    /// 结束流式写入：仅 streaming → status；已被打断清理等收尾时返回 TurnClosed
    pub fn finish(&self, status: TurnStatus) -> Result<(), CallError> {
        self.store
            .update_streaming(&self.id, |turn| turn.set_status(status))
    }

    /// 新的工具调用放在其 index 指示的位置
    pub fn push_tool_call(&self, call: ToolCall) -> Result<(), CallError> {
        self.store
            .update_streaming(&self.id, |turn| {
                turn.as_bot_tool_mut().map(|t| {
                    let at = call.index.min(t.tool_calls.len());
                    t.tool_calls.insert(at, call);
                })
            })?
            .ok_or_else(|| CallError::MissingTurn(self.id.clone()))
    }

    /// 续写片段：name 与 arguments 只拼接、不替换
    pub fn extend_tool_call(
        &self,
        index: usize,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> Result<(), CallError> {
        let found = self.store.update_streaming(&self.id, |turn| {
            let call = turn
                .as_bot_tool_mut()?
                .tool_calls
                .iter_mut()
                .find(|c| c.index == index)?;
            if let Some(n) = name {
                call.function.name.push_str(n);
            }
            if let Some(a) = arguments {
                call.function.arguments.push_str(a);
            }
            Some(())
        })?;
        found.ok_or(CallError::OrphanToolDelta(index))
    }
}
