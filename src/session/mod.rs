//! 会话层：一通电话的对象图
//!
//! CallSession 持有 EventHub、TurnStore、SessionContext、编排器与复制队列，
//! 把中继的入站消息分派到对应操作，并把编排器的 token / handoff 转成出站中继事件。

pub mod context;
pub mod events;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub use context::SessionContext;
pub use events::{EventHub, SessionEvent, SessionListener};

use crate::completion::{CompletionEvent, CompletionSettings, Completions, RunOutcome};
use crate::llm::LlmClient;
use crate::relay::{HandoffData, RelayEvent, RelayMessage};
use crate::sync::{Replicator, ReplicatorSettings, SyncStore};
use crate::tools::ToolExecutor;
use crate::turns::{
    BotOrigin, BotTextParams, ClausePolicy, HumanParams, SystemParams, TurnStatus, TurnStore,
};

/// 构建一通电话所需的依赖
#[derive(Clone)]
pub struct CallDeps {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolExecutor>,
    pub sync: Option<Arc<dyn SyncStore>>,
    pub completion: CompletionSettings,
    pub replication: ReplicatorSettings,
    pub clause_policy: ClausePolicy,
}

pub struct CallSession {
    call_id: String,
    hub: EventHub,
    store: TurnStore,
    context: SessionContext,
    completions: Arc<Completions>,
    replicator: Option<Arc<Replicator>>,
    relay_tx: mpsc::UnboundedSender<RelayEvent>,
    forwarder: JoinHandle<()>,
}

impl CallSession {
    /// 创建会话；返回出站中继事件的接收端。需在 tokio 运行时内调用
    pub fn new(
        call_id: impl Into<String>,
        deps: CallDeps,
    ) -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let call_id = call_id.into();
        let hub = EventHub::new();
        let store = TurnStore::new(call_id.clone(), hub.clone()).with_clause_policy(deps.clause_policy);
        let context = SessionContext::new(hub.clone());

        let replicator = deps.sync.map(|sync| {
            let replicator = Replicator::new(call_id.clone(), sync, deps.replication);
            hub.subscribe(replicator.clone());
            replicator
        });

        tracing::debug!(call_id = %call_id, tools = ?deps.tools.tool_names(), "tools available");
        let completions = Arc::new(Completions::new(
            store.clone(),
            context.clone(),
            deps.llm,
            deps.tools,
            deps.completion,
        ));

        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_events(
            call_id.clone(),
            completions.subscribe(),
            relay_tx.clone(),
        ));

        tracing::info!(call_id = %call_id, replication = replicator.is_some(), "call session created");
        (
            Self {
                call_id,
                hub,
                store,
                context,
                completions,
                replicator,
                relay_tx,
                forwarder,
            },
            relay_rx,
        )
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn store(&self) -> &TurnStore {
        &self.store
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn completions(&self) -> &Arc<Completions> {
        &self.completions
    }

    pub fn replicator(&self) -> Option<&Arc<Replicator>> {
        self.replicator.as_ref()
    }

    fn send(&self, event: RelayEvent) {
        if self.relay_tx.send(event).is_err() {
            tracing::debug!(call_id = %self.call_id, "relay receiver closed, event dropped");
        }
    }

    fn spawn_run(&self) -> JoinHandle<RunOutcome> {
        let completions = self.completions.clone();
        tokio::spawn(async move { completions.run().await })
    }

    /// 分派一条中继消息；触发了新的补全时返回其任务句柄
    pub fn handle(&self, message: RelayMessage) -> Option<JoinHandle<RunOutcome>> {
        match message {
            RelayMessage::Setup {
                call_sid,
                from,
                to,
                custom_parameters,
            } => {
                tracing::info!(call_id = %self.call_id, call_sid = %call_sid, "call setup");
                self.context.set(
                    "call",
                    serde_json::json!({
                        "callSid": call_sid,
                        "from": from,
                        "to": to,
                        "customParameters": custom_parameters,
                    }),
                );
                None
            }
            RelayMessage::Prompt { voice_prompt, last } => {
                if !last {
                    tracing::trace!(call_id = %self.call_id, "partial prompt ignored");
                    return None;
                }
                let text = voice_prompt.trim();
                if text.is_empty() {
                    return None;
                }
                self.store.add_human_text(HumanParams::new(text));
                Some(self.spawn_run())
            }
            RelayMessage::Interrupt {
                utterance_until_interrupt,
                duration_until_interrupt_ms,
            } => {
                tracing::info!(
                    call_id = %self.call_id,
                    duration_ms = duration_until_interrupt_ms,
                    "caller interrupted playback"
                );
                self.completions.abort();
                self.store.redact_interruption(&utterance_until_interrupt);
                None
            }
            RelayMessage::Dtmf { digit } => {
                self.store.add_human_dtmf(HumanParams::new(digit));
                Some(self.spawn_run())
            }
            RelayMessage::Error { description } => {
                tracing::warn!(call_id = %self.call_id, description = %description, "relay reported error");
                None
            }
        }
    }

    /// 开场白：一次性说完的 greeting 轮次
    pub fn greet(&self, text: &str) {
        let turn = self.store.add_bot_text(
            BotTextParams::new(text)
                .with_status(TurnStatus::Complete)
                .with_origin(BotOrigin::Greeting),
        );
        tracing::debug!(call_id = %self.call_id, turn_id = %turn.id(), "greeting sent");
        self.send(RelayEvent::Text {
            token: text.to_string(),
            last: true,
        });
    }

    /// 向对方发送按键音
    pub fn send_digits(&self, digits: &str) {
        self.store.add_bot_dtmf(BotTextParams::new(digits).with_status(TurnStatus::Complete));
        self.send(RelayEvent::SendDigits {
            digits: digits.to_string(),
        });
    }

    /// 注入系统轮次（如人工坐席的回复），并让模型据此继续
    pub fn inject_system(&self, content: &str) -> JoinHandle<RunOutcome> {
        self.store.add_system(SystemParams::new(content));
        self.spawn_run()
    }

    /// 结束通话 / 转人工
    pub fn end_call(&self, reason_code: &str, reason: &str, payload: Value) {
        self.completions.abort();
        self.send(RelayEvent::End {
            handoff: HandoffData::new(reason_code, reason).with_payload(payload),
        });
    }

    /// 挂断后收尾：取消补全并尽量把剩余修改写出
    pub async fn shutdown(&self, max_wait: Duration) {
        self.completions.abort();
        if let Some(replicator) = &self.replicator {
            let drained = replicator.flush(max_wait).await;
            tracing::info!(
                call_id = %self.call_id,
                drained,
                stats = ?replicator.stats(),
                "call session shut down"
            );
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.completions.abort();
        self.forwarder.abort();
    }
}

async fn forward_events(
    call_id: String,
    mut events: broadcast::Receiver<CompletionEvent>,
    relay: mpsc::UnboundedSender<RelayEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(call_id = %call_id, skipped, "relay forwarder lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let out = match event {
            CompletionEvent::Token { fragment, last, .. } => RelayEvent::Text {
                token: fragment,
                last,
            },
            CompletionEvent::Handoff { data } => RelayEvent::End { handoff: data },
            CompletionEvent::ToolsDispatched { tools, .. } => {
                tracing::debug!(call_id = %call_id, tools = ?tools, "tools dispatched");
                continue;
            }
            CompletionEvent::RunStarted { .. } | CompletionEvent::RunFinished { .. } => continue,
        };
        if relay.send(out).is_err() {
            return;
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("turns", &self.store.len())
            .field("completions", &self.completions)
            .finish()
    }
}
