//! 流式补全编排器
//!
//! 状态：idle → streaming → {tool_dispatch → streaming} → idle，streaming 中随时可进入 aborting。
//!
//! - run()：新的 run 先取消旧的（last-writer-wins），再串行持有运行锁；
//! - 每轮补全：渲染系统指令 + 翻译轮次 → 打开流 → 逐个增量折叠到 TurnStore；
//! - finish_reason = tool_calls 时并发执行全部工具、回写结果后继续下一轮（显式循环，不递归）；
//! - 打开失败按固定退避重试，超过上限发送一次 error handoff；
//! - abort() 在增量边界生效：正在应用的增量会完整应用，之后的增量不再处理。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::completion::assembler::{CloseReason, TextProgress, TurnAssembler};
use crate::completion::messages::{render_instructions, turns_to_messages};
use crate::core::CallError;
use crate::llm::{ChatMessage, ChatRequest, ChunkStream, FinishReason, LlmClient, LlmError};
use crate::relay::HandoffData;
use crate::session::SessionContext;
use crate::tools::{ToolContext, ToolExecutor};
use crate::turns::{TurnHandle, TurnStore};

/// 编排器当前阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPhase {
    Idle,
    Streaming,
    ToolDispatch,
    Aborting,
}

/// 一次 run 的结局
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// 模型以 stop 结束
    Completed,
    /// 被 abort 或更新的 run 取代
    Superseded,
    /// length / content_filter / function_call：轮次收尾，不重驱动
    Anomaly { reason: FinishReason },
    /// 流在没有 finish_reason 的情况下结束或中途出错
    StreamEnded,
    /// 打开失败次数超过上限，已发送 error handoff
    RetriesExhausted,
    /// 协议不变量被破坏
    InvariantViolation { detail: String },
}

/// 编排器对外事件（token 流、工具派发、handoff、run 生命周期）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionEvent {
    RunStarted {
        generation: u64,
    },
    /// 可播放片段；last = true 时 fragment 为空，accumulated 为本轮全文
    Token {
        turn_id: String,
        fragment: String,
        last: bool,
        accumulated: String,
    },
    ToolsDispatched {
        turn_id: String,
        tools: Vec<String>,
    },
    Handoff {
        data: HandoffData,
    },
    RunFinished {
        generation: u64,
        outcome: RunOutcome,
    },
}

/// 补全参数
#[derive(Debug, Clone)]
pub struct CompletionSettings {
    pub model: String,
    pub temperature: Option<f32>,
    /// 打开失败后的最大重试次数（总尝试次数 = max_retries + 1）
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// 系统指令模板，`{{ key.path }}` 由会话上下文填充
    pub instructions: String,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            max_retries: 3,
            retry_backoff: Duration::from_millis(1000),
            instructions: "You are a helpful voice assistant. Keep answers short and speakable."
                .to_string(),
        }
    }
}

/// 单次流消费的结果
enum StreamStep {
    Finished(FinishReason),
    /// 第一个 chunk 之前就出错，按打开失败处理
    FailedBeforeOutput(LlmError),
    FailedMidStream(LlmError),
    EndedWithoutFinish,
    Cancelled,
    Invariant(CallError),
}

enum Retry {
    Again,
    Stop(RunOutcome),
}

pub struct Completions {
    store: TurnStore,
    context: SessionContext,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolExecutor>,
    settings: CompletionSettings,
    generation: AtomicU64,
    /// 最新一次 run 的 (generation, 取消令牌)
    active: Mutex<Option<(u64, CancellationToken)>>,
    phase: Mutex<CompletionPhase>,
    run_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<CompletionEvent>,
}

impl Completions {
    pub fn new(
        store: TurnStore,
        context: SessionContext,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolExecutor>,
        settings: CompletionSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            store,
            context,
            llm,
            tools,
            settings,
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
            phase: Mutex::new(CompletionPhase::Idle),
            run_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> CompletionPhase {
        *self.lock_phase()
    }

    pub fn settings(&self) -> &CompletionSettings {
        &self.settings
    }

    fn lock_phase(&self) -> MutexGuard<'_, CompletionPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: CompletionPhase) {
        *self.lock_phase() = phase;
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<(u64, CancellationToken)>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CompletionEvent) {
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.events.send(event);
    }

    /// 取消当前流；空闲时为 no-op
    pub fn abort(&self) {
        let active = self.lock_active();
        if let Some((generation, token)) = active.as_ref() {
            if !token.is_cancelled() {
                tracing::info!(call_id = %self.store.call_id(), generation, "aborting completion");
                token.cancel();
                let mut phase = self.lock_phase();
                if *phase == CompletionPhase::Streaming {
                    *phase = CompletionPhase::Aborting;
                }
            }
        }
    }

    /// 驱动一次完整的思考循环，直到模型停止、被取代或失败
    pub async fn run(&self) -> RunOutcome {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        if let Some((_, previous)) = self.lock_active().replace((generation, token.clone())) {
            previous.cancel();
        }

        let _running = self.run_lock.lock().await;
        if token.is_cancelled() {
            tracing::debug!(call_id = %self.store.call_id(), generation, "run superseded before start");
            self.release(generation);
            return RunOutcome::Superseded;
        }

        tracing::info!(call_id = %self.store.call_id(), generation, "run started");
        self.emit(CompletionEvent::RunStarted { generation });
        let outcome = self.drive(generation, &token).await;
        self.set_phase(CompletionPhase::Idle);
        self.release(generation);

        tracing::info!(call_id = %self.store.call_id(), generation, outcome = ?outcome, "run finished");
        self.emit(CompletionEvent::RunFinished {
            generation,
            outcome: outcome.clone(),
        });
        outcome
    }

    fn release(&self, generation: u64) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|(g, _)| *g == generation) {
            *active = None;
        }
    }

    fn build_request(&self) -> ChatRequest {
        let instructions = render_instructions(&self.settings.instructions, &self.context.snapshot());
        let mut messages = vec![ChatMessage::system(instructions)];
        messages.extend(turns_to_messages(&self.store.list()));
        ChatRequest {
            model: self.settings.model.clone(),
            messages,
            tools: self.tools.manifest(),
            temperature: self.settings.temperature,
        }
    }

    async fn drive(&self, generation: u64, token: &CancellationToken) -> RunOutcome {
        let mut attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                return RunOutcome::Superseded;
            }
            self.set_phase(CompletionPhase::Streaming);
            let request = self.build_request();
            tracing::debug!(
                call_id = %self.store.call_id(),
                generation,
                attempt,
                messages = request.messages.len(),
                "opening completion stream"
            );

            let opened = tokio::select! {
                biased;
                _ = token.cancelled() => return RunOutcome::Superseded,
                r = self.llm.stream_chat(request) => r,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => match self.retry(generation, &mut attempt, e, token).await {
                    Retry::Again => continue,
                    Retry::Stop(outcome) => return outcome,
                },
            };

            let mut assembler = TurnAssembler::new(self.store.clone());
            let step = self.consume(&mut stream, &mut assembler, token).await;
            drop(stream);
            // 打断清理可能抢在取消检查之前收尾或删除了轮次
            let step = match step {
                StreamStep::Invariant(CallError::TurnClosed(_) | CallError::MissingTurn(_))
                    if token.is_cancelled() =>
                {
                    StreamStep::Cancelled
                }
                step => step,
            };

            match step {
                StreamStep::Finished(FinishReason::Stop) => {
                    return match assembler.finish_text() {
                        Ok(Some((turn_id, accumulated))) => {
                            self.emit_final(turn_id, accumulated);
                            RunOutcome::Completed
                        }
                        Ok(None) => RunOutcome::Completed,
                        Err(CallError::TurnClosed(_) | CallError::MissingTurn(_))
                            if token.is_cancelled() =>
                        {
                            RunOutcome::Superseded
                        }
                        Err(e) => self.invariant(&mut assembler, e),
                    };
                }
                StreamStep::Finished(FinishReason::ToolCalls) => {
                    let handle = match assembler.finish_tools() {
                        Ok(handle) => handle,
                        Err(CallError::TurnClosed(_) | CallError::MissingTurn(_))
                            if token.is_cancelled() =>
                        {
                            return RunOutcome::Superseded;
                        }
                        Err(e) => return self.invariant(&mut assembler, e),
                    };
                    self.dispatch_tools(&handle).await;
                    attempt = 0;
                    if token.is_cancelled() {
                        tracing::info!(
                            call_id = %self.store.call_id(),
                            generation,
                            "superseded during tool dispatch, not re-driving"
                        );
                        return RunOutcome::Superseded;
                    }
                }
                StreamStep::Finished(reason) => {
                    tracing::warn!(
                        call_id = %self.store.call_id(),
                        generation,
                        reason = ?reason,
                        "completion finished with anomalous reason, closing turn"
                    );
                    self.close(&mut assembler, CloseReason::Failed);
                    return RunOutcome::Anomaly { reason };
                }
                StreamStep::FailedBeforeOutput(e) => {
                    match self.retry(generation, &mut attempt, e, token).await {
                        Retry::Again => continue,
                        Retry::Stop(outcome) => return outcome,
                    }
                }
                StreamStep::FailedMidStream(e) => {
                    tracing::warn!(
                        call_id = %self.store.call_id(),
                        generation,
                        error = %e,
                        "completion stream failed mid-way"
                    );
                    self.close(&mut assembler, CloseReason::Failed);
                    return RunOutcome::StreamEnded;
                }
                StreamStep::EndedWithoutFinish => {
                    tracing::warn!(
                        call_id = %self.store.call_id(),
                        generation,
                        "completion stream ended without finish reason"
                    );
                    self.close(&mut assembler, CloseReason::Failed);
                    return RunOutcome::StreamEnded;
                }
                StreamStep::Cancelled => {
                    self.set_phase(CompletionPhase::Aborting);
                    if let Some((turn_id, _)) = assembler.close(CloseReason::Aborted) {
                        tracing::info!(
                            call_id = %self.store.call_id(),
                            generation,
                            turn_id = %turn_id,
                            "completion aborted mid-stream"
                        );
                    }
                    return RunOutcome::Superseded;
                }
                StreamStep::Invariant(e) => return self.invariant(&mut assembler, e),
            }
        }
    }

    /// 逐个消费增量；取消只在增量之间检查
    async fn consume(
        &self,
        stream: &mut ChunkStream,
        assembler: &mut TurnAssembler,
        token: &CancellationToken,
    ) -> StreamStep {
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => return StreamStep::Cancelled,
                item = stream.next() => item,
            };
            let chunk = match item {
                None => return StreamStep::EndedWithoutFinish,
                Some(Err(e)) if !assembler.has_output() => return StreamStep::FailedBeforeOutput(e),
                Some(Err(e)) => return StreamStep::FailedMidStream(e),
                Some(Ok(chunk)) => chunk,
            };

            if let Some(fragment) = chunk.content.as_deref() {
                match assembler.apply_text(fragment) {
                    Ok(progress) => self.emit_token(progress),
                    Err(e) => return StreamStep::Invariant(e),
                }
            }
            for delta in &chunk.tool_calls {
                if let Err(e) = assembler.apply_tool(delta) {
                    return StreamStep::Invariant(e);
                }
            }
            if let Some(reason) = chunk.finish_reason {
                return StreamStep::Finished(reason);
            }
        }
    }

    async fn retry(
        &self,
        generation: u64,
        attempt: &mut u32,
        error: LlmError,
        token: &CancellationToken,
    ) -> Retry {
        if *attempt >= self.settings.max_retries {
            tracing::error!(
                call_id = %self.store.call_id(),
                generation,
                attempts = *attempt + 1,
                error = %error,
                "completion failed after all retries, ending call"
            );
            let data = HandoffData::error(format!("LLM unavailable: {error}")).with_payload(
                serde_json::json!({ "attempts": *attempt + 1 }),
            );
            self.emit(CompletionEvent::Handoff { data });
            return Retry::Stop(RunOutcome::RetriesExhausted);
        }

        *attempt += 1;
        tracing::warn!(
            call_id = %self.store.call_id(),
            generation,
            attempt = *attempt,
            error = %error,
            backoff_ms = self.settings.retry_backoff.as_millis() as u64,
            "completion stream failed to open, retrying"
        );
        tokio::select! {
            biased;
            _ = token.cancelled() => return Retry::Stop(RunOutcome::Superseded),
            _ = tokio::time::sleep(self.settings.retry_backoff) => {}
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            return Retry::Stop(RunOutcome::Superseded);
        }
        Retry::Again
    }

    /// 并发执行工具轮次中的全部调用；单个失败转为错误结果，不影响其他调用
    async fn dispatch_tools(&self, handle: &TurnHandle) {
        self.set_phase(CompletionPhase::ToolDispatch);
        let Some(turn) = handle.snapshot() else {
            tracing::warn!(call_id = %self.store.call_id(), turn_id = %handle.id(), "tool turn vanished before dispatch");
            return;
        };
        let calls = turn
            .as_bot_tool()
            .map(|t| t.tool_calls.clone())
            .unwrap_or_default();
        self.emit(CompletionEvent::ToolsDispatched {
            turn_id: turn.id.clone(),
            tools: calls.iter().map(|c| c.function.name.clone()).collect(),
        });

        let ctx = ToolContext {
            call_id: self.store.call_id().to_string(),
            context: self.context.clone(),
        };
        let executions = calls.iter().map(|call| {
            let ctx = &ctx;
            async move {
                let result = match self
                    .tools
                    .execute(&call.function.name, &call.function.arguments, ctx)
                    .await
                {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(
                            call_id = %ctx.call_id,
                            tool_call_id = %call.id,
                            tool = %call.function.name,
                            error = %e,
                            "tool failed, reporting error result to model"
                        );
                        e.to_result()
                    }
                };
                self.store.set_tool_result(&call.id, result);
            }
        });
        join_all(executions).await;
    }

    fn emit_token(&self, progress: TextProgress) {
        self.emit(CompletionEvent::Token {
            turn_id: progress.turn_id,
            fragment: progress.fragment,
            last: false,
            accumulated: progress.accumulated,
        });
    }

    fn emit_final(&self, turn_id: String, accumulated: String) {
        self.emit(CompletionEvent::Token {
            turn_id,
            fragment: String::new(),
            last: true,
            accumulated,
        });
    }

    fn close(&self, assembler: &mut TurnAssembler, reason: CloseReason) {
        if let Some((turn_id, accumulated)) = assembler.close(reason) {
            self.emit_final(turn_id, accumulated);
        }
    }

    fn invariant(&self, assembler: &mut TurnAssembler, error: CallError) -> RunOutcome {
        let turn_id = assembler.open_turn_id().unwrap_or("-");
        if error.is_invariant() {
            tracing::error!(
                call_id = %self.store.call_id(),
                turn_id,
                error = %error,
                "protocol invariant violated, stopping completion"
            );
        } else {
            tracing::warn!(
                call_id = %self.store.call_id(),
                turn_id,
                error = %error,
                "completion step failed, stopping completion"
            );
        }
        self.close(assembler, CloseReason::Failed);
        RunOutcome::InvariantViolation {
            detail: error.to_string(),
        }
    }
}

impl std::fmt::Debug for Completions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completions")
            .field("call_id", &self.store.call_id())
            .field("model", &self.settings.model)
            .field("phase", &self.phase())
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}
