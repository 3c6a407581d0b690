//! 流式补全编排：增量装配、消息组装、运行循环（重试 / 取消 / 工具派发）

pub mod assembler;
pub mod messages;
pub mod orchestrator;

pub use assembler::{CloseReason, TextProgress, TurnAssembler};
pub use messages::{render_instructions, turns_to_messages};
pub use orchestrator::{CompletionEvent, CompletionPhase, CompletionSettings, Completions, RunOutcome};
