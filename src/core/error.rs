//! 通话级错误类型
//!
//! 传输失败由编排器内部重试；协议不变量被破坏时按断言处理：记录日志并停止当前路径，不猜测恢复方式。
//! 工具失败与同步失败各有自己的错误类型（ToolError / SyncError），不会升级为 CallError。

use thiserror::Error;

use crate::llm::LlmError;

/// 编排器运行中可能出现的错误
#[derive(Error, Debug)]
pub enum CallError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// 同一次补全中文本与工具调用增量交错出现
    #[error("Interleaved {got} delta while a {open} turn is streaming")]
    InterleavedDelta { open: &'static str, got: &'static str },

    /// 流式追加时目标轮次已不存在（例如被打断清理删除）
    #[error("Turn missing: {0}")]
    MissingTurn(String),

    /// 轮次已收尾（complete / interrupted），不再接受流式写入
    #[error("Turn closed: {0}")]
    TurnClosed(String),

    /// 续写片段找不到对应 index 的工具调用
    #[error("Tool call delta for unknown index {0}")]
    OrphanToolDelta(usize),

    /// 工具调用结果未全部就绪的轮次被送往 LLM
    #[error("Unresolved tool turn: {0}")]
    UnresolvedToolTurn(String),
}

impl CallError {
    /// 是否为「不应发生」的协议不变量错误
    pub fn is_invariant(&self) -> bool {
        !matches!(self, CallError::Llm(_))
    }
}
