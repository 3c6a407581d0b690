//! 轮次层：对话事件数据模型与一次通话的有序存储

pub mod store;
pub mod types;

pub use store::{ClausePolicy, TurnHandle, TurnStore};
pub use types::{
    BotDtmf, BotOrigin, BotText, BotTextParams, BotTool, BotToolParams, BotTurn, FunctionCall,
    HumanParams, HumanTurn, SystemOrigin, SystemParams, SystemTurn, ToolCall, Turn, TurnBody,
    TurnId, TurnStatus,
};
