//! Bee Call - 语音通话智能体内核
//!
//! 模块划分：
//! - **core**: 带版本号的可变值、错误类型
//! - **turns**: 轮次数据模型与一次通话的有序存储（含打断清理）
//! - **session**: 事件中枢、会话上下文、CallSession 对象图
//! - **llm**: LLM 流式客户端抽象与实现（OpenAI 兼容 / DeepSeek / 脚本化 Mock）
//! - **tools**: 工具注册表与带超时的执行器
//! - **completion**: 补全编排：流式组装轮次、并行工具、重试与 abort
//! - **relay**: 语音中继的入站 / 出站消息形状
//! - **sync**: 复制队列：限流、防抖、合并，写入外部同步存储
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: 日志初始化

pub mod completion;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod relay;
pub mod session;
pub mod sync;
pub mod tools;
pub mod turns;

pub use session::{CallDeps, CallSession};
