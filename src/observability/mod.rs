//! 可观测性：tracing 日志初始化
//!
//! 默认 info 级别，RUST_LOG 可覆盖（如 `RUST_LOG=bee_call=debug`）。
//! 工具调用的审计记录以 JSON 字段 `audit` 输出，便于日志管道解析。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 重复初始化（如测试中）时静默忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
