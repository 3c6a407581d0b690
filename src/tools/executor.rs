//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时。execute(tool_name, raw_args) 先解析参数字符串，再在超时内调用对应工具；
//! 失败统一转为 ToolError，由编排器包装成错误形状的结果交还给模型。每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;

use crate::tools::{ToolContext, ToolRegistry};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Tool execution failed: {0}")]
    Failed(String),

    #[error("Tool timeout: {0}")]
    Timeout(String),
}

impl ToolError {
    /// 交还给模型的错误形状结果，模型可据此在对话中解释
    pub fn to_result(&self) -> Value {
        serde_json::json!({
            "status": "error",
            "error": self.to_string(),
        })
    }
}

/// 工具执行器：对每次调用施加超时，并将结果映射为 ToolError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// 执行指定工具；raw_args 为模型流式拼出的参数字符串（空串视为 {}）
    pub async fn execute(
        &self,
        tool_name: &str,
        raw_args: &str,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let Some(tool) = self.registry.get(tool_name) else {
            tracing::warn!(tool = tool_name, call_id = %ctx.call_id, "model requested unknown tool");
            return Err(ToolError::UnknownTool(tool_name.to_string()));
        };
        let args = parse_arguments(tool_name, raw_args)?;

        let start = Instant::now();
        let result = timeout(self.timeout, tool.execute(args, ctx)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "call_id": ctx.call_id,
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview(raw_args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ToolError::Failed(e)),
            Err(_) => Err(ToolError::Timeout(tool_name.to_string())),
        }
    }

    pub fn manifest(&self) -> Vec<Value> {
        self.registry.manifest()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

fn parse_arguments(tool_name: &str, raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments {
        tool: tool_name.to_string(),
        reason: e.to_string(),
    })
}

fn args_preview(raw: &str) -> String {
    if raw.chars().count() > 200 {
        format!("{}...", raw.chars().take(200).collect::<String>())
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{EventHub, SessionContext};
    use crate::tools::{EchoTool, Tool};
    use async_trait::async_trait;

    struct Slow;

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "never finishes in time"
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, String> {
            Err("refund service unavailable".into())
        }
    }

    fn executor() -> ToolExecutor {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(Slow);
        reg.register(Broken);
        ToolExecutor::with_timeout(reg, Duration::from_millis(50))
    }

    fn ctx() -> ToolContext {
        ToolContext {
            call_id: "CA1".into(),
            context: SessionContext::new(EventHub::new()),
        }
    }

    #[tokio::test]
    async fn test_execute_parses_argument_string() {
        let out = executor()
            .execute("echo", r#"{"text":"hi"}"#, &ctx())
            .await
            .unwrap();
        assert_eq!(out["text"], "hi");
    }

    #[tokio::test]
    async fn test_empty_arguments_default_to_object() {
        let out = executor().execute("echo", "", &ctx()).await.unwrap();
        assert_eq!(out["text"], "(empty)");
    }

    #[tokio::test]
    async fn test_invalid_json_arguments() {
        let err = executor().execute("echo", "{\"te", &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
        assert_eq!(err.to_result()["status"], "error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let err = executor().execute("slow", "{}", &ctx()).await.unwrap_err();
        assert_eq!(err, ToolError::Timeout("slow".into()));
    }

    #[tokio::test]
    async fn test_failure_and_unknown() {
        let exec = executor();
        assert!(matches!(
            exec.execute("broken", "{}", &ctx()).await,
            Err(ToolError::Failed(msg)) if msg.contains("refund")
        ));
        assert_eq!(
            exec.execute("ghost", "{}", &ctx()).await.unwrap_err(),
            ToolError::UnknownTool("ghost".into())
        );
    }
}
