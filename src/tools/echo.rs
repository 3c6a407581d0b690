//! Echo 工具（测试 / 本地演示用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::parameters_for;
use crate::tools::{Tool, ToolContext};

#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct EchoArgs {
    /// 要回显的文本
    text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back to the caller. Useful for testing tool calls."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<EchoArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, String> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(serde_json::json!({ "text": text }))
    }
}
