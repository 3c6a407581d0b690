//! remember_fact 工具：把通话中得知的事实写入会话上下文（随上下文一起同步出去）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::parameters_for;
use crate::tools::{Tool, ToolContext};

#[derive(Deserialize, JsonSchema)]
struct RememberArgs {
    /// 事实的键，如 "customer_name"
    key: String,
    /// 事实的值
    value: Value,
}

pub struct RememberTool;

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember_fact"
    }

    fn description(&self) -> &str {
        "Store a fact learned during the call (e.g. the caller's name) so later turns can use it."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<RememberArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String> {
        let args: RememberArgs =
            serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))?;
        let key = args.key.trim();
        if key.is_empty() {
            return Err("key must not be empty".into());
        }
        let version = ctx.context.set(key, args.value);
        tracing::debug!(call_id = %ctx.call_id, key, version, "fact remembered");
        Ok(serde_json::json!({ "status": "ok", "key": key }))
    }
}
