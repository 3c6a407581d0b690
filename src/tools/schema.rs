//! 工具参数 JSON Schema 生成（schemars 从参数结构体自动推导）
//!
//! 结果直接作为 manifest 里 function.parameters，减少模型拼错参数的概率。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 由参数结构体生成 parameters schema（去掉 $schema / title 等对模型无用的元字段）
pub fn parameters_for<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({"type": "object", "properties": {}})
    });
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}
