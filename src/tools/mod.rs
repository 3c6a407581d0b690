pub mod echo;
pub mod executor;
pub mod registry;
pub mod remember;
pub mod schema;

pub use echo::EchoTool;
pub use executor::{ToolError, ToolExecutor};
pub use registry::{Tool, ToolContext, ToolRegistry};
pub use remember::RememberTool;
pub use schema::parameters_for;

/// 内置工具集合
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(RememberTool);
    registry
}
