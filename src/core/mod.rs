//! 核心层：版本化实体包装与通话级错误

pub mod error;
pub mod versioned;

pub use error::CallError;
pub use versioned::{ChangeCallback, Versioned};
