//! Tool layer: invocation extraction, dispatch registry and built-in tools
//!
//! ```text
//! model output ──► extract() ──► [Invocation] ──► ToolRegistry::execute() ──► ToolResult
//! ```

pub mod calculator;
pub mod extract;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

pub use calculator::{evaluate, CalcError, Calculator};
pub use extract::{extract, strip_invocation_fragments, Invocation};
pub use registry::{
    BlockingTool, FnTool, HandlerError, Parameters, ToolDefinition, ToolError, ToolHandler, ToolRegistry,
    ToolResult, DEFAULT_TOOL_TIMEOUT,
};

/// Registry with the tools that ship with the crate
pub fn builtin_registry(timeout: Duration) -> ToolRegistry {
    let mut registry = ToolRegistry::with_timeout(timeout);
    registry.register("calculate", Arc::new(Calculator));
    registry
}
