//! Tool dispatch registry
//!
//! Maps tool names to handlers with a uniform contract: `execute` always
//! returns a [`ToolResult`], never an error. Handler failures, panics and
//! timeouts are folded into [`ToolResult::Failure`] so they can be fed back
//! to the model as context.
//!
//! The registry is populated once at startup and then shared read-only
//! (`Arc<ToolRegistry>`) between sessions.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics::{TOOL_CALLS, TOOL_CALL_DURATION};

/// Arguments passed to a tool
pub type Parameters = Map<String, Value>;

/// Error type handlers may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Default bound on a single tool execution
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a tool call did not succeed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    /// No handler registered under this name
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    /// Required parameters missing or malformed; the handler was not run
    #[error("Invalid parameters for {tool}: {message}")]
    Validation { tool: String, message: String },
    /// The handler ran and failed, panicked or timed out
    #[error("{message}")]
    Execution { message: String, timed_out: bool },
}

impl ToolError {
    /// Short machine-readable label used in metrics and tool result JSON
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::Validation { .. } => "validation",
            ToolError::Execution { timed_out: true, .. } => "timeout",
            ToolError::Execution { .. } => "execution",
        }
    }
}

/// Outcome of a tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Success(Value),
    Failure(ToolError),
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success(_))
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            ToolResult::Success(v) => Some(v),
            ToolResult::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ToolError> {
        match self {
            ToolResult::Success(_) => None,
            ToolResult::Failure(e) => Some(e),
        }
    }

    /// JSON form fed back into the conversation
    pub fn to_json(&self) -> Value {
        match self {
            ToolResult::Success(payload) => json!({ "success": true, "result": payload }),
            ToolResult::Failure(e) => json!({
                "success": false,
                "error": e.to_string(),
                "kind": e.kind(),
            }),
        }
    }
}

/// Tool description advertised to the model
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameter object
    pub parameters: Value,
}

impl ToolDefinition {
    /// Names listed in the schema's `required` array
    pub fn required(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// A callable tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// One-line description shown to the model
    fn description(&self) -> &str;

    /// JSON Schema of the parameters; `required` is enforced before `call`
    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn call(&self, params: Parameters) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`ToolHandler`]
pub struct FnTool<F> {
    description: String,
    parameters: Value,
    func: F,
}

impl<F> FnTool<F> {
    /// Build a tool whose schema only lists required parameter names
    pub fn new(description: impl Into<String>, required: &[&str], func: F) -> Self {
        Self {
            description: description.into(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": required,
            }),
            func,
        }
    }

    /// Replace the generated schema with a full one
    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Parameters) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn call(&self, params: Parameters) -> Result<Value, HandlerError> {
        (self.func)(params).await
    }
}

/// Adapter for synchronous handlers that block, such as file or process I/O
///
/// The closure runs on tokio's blocking pool, so the registry timeout still
/// fires while it is stuck. A timed-out call keeps its thread until the
/// closure returns; only its result is discarded.
pub struct BlockingTool<F> {
    description: String,
    parameters: Value,
    func: Arc<F>,
}

impl<F> BlockingTool<F> {
    /// Build a tool whose schema only lists required parameter names
    pub fn new(description: impl Into<String>, required: &[&str], func: F) -> Self {
        Self {
            description: description.into(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": required,
            }),
            func: Arc::new(func),
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }
}

#[async_trait]
impl<F> ToolHandler for BlockingTool<F>
where
    F: Fn(Parameters) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn call(&self, params: Parameters) -> Result<Value, HandlerError> {
        let func = self.func.clone();
        match tokio::task::spawn_blocking(move || func(params)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let panic = e.into_panic();
                Err(format!("tool panicked: {}", panic_message(panic.as_ref())).into())
            }
            Err(e) => Err(e.to_string().into()),
        }
    }
}

struct Entry {
    handler: Arc<dyn ToolHandler>,
    timeout: Duration,
}

/// Name → handler registry
pub struct ToolRegistry {
    entries: HashMap<String, Entry>,
    /// Registration order, for stable listings
    order: Vec<String>,
    default_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TOOL_TIMEOUT)
    }

    /// Create a registry whose handlers are bounded by `default_timeout`
    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            default_timeout,
        }
    }

    /// Register a handler. Re-registering a name replaces the handler.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        let timeout = self.default_timeout;
        self.register_with_timeout(name, handler, timeout);
    }

    /// Register a handler with its own execution bound
    pub fn register_with_timeout(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
        timeout: Duration,
    ) {
        let name = name.into();
        if self
            .entries
            .insert(name.clone(), Entry { handler, timeout })
            .is_none()
        {
            self.order.push(name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Definitions of all tools, in registration order
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| {
                self.entries.get(name).map(|entry| ToolDefinition {
                    name: name.clone(),
                    description: entry.handler.description().to_string(),
                    parameters: entry.handler.parameters(),
                })
            })
            .collect()
    }

    /// Render the tool catalogue for a system prompt
    pub fn describe(&self) -> String {
        self.definitions()
            .iter()
            .map(|def| {
                let required = def.required();
                if required.is_empty() {
                    format!("- {}: {}", def.name, def.description)
                } else {
                    format!(
                        "- {}: {} (required: {})",
                        def.name,
                        def.description,
                        required.join(", ")
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Run a tool. Never fails; every problem is reported in the result.
    pub async fn execute(&self, name: &str, params: &Parameters) -> ToolResult {
        let Some(entry) = self.entries.get(name) else {
            warn!(tool = name, "Unknown tool requested");
            TOOL_CALLS.with_label_values(&["unknown", "unknown_tool"]).inc();
            return ToolResult::Failure(ToolError::UnknownTool(name.to_string()));
        };

        if let Err(e) = validate(name, &entry.handler.parameters(), params) {
            warn!(tool = name, error = %e, "Rejected tool call");
            TOOL_CALLS.with_label_values(&[name, e.kind()]).inc();
            return ToolResult::Failure(e);
        }

        let start = Instant::now();
        let call = AssertUnwindSafe(entry.handler.call(params.clone())).catch_unwind();
        let result = match tokio::time::timeout(entry.timeout, call).await {
            Ok(Ok(Ok(payload))) => ToolResult::Success(payload),
            Ok(Ok(Err(e))) => ToolResult::Failure(ToolError::Execution {
                message: e.to_string(),
                timed_out: false,
            }),
            Ok(Err(panic)) => ToolResult::Failure(ToolError::Execution {
                message: format!("tool panicked: {}", panic_message(panic.as_ref())),
                timed_out: false,
            }),
            Err(_) => ToolResult::Failure(ToolError::Execution {
                message: format!("timed out after {}s", entry.timeout.as_secs_f64()),
                timed_out: true,
            }),
        };
        let elapsed = start.elapsed();

        TOOL_CALL_DURATION
            .with_label_values(&[name])
            .observe(elapsed.as_secs_f64());
        match &result {
            ToolResult::Success(_) => {
                TOOL_CALLS.with_label_values(&[name, "success"]).inc();
                info!(tool = name, duration_ms = elapsed.as_millis() as u64, "Tool succeeded");
            }
            ToolResult::Failure(e) => {
                TOOL_CALLS.with_label_values(&[name, e.kind()]).inc();
                warn!(tool = name, error = %e, "Tool failed");
            }
        }

        result
    }
}

/// Check the schema's `required` list against the supplied parameters
fn validate(tool: &str, schema: &Value, params: &Parameters) -> Result<(), ToolError> {
    let missing: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter(|key| params.get(*key).map_or(true, Value::is_null))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ToolError::Validation {
            tool: tool.to_string(),
            message: format!("missing required parameter(s): {}", missing.join(", ")),
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap_or_default()
    }

    fn echo_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            "echo",
            Arc::new(FnTool::new("Echo the text back", &["text"], |p: Parameters| async move {
                Ok::<Value, HandlerError>(p["text"].clone())
            })),
        );
        registry
    }

    #[tokio::test]
    async fn test_execute_success() {
        let registry = echo_registry();
        let result = registry.execute("echo", &params(json!({"text": "hi"}))).await;
        assert_eq!(result, ToolResult::Success(json!("hi")));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = echo_registry();
        let result = registry.execute("nope", &Parameters::new()).await;
        assert_eq!(
            result,
            ToolResult::Failure(ToolError::UnknownTool("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_missing_required_parameter() {
        let registry = echo_registry();
        let result = registry.execute("echo", &params(json!({"text": null}))).await;
        assert_eq!(result.error().map(ToolError::kind), Some("validation"));
    }

    #[tokio::test]
    async fn test_handler_error_is_wrapped() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "fail",
            Arc::new(FnTool::new("Always fails", &[], |_p: Parameters| async move {
                Err::<Value, HandlerError>("disk on fire".into())
            })),
        );
        let result = registry.execute("fail", &Parameters::new()).await;
        assert_eq!(
            result,
            ToolResult::Failure(ToolError::Execution {
                message: "disk on fire".to_string(),
                timed_out: false,
            })
        );
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "boom",
            Arc::new(FnTool::new("Panics", &[], |_p: Parameters| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<Value, HandlerError>(Value::Null)
            })),
        );
        let result = registry.execute("boom", &Parameters::new()).await;
        match result {
            ToolResult::Failure(ToolError::Execution { message, .. }) => {
                assert!(message.contains("kaboom"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let mut registry = ToolRegistry::with_timeout(Duration::from_millis(50));
        registry.register(
            "slow",
            Arc::new(FnTool::new("Sleeps", &[], |_p: Parameters| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<Value, HandlerError>(Value::Null)
            })),
        );
        let result = registry.execute("slow", &Parameters::new()).await;
        assert_eq!(result.error().map(ToolError::kind), Some("timeout"));
    }

    #[tokio::test]
    async fn test_blocking_handler_times_out() {
        let mut registry = ToolRegistry::with_timeout(Duration::from_millis(50));
        registry.register(
            "stuck",
            Arc::new(BlockingTool::new("Blocks the thread", &[], |_p: Parameters| {
                std::thread::sleep(Duration::from_millis(1500));
                Ok::<Value, HandlerError>(json!("late"))
            })),
        );

        let start = Instant::now();
        let result = registry.execute("stuck", &Parameters::new()).await;
        assert_eq!(result.error().map(ToolError::kind), Some("timeout"));
        assert!(start.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_blocking_handler_result_and_panic() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "upper",
            Arc::new(BlockingTool::new("Uppercase", &["text"], |p: Parameters| {
                let text = p["text"].as_str().unwrap_or_default().to_uppercase();
                Ok::<Value, HandlerError>(json!(text))
            })),
        );
        registry.register(
            "boom",
            Arc::new(BlockingTool::new("Panics", &[], |_p: Parameters| -> Result<Value, HandlerError> {
                panic!("kaboom")
            })),
        );

        let result = registry.execute("upper", &params(json!({"text": "hi"}))).await;
        assert_eq!(result, ToolResult::Success(json!("HI")));

        match registry.execute("boom", &Parameters::new()).await {
            ToolResult::Failure(ToolError::Execution { message, timed_out }) => {
                assert!(message.contains("kaboom"));
                assert!(!timed_out);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_describe_lists_required() {
        let registry = echo_registry();
        assert_eq!(registry.describe(), "- echo: Echo the text back (required: text)");
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn test_result_json() {
        let ok = ToolResult::Success(json!(4)).to_json();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["result"], 4);

        let err = ToolResult::Failure(ToolError::UnknownTool("x".into())).to_json();
        assert_eq!(err["success"], false);
        assert_eq!(err["kind"], "unknown_tool");
    }
}
