//! NeuroSurf - agent orchestration core with capacity-bounded model scheduling
//!
//! A conversational agent interleaves free-form model output with structured
//! tool invocations while several model roles compete for one scarce
//! resource (GPU memory).
//!
//! # Modules
//!
//! - `agent` - Per-session tool-calling loop, history window, sessions
//! - `tools` - Tool registry, invocation extraction, built-in tools
//! - `scheduler` - Admission/eviction of model roles under a fixed budget
//! - `ollama` - Ollama client and generation service
//! - `config` - TOML configuration with env overrides
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - Console logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use neurosurf::{AgentController, ChatClient, Config, OllamaGenerator, OutputSink};
//!
//! let config = Config::default();
//! let controller = AgentController::new(
//!     Arc::new(OllamaGenerator::new(ChatClient::from_config(&config.ollama))),
//!     Arc::new(config.scheduler.build()?),
//!     Arc::new(neurosurf::tools::builtin_registry(config.agent.tool_timeout())),
//!     config.agent.clone(),
//! );
//! let mut session = controller.new_session("demo");
//! let outcome = controller.process(&mut session, "What is 17 * 23?", &OutputSink::disabled()).await;
//! ```

pub mod agent;
pub mod config;
pub mod metrics;
pub mod ollama;
pub mod scheduler;
pub mod tools;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentConfig, AgentController, OutputSink, SessionManager, TaskOutcome, TaskStatus};
pub use config::Config;
pub use ollama::{ChatClient, OllamaGenerator};
pub use scheduler::{ModelScheduler, Role};
pub use tools::{extract, Invocation, ToolRegistry, ToolResult};
