//! Agent module: the per-session tool-calling loop
//!
//! This module ties the tool registry, the model scheduler and a generation
//! service together into a bounded, cancellable loop.
//!
//! # Architecture
//!
//! ```text
//! Command → SessionManager → AgentController
//!                  ↓
//!           HistoryWindow.append(user)
//!                  ↓
//!           ModelScheduler.request(role) → unload evicted models
//!                  ↓
//!           GenerationService.generate_stream(window) → OutputSink chunks
//!                  ↓
//!           extract(text) ──empty──→ final answer → Completed
//!                  ↓
//!           ToolRegistry.execute() per invocation
//!                  ↓
//!           HistoryWindow.append_tool_result() → Loop, Halted or Incomplete
//! ```

pub mod controller;
pub mod generation;
pub mod history;
pub mod sessions;
pub mod sink;

pub use controller::{
    AgentConfig, AgentController, AgentError, CancelFlag, LoopState, TaskOutcome, TaskStatus,
    ToolCallRecord, DEFAULT_AGENT_SYSTEM_PROMPT,
};
pub use generation::{GenerationError, GenerationService, ModelTarget};
pub use history::{HistoryWindow, Message, MessageRole};
pub use sessions::{
    QueuedTask, Session, SessionManager, SessionStatus, SessionStore, SessionSummary,
};
pub use sink::{AgentEvent, OutputSink, ThoughtKind};
