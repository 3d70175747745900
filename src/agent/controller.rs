//! Agent Controller - bounded, cancellable tool-calling loop
//!
//! The AgentController drives one session's task: it asks the scheduler for
//! the reasoning model, calls the generation service with the session's
//! history window, dispatches any tool invocations found in the output and
//! feeds their results back until the model answers in plain text.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::generation::{GenerationError, GenerationService, ModelTarget};
use super::history::{HistoryWindow, MessageRole, DEFAULT_WINDOW_SIZE, TOOL_RESULT_MAX_CHARS};
use super::sessions::Session;
use super::sink::{AgentEvent, OutputSink, ThoughtKind};
use crate::metrics::{AGENT_ITERATIONS, AGENT_TASKS, LLM_CALL_DURATION};
use crate::scheduler::{ModelScheduler, Ready, Role, SchedulerError};
use crate::tools::{extract, strip_invocation_fragments, Parameters, ToolRegistry, ToolResult};

/// Default system prompt; the tool catalogue is appended at session creation
pub const DEFAULT_AGENT_SYSTEM_PROMPT: &str = r#"You are Neuro, a helpful AI assistant. Be concise.
Call a tool by replying with JSON: {"tool": "name", "parameters": {...}}
Wait for tool results before concluding. When the task is complete, answer in plain text without any tool JSON."#;

/// Returned when a task ends without any usable text
const EMPTY_ANSWER: &str = "Task completed.";

const HALTED_ANSWER: &str = "Task halted by user.";

/// Configuration for the agent controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum tool-dispatch iterations before the task is cut off
    pub max_iterations: usize,
    /// Non-system messages sent to the generation service
    pub window_size: usize,
    /// Characters of a tool result kept in history
    pub tool_result_max_chars: usize,
    /// Bound on a single tool execution in seconds
    pub tool_timeout_secs: u64,
    /// Bound on a single generation call in seconds
    pub generation_timeout_secs: u64,
    /// Role used for the main reasoning calls
    pub reasoning_role: Role,
    /// Custom system prompt (uses default if None)
    pub system_prompt: Option<String>,
    /// Capacity of the output event channel
    pub event_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            window_size: DEFAULT_WINDOW_SIZE,
            tool_result_max_chars: TOOL_RESULT_MAX_CHARS,
            tool_timeout_secs: 30,
            generation_timeout_secs: 120,
            reasoning_role: Role::Executive,
            system_prompt: None,
            event_buffer: 64,
        }
    }
}

impl AgentConfig {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// Error that ended a task early
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl AgentError {
    /// Message shown to the user in place of an answer
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Generation(GenerationError::ServiceUnavailable(_)) => {
                "Error: Could not connect to the model service. Please make sure it is running."
                    .to_string()
            }
            AgentError::Generation(GenerationError::Timeout(_)) => {
                "Error: I timed out while thinking. Please try again.".to_string()
            }
            AgentError::Scheduler(SchedulerError::ResourceExhausted { role, .. }) => format!(
                "Error: Not enough model capacity to load the {} model.",
                role
            ),
            other => format!("I encountered an error: {}", other),
        }
    }
}

/// Per-session loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoopState {
    #[default]
    Idle,
    Running {
        iteration: usize,
    },
    Halted,
    Completed,
    Incomplete,
}

impl LoopState {
    pub fn is_running(&self) -> bool {
        matches!(self, LoopState::Running { .. })
    }
}

/// Terminal status of one `process` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Final answer produced, or the task failed with `error` set
    Completed,
    /// Cancelled between iterations
    Halted,
    /// Iteration cap reached
    Incomplete,
}

impl TaskStatus {
    fn metric_label(&self, failed: bool) -> &'static str {
        match self {
            TaskStatus::Completed if failed => "error",
            TaskStatus::Completed => "completed",
            TaskStatus::Halted => "halted",
            TaskStatus::Incomplete => "incomplete",
        }
    }
}

/// Record of one dispatched tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub name: String,
    pub parameters: Parameters,
    pub result: ToolResult,
}

/// Result of processing one command
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Unique trace ID for this task
    pub trace_id: String,
    pub status: TaskStatus,
    /// User-facing text: the answer, partial content, or an error message
    pub response: String,
    /// Tool-dispatch iterations completed
    pub iterations: usize,
    /// Generation calls issued
    pub generation_calls: usize,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Set when the task ended because of a failure
    pub error: Option<AgentError>,
}

/// Cooperative cancellation flag shared between a session and its callers
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Agent Controller orchestrating generation, scheduling and tool dispatch
pub struct AgentController {
    generator: Arc<dyn GenerationService>,
    scheduler: Arc<ModelScheduler>,
    registry: Arc<ToolRegistry>,
    config: AgentConfig,
}

impl AgentController {
    /// Create a new agent controller
    ///
    /// # Arguments
    /// * `generator` - Generation service for model calls
    /// * `scheduler` - Shared model scheduler
    /// * `registry` - Shared, fully populated tool registry
    /// * `config` - Agent configuration
    pub fn new(
        generator: Arc<dyn GenerationService>,
        scheduler: Arc<ModelScheduler>,
        registry: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            generator,
            scheduler,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &ModelScheduler {
        &self.scheduler
    }

    /// System prompt with the tool catalogue appended
    pub fn system_prompt(&self) -> String {
        let base = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_AGENT_SYSTEM_PROMPT);
        if self.registry.is_empty() {
            base.to_string()
        } else {
            format!("{}\n\nAvailable tools:\n{}", base, self.registry.describe())
        }
    }

    /// Create an empty session configured for this controller
    pub fn new_session(&self, id: impl Into<String>) -> Session {
        let history = HistoryWindow::new(self.config.window_size)
            .with_tool_result_limit(self.config.tool_result_max_chars)
            .with_system(self.system_prompt());
        Session::new(id, history)
    }

    /// Run the agent loop for one command
    ///
    /// Never fails: generation and scheduling errors end the task with
    /// `TaskStatus::Completed` and `error` set, leaving the session usable.
    /// A cancellation requested before the call halts the task at its first
    /// boundary; the flag is cleared once the task ends.
    pub async fn process(&self, session: &mut Session, command: &str, sink: &OutputSink) -> TaskOutcome {
        let trace_id = Uuid::now_v7().to_string();

        let root_span = info_span!(
            "agent_task",
            trace_id = %trace_id,
            session_id = %session.id,
            otel.name = "agent_task"
        );

        let outcome = self
            .run_loop(session, command, sink, trace_id)
            .instrument(root_span)
            .await;
        // a halt applies to one task only
        session.cancel.reset();

        AGENT_TASKS
            .with_label_values(&[outcome.status.metric_label(outcome.error.is_some())])
            .inc();
        AGENT_ITERATIONS.observe(outcome.iterations as f64);
        sink.emit(AgentEvent::Answer {
            text: outcome.response.clone(),
        });

        outcome
    }

    async fn run_loop(
        &self,
        session: &mut Session,
        command: &str,
        sink: &OutputSink,
        trace_id: String,
    ) -> TaskOutcome {
        info!(trace_id = %trace_id, command = %command, "Starting agent task");

        session.iterations = 0;
        session.history.append(MessageRole::User, command);
        session.touch();
        sink.thought(format!("Working on: {}", command), ThoughtKind::Planning);

        let mut outcome = TaskOutcome {
            trace_id,
            status: TaskStatus::Completed,
            response: String::new(),
            iterations: 0,
            generation_calls: 0,
            tool_calls: Vec::new(),
            error: None,
        };

        loop {
            if session.cancel.is_cancelled() {
                return self.halt(session, outcome, sink);
            }
            session.state = LoopState::Running {
                iteration: outcome.iterations,
            };

            let ready = match self.scheduler.request(self.config.reasoning_role) {
                Ok(ready) => ready,
                Err(e) => return self.fail(session, outcome, e.into()),
            };
            self.unload_evicted(&ready).await;

            let window = session.history.window();
            let target = ModelTarget::new(ready.role, ready.model.clone());
            outcome.generation_calls += 1;

            let llm_span = info_span!(
                "llm_call",
                trace_id = %outcome.trace_id,
                iteration = outcome.iterations,
                model = %target.model,
                otel.name = "llm_call"
            );
            let timeout = self.config.generation_timeout();
            let call_start = Instant::now();
            let generated = tokio::time::timeout(
                timeout,
                self.generator.generate_stream(&window, &target, sink),
            )
            .instrument(llm_span)
            .await;
            LLM_CALL_DURATION
                .with_label_values(&[target.role.as_str()])
                .observe(call_start.elapsed().as_secs_f64());

            let raw = match generated {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => return self.fail(session, outcome, e.into()),
                Err(_) => {
                    return self.fail(session, outcome, GenerationError::Timeout(timeout).into())
                }
            };
            info!(
                trace_id = %outcome.trace_id,
                iteration = outcome.iterations,
                duration_ms = call_start.elapsed().as_millis() as u64,
                "LLM call completed"
            );

            // an in-flight call is allowed to finish, but nothing it asked for runs
            if session.cancel.is_cancelled() {
                return self.halt(session, outcome, sink);
            }

            let invocations = extract(&raw);
            if invocations.is_empty() {
                let answer = strip_invocation_fragments(&raw);
                let answer = if answer.is_empty() {
                    EMPTY_ANSWER.to_string()
                } else {
                    answer
                };
                session.history.append(MessageRole::Assistant, answer.clone());
                session.state = LoopState::Completed;
                session.touch();
                info!(
                    trace_id = %outcome.trace_id,
                    iterations = outcome.iterations,
                    tool_calls = outcome.tool_calls.len(),
                    "Agent task completed"
                );
                outcome.status = TaskStatus::Completed;
                outcome.response = answer;
                return outcome;
            }

            sink.thought(
                format!("Requested {} tool call(s)", invocations.len()),
                ThoughtKind::Action,
            );
            session.history.append(MessageRole::Assistant, raw.clone());
            // prose the model wrote around its tool calls
            let partial = strip_invocation_fragments(&raw);

            for invocation in invocations {
                let tool_span = info_span!(
                    "tool_call",
                    trace_id = %outcome.trace_id,
                    tool = %invocation.name,
                    otel.name = "tool_call"
                );
                sink.emit(AgentEvent::ToolStarted {
                    name: invocation.name.clone(),
                });
                sink.thought(
                    format!("Calling {}", invocation.name),
                    ThoughtKind::Tool,
                );
                debug!(tool = %invocation.name, parameters = ?invocation.parameters, "Dispatching tool");

                let result = self
                    .registry
                    .execute(&invocation.name, &invocation.parameters)
                    .instrument(tool_span)
                    .await;

                sink.emit(AgentEvent::ToolFinished {
                    name: invocation.name.clone(),
                    success: result.is_success(),
                });
                session.history.append_tool_result(&invocation.name, &result);
                outcome.tool_calls.push(ToolCallRecord {
                    name: invocation.name,
                    parameters: invocation.parameters,
                    result,
                });
            }

            outcome.iterations += 1;
            session.iterations = outcome.iterations;
            session.touch();

            if outcome.iterations >= self.config.max_iterations {
                warn!(
                    trace_id = %outcome.trace_id,
                    iterations = outcome.iterations,
                    "Max iterations reached"
                );
                session.state = LoopState::Incomplete;
                outcome.status = TaskStatus::Incomplete;
                outcome.response = if partial.is_empty() {
                    format!(
                        "I stopped after {} tool rounds without reaching a final answer.",
                        outcome.iterations
                    )
                } else {
                    partial
                };
                return outcome;
            }
        }
    }

    fn halt(&self, session: &mut Session, mut outcome: TaskOutcome, sink: &OutputSink) -> TaskOutcome {
        warn!(trace_id = %outcome.trace_id, iterations = outcome.iterations, "Agent halted");
        sink.thought("Agent halted", ThoughtKind::System);
        session.state = LoopState::Halted;
        session.touch();
        outcome.status = TaskStatus::Halted;
        outcome.response = HALTED_ANSWER.to_string();
        outcome
    }

    fn fail(&self, session: &mut Session, mut outcome: TaskOutcome, error: AgentError) -> TaskOutcome {
        warn!(trace_id = %outcome.trace_id, error = %error, "Agent task failed");
        session.state = LoopState::Completed;
        session.touch();
        outcome.status = TaskStatus::Completed;
        outcome.response = error.user_message();
        outcome.error = Some(error);
        outcome
    }

    /// Tell the backend to drop evicted models. Failures are only logged.
    async fn unload_evicted(&self, ready: &Ready) {
        for evicted in &ready.evicted {
            if let Err(e) = self.generator.unload(&evicted.model).await {
                warn!(model = %evicted.model, error = %e, "Failed to unload evicted model");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        let shared = flag.clone();
        assert!(!flag.is_cancelled());
        shared.cancel();
        assert!(flag.is_cancelled());
        flag.reset();
        assert!(!shared.is_cancelled());
    }

    #[test]
    fn test_user_messages() {
        let unavailable = AgentError::Generation(GenerationError::ServiceUnavailable("refused".into()));
        assert!(unavailable.user_message().contains("Could not connect"));

        let exhausted = AgentError::Scheduler(SchedulerError::ResourceExhausted {
            role: Role::Eye,
            cost: 30.0,
            max_budget: 24.0,
        });
        assert!(exhausted.user_message().contains("eye"));
    }

    #[test]
    fn test_loop_state_serialization() {
        let json = serde_json::to_string(&LoopState::Running { iteration: 2 }).unwrap();
        assert_eq!(json, r#"{"state":"running","iteration":2}"#);
    }
}
