//! Integration tests for the agent loop
//!
//! These tests drive the AgentController and SessionManager with scripted
//! generation services, so no Ollama server is needed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use neurosurf::agent::{
    AgentConfig, AgentController, AgentError, AgentEvent, CancelFlag, GenerationError,
    GenerationService, LoopState, Message, MessageRole, ModelTarget, OutputSink, SessionManager, TaskStatus, ThoughtKind,
};
use neurosurf::scheduler::{default_catalogue, ModelScheduler, Role, RoleDescriptor};
use neurosurf::tools::{builtin_registry, FnTool, HandlerError, Parameters, ToolRegistry};

const CALC_CALL: &str = r#"Let me compute that. {"tool": "calculate", "parameters": {"expression": "17 * 23"}}"#;

/// Replays canned replies and records every window it was given
#[derive(Default)]
struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, GenerationError>>>,
    /// Returned once the script runs out
    fallback: Option<String>,
    windows: Mutex<Vec<Vec<Message>>>,
    unloaded: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    fn new(replies: Vec<Result<String, GenerationError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    fn replying(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    fn always(reply: &str) -> Self {
        Self {
            fallback: Some(reply.to_string()),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.windows.lock().unwrap().len()
    }

    fn window(&self, call: usize) -> Vec<Message> {
        self.windows.lock().unwrap()[call].clone()
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    async fn generate(
        &self,
        window: &[Message],
        _target: &ModelTarget,
    ) -> Result<String, GenerationError> {
        self.windows.lock().unwrap().push(window.to_vec());
        let next = self.replies.lock().unwrap().pop_front();
        match (next, &self.fallback) {
            (Some(reply), _) => reply,
            (None, Some(fallback)) => Ok(fallback.clone()),
            (None, None) => Ok("Done.".to_string()),
        }
    }

    async fn unload(&self, model: &str) -> Result<(), GenerationError> {
        self.unloaded.lock().unwrap().push(model.to_string());
        Ok(())
    }
}

/// Blocks inside `generate` until released, announcing when it started
struct GatedGenerator {
    started: Notify,
    release: Notify,
    reply: String,
}

#[async_trait]
impl GenerationService for GatedGenerator {
    async fn generate(
        &self,
        _window: &[Message],
        _target: &ModelTarget,
    ) -> Result<String, GenerationError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(self.reply.clone())
    }
}

struct StalledGenerator;

#[async_trait]
impl GenerationService for StalledGenerator {
    async fn generate(
        &self,
        _window: &[Message],
        _target: &ModelTarget,
    ) -> Result<String, GenerationError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok("too late".to_string())
    }
}

fn registry() -> ToolRegistry {
    let mut registry = builtin_registry(Duration::from_secs(5));
    registry.register(
        "echo",
        Arc::new(FnTool::new("Echo the text back", &["text"], |p: Parameters| async move {
            Ok::<Value, HandlerError>(p["text"].clone())
        })),
    );
    registry
}

fn scheduler() -> Arc<ModelScheduler> {
    Arc::new(ModelScheduler::new(24.0, default_catalogue()).unwrap())
}

fn controller_with(generator: Arc<dyn GenerationService>, config: AgentConfig) -> AgentController {
    AgentController::new(generator, scheduler(), Arc::new(registry()), config)
}

fn controller(generator: Arc<dyn GenerationService>) -> AgentController {
    controller_with(generator, AgentConfig::default())
}

#[test]
fn test_agent_config_defaults() {
    let config = AgentConfig::default();

    assert_eq!(config.max_iterations, 15);
    assert_eq!(config.window_size, 6);
    assert_eq!(config.tool_result_max_chars, 500);
    assert_eq!(config.reasoning_role, Role::Executive);
    assert_eq!(config.tool_timeout(), Duration::from_secs(30));
    assert!(config.system_prompt.is_none());
}

#[test]
fn test_system_prompt_lists_tools() {
    let controller = controller(Arc::new(ScriptedGenerator::default()));
    let prompt = controller.system_prompt();
    assert!(prompt.contains(r#"{"tool": "name", "parameters": {...}}"#));
    assert!(prompt.contains("- calculate:"));
    assert!(prompt.contains("- echo: Echo the text back (required: text)"));

    let session = controller.new_session("s");
    assert_eq!(session.history.system().unwrap().content, prompt);
}

#[tokio::test]
async fn test_plain_answer_completes_immediately() {
    let generator = Arc::new(ScriptedGenerator::replying(&["Paris is the capital of France."]));
    let controller = controller(generator.clone());
    let mut session = controller.new_session("s");

    let outcome = controller
        .process(&mut session, "What is the capital of France?", &OutputSink::disabled())
        .await;

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.response, "Paris is the capital of France.");
    assert_eq!(outcome.iterations, 0);
    assert_eq!(outcome.generation_calls, 1);
    assert!(outcome.error.is_none());
    assert_eq!(session.state, LoopState::Completed);

    let roles: Vec<MessageRole> = session.history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
}

#[tokio::test]
async fn test_tool_result_is_visible_to_next_generation() {
    let generator = Arc::new(ScriptedGenerator::replying(&[CALC_CALL, "17 * 23 = 391"]));
    let controller = controller(generator.clone());
    let mut session = controller.new_session("s");

    let outcome = controller
        .process(&mut session, "What is 17 * 23?", &OutputSink::disabled())
        .await;

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.response, "17 * 23 = 391");
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(outcome.tool_calls[0].name, "calculate");
    assert!(outcome.tool_calls[0].result.is_success());

    let second = generator.window(1);
    assert_eq!(second[0].role, MessageRole::System);
    let last = second.last().unwrap();
    assert_eq!(last.role, MessageRole::ToolResult);
    assert!(last.content.starts_with("TOOL_RESULT(calculate):"));
    assert!(last.content.contains("391"));

    // strictly increasing sequence numbers
    assert!(second.windows(2).all(|w| w[0].sequence_no < w[1].sequence_no));
}

#[tokio::test]
async fn test_invocations_dispatched_in_order() {
    let reply = r#"
```json
{"tool": "echo", "parameters": {"text": "first"}}
```
```json
{"tool": "echo", "parameters": {"text": "second"}}
```"#;
    let generator = Arc::new(ScriptedGenerator::replying(&[reply, "ok"]));
    let controller = controller(generator.clone());
    let mut session = controller.new_session("s");

    let outcome = controller.process(&mut session, "echo twice", &OutputSink::disabled()).await;

    let echoed: Vec<&Value> = outcome
        .tool_calls
        .iter()
        .filter_map(|c| c.result.payload())
        .collect();
    assert_eq!(echoed, vec![&Value::from("first"), &Value::from("second")]);
    assert_eq!(outcome.iterations, 1);
}

#[tokio::test]
async fn test_tool_failures_feed_back_into_history() {
    let generator = Arc::new(ScriptedGenerator::replying(&[
        r#"{"tool": "teleport", "parameters": {}}"#,
        r#"{"tool": "echo", "parameters": {}}"#,
        "I could not do that.",
    ]));
    let controller = controller(generator.clone());
    let mut session = controller.new_session("s");

    let outcome = controller.process(&mut session, "go", &OutputSink::disabled()).await;

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.iterations, 2);
    let kinds: Vec<&str> = outcome
        .tool_calls
        .iter()
        .filter_map(|c| c.result.error().map(|e| e.kind()))
        .collect();
    assert_eq!(kinds, vec!["unknown_tool", "validation"]);
    assert!(generator.window(1).last().unwrap().content.contains("\"success\":false"));
}

#[tokio::test]
async fn test_adversarial_model_hits_iteration_cap() {
    let generator = Arc::new(ScriptedGenerator::always(CALC_CALL));
    let config = AgentConfig {
        max_iterations: 3,
        ..AgentConfig::default()
    };
    let controller = controller_with(generator.clone(), config);
    let mut session = controller.new_session("s");

    let outcome = controller.process(&mut session, "loop forever", &OutputSink::disabled()).await;

    assert_eq!(outcome.status, TaskStatus::Incomplete);
    assert_eq!(outcome.iterations, 3);
    assert!(outcome.generation_calls <= 3 + 1);
    assert_eq!(generator.calls(), outcome.generation_calls);
    assert_eq!(outcome.response, "Let me compute that.");
    assert_eq!(session.state, LoopState::Incomplete);
    // window never grows past its bound
    assert!(session.history.len() <= 6);
}

#[tokio::test]
async fn test_service_unavailable_keeps_session_usable() {
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Err(GenerationError::ServiceUnavailable("connection refused".into())),
        Ok("Back online.".to_string()),
    ]));
    let controller = controller(generator.clone());
    let mut session = controller.new_session("s");

    let outcome = controller.process(&mut session, "hello", &OutputSink::disabled()).await;
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert!(matches!(
        outcome.error,
        Some(AgentError::Generation(GenerationError::ServiceUnavailable(_)))
    ));
    assert!(outcome.response.starts_with("Error: Could not connect"));
    // only the user command was recorded
    assert_eq!(session.history.len(), 1);

    let outcome = controller.process(&mut session, "hello again", &OutputSink::disabled()).await;
    assert!(outcome.error.is_none());
    assert_eq!(outcome.response, "Back online.");
}

#[tokio::test(start_paused = true)]
async fn test_generation_timeout() {
    let config = AgentConfig {
        generation_timeout_secs: 2,
        ..AgentConfig::default()
    };
    let controller = controller_with(Arc::new(StalledGenerator), config);
    let mut session = controller.new_session("s");

    let outcome = controller.process(&mut session, "think hard", &OutputSink::disabled()).await;

    assert!(matches!(
        outcome.error,
        Some(AgentError::Generation(GenerationError::Timeout(_)))
    ));
    assert_eq!(outcome.response, "Error: I timed out while thinking. Please try again.");
}

#[tokio::test]
async fn test_resource_exhausted_ends_task() {
    let mut roles = default_catalogue();
    roles.insert(Role::Executive, RoleDescriptor::new("huge:70b", 48.0, 10));
    let scheduler = Arc::new(ModelScheduler::new(24.0, roles).unwrap());
    let generator = Arc::new(ScriptedGenerator::default());
    let controller = AgentController::new(
        generator.clone(),
        scheduler,
        Arc::new(registry()),
        AgentConfig::default(),
    );
    let mut session = controller.new_session("s");

    let outcome = controller.process(&mut session, "hi", &OutputSink::disabled()).await;

    assert!(matches!(outcome.error, Some(AgentError::Scheduler(_))));
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn test_evicted_models_are_unloaded() {
    let mut roles = default_catalogue();
    roles.insert(Role::Executive, RoleDescriptor::new("exec", 6.0, 10));
    roles.insert(Role::Clerk, RoleDescriptor::new("clerk", 6.0, 1));
    let scheduler = Arc::new(ModelScheduler::new(10.0, roles).unwrap());
    scheduler.request(Role::Clerk).unwrap();

    let generator = Arc::new(ScriptedGenerator::replying(&["hi"]));
    let controller = AgentController::new(
        generator.clone(),
        scheduler.clone(),
        Arc::new(registry()),
        AgentConfig::default(),
    );
    let mut session = controller.new_session("s");
    controller.process(&mut session, "hello", &OutputSink::disabled()).await;

    assert_eq!(*generator.unloaded.lock().unwrap(), vec!["clerk".to_string()]);
    assert!(scheduler.is_loaded(Role::Executive));
    assert!(!scheduler.is_loaded(Role::Clerk));
}

#[tokio::test]
async fn test_final_answer_is_cleaned() {
    let generator = Arc::new(ScriptedGenerator::replying(&[
        r#"All done. {"tool": "calculate", "parameters": {"expression": "1 +"#,
    ]));
    let controller = controller(generator);
    let mut session = controller.new_session("s");

    let outcome = controller.process(&mut session, "finish", &OutputSink::disabled()).await;
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.response, "All done.");
    assert_eq!(session.history.last().unwrap().content, "All done.");

    let blank = controller_with(
        Arc::new(ScriptedGenerator::replying(&["   "])),
        AgentConfig::default(),
    );
    let outcome = blank.process(&mut session, "again", &OutputSink::disabled()).await;
    assert_eq!(outcome.response, "Task completed.");
}

#[tokio::test]
async fn test_cancel_lets_inflight_call_finish_but_skips_dispatch() {
    let generator = Arc::new(GatedGenerator {
        started: Notify::new(),
        release: Notify::new(),
        reply: CALC_CALL.to_string(),
    });
    let controller = Arc::new(controller(generator.clone()));
    let mut session = controller.new_session("s");
    let cancel = session.cancel_flag();

    let task = {
        let controller = controller.clone();
        tokio::spawn(async move {
            let outcome = controller.process(&mut session, "compute", &OutputSink::disabled()).await;
            (outcome, session)
        })
    };

    generator.started.notified().await;
    cancel.cancel();
    generator.release.notify_one();

    let (outcome, session) = task.await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Halted);
    assert_eq!(outcome.generation_calls, 1);
    assert!(outcome.tool_calls.is_empty());
    assert_eq!(outcome.response, "Task halted by user.");
    assert_eq!(session.state, LoopState::Halted);
    assert!(session.history.iter().all(|m| m.role != MessageRole::ToolResult));
}

#[tokio::test]
async fn test_cancel_after_tool_round_skips_next_generation() {
    let generator = Arc::new(ScriptedGenerator::replying(&[
        r#"{"tool": "interrupt", "parameters": {}}"#,
        "should never be generated",
    ]));
    let flag: Arc<OnceLock<CancelFlag>> = Arc::new(OnceLock::new());

    let mut registry = registry();
    let tool_flag = flag.clone();
    registry.register(
        "interrupt",
        Arc::new(FnTool::new("Requests a halt", &[], move |_p: Parameters| {
            let flag = tool_flag.clone();
            async move {
                if let Some(flag) = flag.get() {
                    flag.cancel();
                }
                Ok::<Value, HandlerError>(Value::String("ok".into()))
            }
        })),
    );
    let controller = AgentController::new(
        generator.clone(),
        scheduler(),
        Arc::new(registry),
        AgentConfig::default(),
    );
    let mut session = controller.new_session("s");
    flag.set(session.cancel_flag()).unwrap();

    let outcome = controller.process(&mut session, "go", &OutputSink::disabled()).await;
    assert_eq!(outcome.status, TaskStatus::Halted);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(outcome.generation_calls, 1);
    assert_eq!(generator.calls(), 1);
    // the halt does not outlive its task
    assert!(!session.cancel_flag().is_cancelled());
}

#[tokio::test]
async fn test_sink_receives_chunks_and_answer() {
    let generator = Arc::new(ScriptedGenerator::replying(&[CALC_CALL, "391"]));
    let controller = controller(generator);
    let mut session = controller.new_session("s");
    let (sink, mut rx) = OutputSink::channel(64);

    controller.process(&mut session, "17 * 23", &sink).await;
    drop(sink);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert!(matches!(
        events.first(),
        Some(AgentEvent::Thought { kind: ThoughtKind::Planning, .. })
    ));
    assert!(events.contains(&AgentEvent::Chunk { text: CALC_CALL.into() }));
    assert!(events.contains(&AgentEvent::ToolFinished {
        name: "calculate".into(),
        success: true
    }));
    assert_eq!(events.last(), Some(&AgentEvent::Answer { text: "391".into() }));
}

#[tokio::test]
async fn test_slow_consumer_does_not_stall_loop() {
    let generator = Arc::new(ScriptedGenerator::replying(&[CALC_CALL, CALC_CALL, "done"]));
    let controller = controller(generator);
    let mut session = controller.new_session("s");
    // nobody reads; the one-slot buffer fills on the first event
    let (sink, _rx) = OutputSink::channel(1);

    let outcome = controller.process(&mut session, "go", &sink).await;
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.response, "done");
}

#[tokio::test]
async fn test_session_manager_isolates_sessions() {
    let generator = Arc::new(ScriptedGenerator::replying(&["one", "two", "three"]));
    let manager = SessionManager::new(Arc::new(controller(generator)));
    let sink = OutputSink::disabled();

    manager.process("alice", "hi", &sink).await;
    manager.process("bob", "hi", &sink).await;
    manager.process("alice", "again", &sink).await;

    assert_eq!(manager.session_ids().await, vec!["alice".to_string(), "bob".to_string()]);
    assert_eq!(manager.snapshot("alice").await.unwrap().history.len(), 4);
    assert_eq!(manager.snapshot("bob").await.unwrap().history.len(), 2);

    let status = manager.status("bob").await.unwrap();
    assert!(!status.busy);
    assert_eq!(status.state, Some(LoopState::Completed));
    assert!(status.tools.contains(&"calculate".to_string()));

    // nothing running or queued
    assert!(!manager.halt("alice").await);
    assert!(!manager.halt("carol").await);
    assert!(manager.reset("alice").await);
    assert!(manager.snapshot("alice").await.is_none());
    assert!(manager.status("carol").await.is_none());
}

#[tokio::test]
async fn test_session_manager_halt_reaches_running_task() {
    let generator = Arc::new(GatedGenerator {
        started: Notify::new(),
        release: Notify::new(),
        reply: CALC_CALL.to_string(),
    });
    let manager = Arc::new(SessionManager::new(Arc::new(controller(generator.clone()))));

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.process("s", "compute", &OutputSink::disabled()).await })
    };
    generator.started.notified().await;

    let status = manager.status("s").await.unwrap();
    assert!(status.busy);
    assert!(manager.halt("s").await);
    generator.release.notify_one();

    let outcome = task.await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Halted);
    assert!(outcome.tool_calls.is_empty());
}

#[tokio::test]
async fn test_halt_before_queued_task_starts() {
    let generator = Arc::new(ScriptedGenerator::replying(&[CALC_CALL, "391"]));
    let manager = SessionManager::new(Arc::new(controller(generator.clone())));
    let sink = OutputSink::disabled();

    // unknown session, nothing to reach yet
    assert!(!manager.halt("s").await);

    let task = manager.submit("s").await;
    assert_eq!(task.session_id(), "s");
    assert!(manager.halt("s").await);

    let outcome = manager.run(task, "compute", &sink).await;
    assert_eq!(outcome.status, TaskStatus::Halted);
    assert_eq!(outcome.generation_calls, 0);
    assert_eq!(generator.calls(), 0);

    // the halt was consumed; the next command runs normally
    assert!(!manager.halt("s").await);
    let outcome = manager.process("s", "compute", &sink).await;
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.response, "391");
}
