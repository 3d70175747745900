//! NeuroSurf interactive agent
//!
//! Reads commands from stdin and runs them through the agent loop. A task
//! runs in the background so `stop` can halt it; lines starting with `/`
//! are REPL commands.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use neurosurf::agent::{AgentEvent, SessionStore, ThoughtKind};
use neurosurf::tools::builtin_registry;
use neurosurf::{
    trace_log, AgentController, ChatClient, Config, OllamaGenerator, OutputSink, SessionManager,
    TaskOutcome,
};

const HALT_WORDS: [&str; 4] = ["stop", "halt", "cancel", "abort"];

#[derive(Parser)]
#[command(name = "neurosurf")]
#[command(about = "Tool-calling agent over local Ollama models")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, short, env = "NEUROSURF_CONFIG")]
    config: Option<PathBuf>,

    /// Session to start in
    #[arg(long, default_value = "default")]
    session: String,

    /// Run a single command and exit
    #[arg(long)]
    once: Option<String>,

    /// Skip the model availability check at startup
    #[arg(long, default_value = "false")]
    offline: bool,
}

const HELP: &str = "\
Commands:
  /session <id>   switch to (or create) a session
  /sessions       list active and saved sessions
  /reset          discard the current session
  /status         show session and scheduler state
  /models         list models available on the Ollama server
  /metrics        print Prometheus metrics
  /save           save the current session to disk
  /load <id>      restore a saved session
  /quit           exit
  stop|halt|cancel|abort   halt the running task";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref()).context("loading configuration")?;

    if let Err(e) = neurosurf::tracing::init_tracing(&config.telemetry) {
        eprintln!("failed to initialize tracing: {}", e);
    }

    let client = ChatClient::from_config(&config.ollama);
    if !cli.offline {
        check_models(&client, &config).await;
    }

    let scheduler = config.scheduler.build().context("building scheduler")?;
    let registry = builtin_registry(config.agent.tool_timeout());
    let controller = AgentController::new(
        Arc::new(OllamaGenerator::new(client.clone())),
        Arc::new(scheduler),
        Arc::new(registry),
        config.agent.clone(),
    );
    let manager = Arc::new(SessionManager::new(Arc::new(controller)));

    let (sink, mut events) = OutputSink::channel(config.agent.event_buffer);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let result = match cli.once {
        Some(command) => {
            let outcome = manager.process(&cli.session, &command, &sink).await;
            finish(&outcome);
            Ok(())
        }
        None => repl(manager, client, sink.clone(), cli.session).await,
    };

    drop(sink);
    let _ = printer.await;
    neurosurf::tracing::shutdown_tracing();
    result
}

async fn repl(
    manager: Arc<SessionManager>,
    client: ChatClient,
    sink: OutputSink,
    mut session_id: String,
) -> Result<()> {
    let store = SessionStore::default_store().context("opening session store")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut running: Option<JoinHandle<TaskOutcome>> = None;
    let mut running_id = session_id.clone();

    println!("NeuroSurf ready (session '{}'). Type /help for commands.", session_id);
    prompt();

    loop {
        tokio::select! {
            finished = join_running(&mut running), if running.is_some() => {
                running = None;
                match finished {
                    Ok(outcome) => finish(&outcome),
                    Err(e) => warn!(error = %e, "Agent task aborted"),
                }
                prompt();
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    prompt();
                    continue;
                }

                if HALT_WORDS.contains(&line.to_ascii_lowercase().as_str()) {
                    if running.is_some() && manager.halt(&running_id).await {
                        println!("Halting...");
                    } else {
                        println!("Nothing to halt.");
                        prompt();
                    }
                    continue;
                }

                if let Some(command) = line.strip_prefix('/') {
                    let mut parts = command.splitn(2, char::is_whitespace);
                    let name = parts.next().unwrap_or_default();
                    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());
                    match (name, arg) {
                        ("quit" | "exit", _) => break,
                        ("help", _) => println!("{}", HELP),
                        ("session", Some(id)) => {
                            session_id = id.to_string();
                            println!("Switched to session '{}'", session_id);
                        }
                        ("sessions", _) => {
                            println!("Active: {}", manager.session_ids().await.join(", "));
                            match store.list() {
                                Ok(saved) => {
                                    for s in saved {
                                        println!("  saved {} ({:?}, {} iterations) {}", s.id, s.state, s.iterations, s.last_message);
                                    }
                                }
                                Err(e) => println!("Could not list saved sessions: {}", e),
                            }
                        }
                        ("reset", _) => {
                            if manager.reset(&session_id).await {
                                println!("Session '{}' reset", session_id);
                            } else {
                                println!("Session '{}' has no history", session_id);
                            }
                        }
                        ("status", _) => {
                            match manager.status(&session_id).await {
                                Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                                None => println!("Session '{}' not started", session_id),
                            }
                            let scheduler = manager.controller().scheduler().status();
                            println!("{}", serde_json::to_string_pretty(&scheduler)?);
                        }
                        ("models", _) => match client.list_models().await {
                            Ok(models) => {
                                for model in models {
                                    println!("  {} ({:.1} GB)", model.name, model.size as f64 / 1e9);
                                }
                            }
                            Err(e) => println!("Could not list models: {}", e),
                        },
                        ("metrics", _) => print!("{}", neurosurf::metrics::encode_metrics()),
                        ("save", _) => match manager.snapshot(&session_id).await {
                            Some(session) => match store.save(&session) {
                                Ok(path) => println!("Saved to {}", path.display()),
                                Err(e) => println!("Save failed: {}", e),
                            },
                            None => println!("Session '{}' not started", session_id),
                        },
                        ("load", Some(id)) => match store.load(id) {
                            Ok(session) => {
                                manager.restore(session).await;
                                session_id = id.to_string();
                                println!("Loaded session '{}'", session_id);
                            }
                            Err(e) => println!("Load failed: {}", e),
                        },
                        _ => println!("Unknown command. Type /help for commands."),
                    }
                    prompt();
                    continue;
                }

                if running.is_some() {
                    println!("A task is still running; type 'stop' to halt it.");
                    continue;
                }

                // registered before spawning so an immediate halt reaches it
                let task = manager.submit(&session_id).await;
                running_id = session_id.clone();
                let manager = manager.clone();
                let sink = sink.clone();
                let command = line.to_string();
                running = Some(tokio::spawn(async move {
                    manager.run(task, &command, &sink).await
                }));
            }
        }
    }

    if running.is_some() {
        manager.halt(&running_id).await;
    }
    Ok(())
}

/// Completes when the running task does; pending forever when there is none
async fn join_running(
    running: &mut Option<JoinHandle<TaskOutcome>>,
) -> Result<TaskOutcome, tokio::task::JoinError> {
    match running {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn check_models(client: &ChatClient, config: &Config) {
    match client.list_models().await {
        Ok(models) => {
            for (role, descriptor) in &config.scheduler.roles {
                let present = models.iter().any(|m| m.name == descriptor.model);
                if present {
                    info!(role = %role, model = %descriptor.model, "Model available");
                } else {
                    warn!(role = %role, model = %descriptor.model, "Model not pulled; run `ollama pull {}`", descriptor.model);
                }
            }
        }
        Err(e) => warn!(url = %client.base_url(), error = %e, "Ollama not reachable"),
    }
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::Chunk { text } => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        AgentEvent::Thought { text, kind } => {
            let tag = match kind {
                ThoughtKind::Planning => "plan",
                ThoughtKind::Action => "action",
                ThoughtKind::Tool => "tool",
                ThoughtKind::System => "system",
            };
            println!("\n[{}] {}", tag, text);
        }
        AgentEvent::ToolStarted { .. } => {}
        AgentEvent::ToolFinished { name, success } => {
            println!("[tool] {} {}", name, if *success { "ok" } else { "failed" });
        }
        AgentEvent::Answer { .. } => println!(),
    }
}

fn finish(outcome: &TaskOutcome) {
    trace_log!(
        info,
        outcome.trace_id,
        status = ?outcome.status,
        iterations = outcome.iterations,
        tool_calls = outcome.tool_calls.len(),
        "Task finished"
    );
    println!("\n=> {}", outcome.response);
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
