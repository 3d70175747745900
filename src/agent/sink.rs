//! Best-effort output stream from the agent loop to a transport
//!
//! The loop never waits on a consumer: events are pushed with `try_send`
//! into a bounded channel and dropped when it is full or closed. Final
//! answers live in the session history, so a lost event only affects what
//! a client saw live.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::metrics::SINK_DROPPED;

/// Kind of a status line shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThoughtKind {
    Planning,
    Action,
    Tool,
    System,
}

/// Event emitted while a task runs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Incremental text from the generation service
    Chunk { text: String },
    /// Status/progress line
    Thought { text: String, kind: ThoughtKind },
    ToolStarted { name: String },
    ToolFinished { name: String, success: bool },
    /// Final user-facing answer of a task
    Answer { text: String },
}

/// Cloneable, non-blocking event sender
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    tx: Option<mpsc::Sender<AgentEvent>>,
}

impl OutputSink {
    /// Create a sink and its receiving end with room for `buffer` events
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Push an event without waiting. Returns whether it was accepted.
    pub fn emit(&self, event: AgentEvent) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                SINK_DROPPED.inc();
                debug!("Output sink full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                SINK_DROPPED.inc();
                false
            }
        }
    }

    pub fn chunk(&self, text: impl Into<String>) -> bool {
        self.emit(AgentEvent::Chunk { text: text.into() })
    }

    pub fn thought(&self, text: impl Into<String>, kind: ThoughtKind) -> bool {
        self.emit(AgentEvent::Thought {
            text: text.into(),
            kind,
        })
    }
}
