//! Agent sessions
//!
//! A [`Session`] is one isolated conversation: its own history window,
//! iteration counter and cancellation flag. [`SessionManager`] creates
//! sessions on first use and routes commands, halts and resets to them;
//! [`SessionStore`] saves and resumes them on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::controller::{AgentController, CancelFlag, LoopState, TaskOutcome};
use super::history::HistoryWindow;
use super::sink::OutputSink;

/// One isolated conversation thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier chosen by the caller
    pub id: String,
    /// Creation time, seconds since the Unix epoch
    pub created_at: u64,
    /// Last update, seconds since the Unix epoch
    pub updated_at: u64,
    /// Bounded conversation log
    pub history: HistoryWindow,
    /// Tool-dispatch iterations of the current or last task
    pub iterations: usize,
    pub state: LoopState,
    #[serde(skip)]
    pub(crate) cancel: CancelFlag,
}

impl Session {
    pub fn new(id: impl Into<String>, history: HistoryWindow) -> Self {
        let now = unix_timestamp();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            history,
            iterations: 0,
            state: LoopState::Idle,
            cancel: CancelFlag::new(),
        }
    }

    /// Handle that cancels this session's running task
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = unix_timestamp();
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: String,
    /// A task is currently running
    pub busy: bool,
    /// Loop state; unknown while a task holds the session
    pub state: Option<LoopState>,
    pub iterations: Option<usize>,
    pub history_len: Option<usize>,
    pub tools: Vec<String>,
}

/// Tasks queued or running on one session, plus the flag that halts them
#[derive(Debug)]
struct TaskGate {
    pending: StdMutex<usize>,
    cancel: CancelFlag,
}

impl TaskGate {
    fn new(cancel: CancelFlag) -> Self {
        Self {
            pending: StdMutex::new(0),
            cancel,
        }
    }

    fn pending(&self) -> MutexGuard<'_, usize> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self) {
        *self.pending() += 1;
    }

    /// A finished task takes its halt request with it
    fn leave(&self) {
        let mut pending = self.pending();
        *pending = pending.saturating_sub(1);
        self.cancel.reset();
    }

    /// Cancel the running or next queued task. False when nothing is pending.
    fn halt(&self) -> bool {
        let pending = self.pending();
        if *pending == 0 {
            return false;
        }
        self.cancel.cancel();
        true
    }
}

struct SessionEntry {
    session: Arc<Mutex<Session>>,
    gate: Arc<TaskGate>,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self {
            gate: Arc::new(TaskGate::new(session.cancel_flag())),
            session: Arc::new(Mutex::new(session)),
        }
    }
}

/// A command accepted for a session but not yet finished
///
/// Created by [`SessionManager::submit`]; from then on
/// [`SessionManager::halt`] reaches it, even before it starts running.
pub struct QueuedTask {
    session_id: String,
    session: Arc<Mutex<Session>>,
    gate: Arc<TaskGate>,
}

impl QueuedTask {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for QueuedTask {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

/// Routes commands to per-session controllers
///
/// Sessions run independently; the only shared state is the controller's
/// scheduler and tool registry.
pub struct SessionManager {
    controller: Arc<AgentController>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionManager {
    pub fn new(controller: Arc<AgentController>) -> Self {
        Self {
            controller,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn controller(&self) -> &AgentController {
        &self.controller
    }

    /// Register a command for session `id`, creating the session if needed
    pub async fn submit(&self, id: &str) -> QueuedTask {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.entry(id.to_string()).or_insert_with(|| {
            info!(session_id = %id, "Creating session");
            SessionEntry::new(self.controller.new_session(id))
        });
        entry.gate.enter();
        QueuedTask {
            session_id: id.to_string(),
            session: entry.session.clone(),
            gate: entry.gate.clone(),
        }
    }

    /// Run a submitted command once earlier commands on its session are done
    pub async fn run(&self, task: QueuedTask, command: &str, sink: &OutputSink) -> TaskOutcome {
        let session = task.session.clone();
        let mut session = session.lock().await;
        let outcome = self.controller.process(&mut session, command, sink).await;
        drop(task);
        outcome
    }

    /// Run `command` in session `id`, creating the session if needed.
    ///
    /// Commands for the same session run one after another.
    pub async fn process(&self, id: &str, command: &str, sink: &OutputSink) -> TaskOutcome {
        let task = self.submit(id).await;
        self.run(task, command, sink).await
    }

    /// Request cancellation of the session's running or queued task.
    ///
    /// Returns false for unknown sessions and idle ones.
    pub async fn halt(&self, id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        match sessions.get(id) {
            Some(entry) if entry.gate.halt() => {
                info!(session_id = %id, "Halt requested");
                true
            }
            _ => false,
        }
    }

    /// Destroy a session. A running task is cancelled and finishes detached.
    pub async fn reset(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id);
        match removed {
            Some(entry) => {
                entry.gate.cancel.cancel();
                info!(session_id = %id, "Session reset");
                true
            }
            None => false,
        }
    }

    /// Install a previously saved session, replacing any with the same id
    pub async fn restore(&self, session: Session) {
        let id = session.id.clone();
        let entry = SessionEntry::new(session);
        if let Some(old) = self.sessions.lock().await.insert(id.clone(), entry) {
            old.gate.cancel.cancel();
        }
        debug!(session_id = %id, "Session restored");
    }

    pub async fn status(&self, id: &str) -> Option<SessionStatus> {
        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(id)?.session.clone()
        };
        let tools = self
            .controller
            .registry()
            .names()
            .into_iter()
            .map(String::from)
            .collect();

        let status = match session.try_lock() {
            Ok(session) => SessionStatus {
                id: id.to_string(),
                busy: false,
                state: Some(session.state),
                iterations: Some(session.iterations),
                history_len: Some(session.history.len()),
                tools,
            },
            Err(_) => SessionStatus {
                id: id.to_string(),
                busy: true,
                state: None,
                iterations: None,
                history_len: None,
                tools,
            },
        };
        Some(status)
    }

    /// Copy of a session, waiting for any running task to finish
    pub async fn snapshot(&self, id: &str) -> Option<Session> {
        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(id)?.session.clone()
        };
        let session = session.lock().await;
        Some(session.clone())
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Session storage manager
pub struct SessionStore {
    /// Base directory for session files
    base_dir: PathBuf,
}

impl SessionStore {
    /// Create a new session store
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Create with default directory (~/.neurosurf/sessions)
    pub fn default_store() -> std::io::Result<Self> {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let base_dir = PathBuf::from(home).join(".neurosurf").join("sessions");
        Self::new(base_dir)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Save a session to disk
    pub fn save(&self, session: &Session) -> std::io::Result<PathBuf> {
        let path = self.session_path(&session.id)?;
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Load a session from disk
    pub fn load(&self, session_id: &str) -> std::io::Result<Session> {
        let path = self.session_path(session_id)?;
        Self::load_from_path(&path)
    }

    /// List all sessions, most recently updated first
    pub fn list(&self) -> std::io::Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match Self::load_from_path(&path) {
                    Ok(session) => sessions.push(SessionSummary {
                        last_message: session
                            .history
                            .last()
                            .map(|m| truncate(&m.content, 50))
                            .unwrap_or_default(),
                        id: session.id,
                        created_at: session.created_at,
                        updated_at: session.updated_at,
                        iterations: session.iterations,
                        state: session.state,
                    }),
                    Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable session file"),
                }
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Delete a session
    pub fn delete(&self, session_id: &str) -> std::io::Result<()> {
        let path = self.session_path(session_id)?;
        std::fs::remove_file(path)
    }

    /// File path for a session; ids must be plain file names
    fn session_path(&self, session_id: &str) -> std::io::Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !session_id.starts_with('.');
        if !valid {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid session id '{}'", session_id),
            ));
        }
        Ok(self.base_dir.join(format!("{}.json", session_id)))
    }

    fn load_from_path(path: &Path) -> std::io::Result<Session> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Summary of a saved session for listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub iterations: usize,
    pub state: LoopState,
    pub last_message: String,
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Truncate a string to `max_chars` characters, adding an ellipsis if needed
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::history::MessageRole;

    fn session(id: &str) -> Session {
        let mut history = HistoryWindow::new(4).with_system("be brief");
        history.append(MessageRole::User, "What is 2 + 2?");
        history.append(MessageRole::Assistant, "4");
        Session::new(id, history)
    }

    #[test]
    fn test_session_creation() {
        let session = session("alpha");
        assert_eq!(session.id, "alpha");
        assert_eq!(session.state, LoopState::Idle);
        assert_eq!(session.history.len(), 2);
        assert!(!session.cancel_flag().is_cancelled());
    }

    #[test]
    fn test_store_round_trip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();

        store.save(&session("alpha")).unwrap();
        store.save(&session("beta")).unwrap();

        let loaded = store.load("alpha").unwrap();
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(loaded.history.system().unwrap().content, "be brief");
        assert_eq!(loaded.history.last().unwrap().content, "4");

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| s.last_message == "4"));

        store.delete("alpha").unwrap();
        assert!(store.load("alpha").is_err());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        assert!(store.load("../etc/passwd").is_err());
        assert!(store.save(&session("a/b")).is_err());
        assert!(store.delete("").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
    }
}
