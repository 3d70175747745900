//! Bounded conversation history for one session
//!
//! Messages are kept in append order with a per-session sequence number.
//! A single leading system message is held apart from the window and is
//! never evicted; everything else is a fixed-size FIFO.
//!
//! ```text
//! [system] + [m(k) m(k+1) ... m(k+N-1)]   ← at most N entries
//!             ▲ evicted first
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::tools::ToolResult;

/// Default number of non-system messages kept
pub const DEFAULT_WINDOW_SIZE: usize = 6;

/// Tool result payloads longer than this many characters are cut
pub const TOOL_RESULT_MAX_CHARS: usize = 500;

/// Appended to a payload that was cut
pub const TRUNCATION_MARKER: &str = "...TRUNCATED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    ToolResult,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::ToolResult => "tool_result",
        }
    }
}

/// One immutable conversation entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub sequence_no: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryWindow {
    system: Option<Message>,
    entries: VecDeque<Message>,
    window_size: usize,
    tool_result_max_chars: usize,
    next_sequence: u64,
    evicted: u64,
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl HistoryWindow {
    /// Create a window holding at most `window_size` non-system messages
    /// (clamped to at least one).
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            system: None,
            entries: VecDeque::with_capacity(window_size + 1),
            window_size,
            tool_result_max_chars: TOOL_RESULT_MAX_CHARS,
            next_sequence: 0,
            evicted: 0,
        }
    }

    pub fn with_tool_result_limit(mut self, max_chars: usize) -> Self {
        self.tool_result_max_chars = max_chars;
        self
    }

    pub fn with_system(mut self, content: impl Into<String>) -> Self {
        self.set_system(content);
        self
    }

    /// Install or replace the leading system message
    pub fn set_system(&mut self, content: impl Into<String>) {
        let sequence_no = self.bump();
        self.system = Some(Message {
            role: MessageRole::System,
            content: content.into(),
            sequence_no,
        });
    }

    pub fn system(&self) -> Option<&Message> {
        self.system.as_ref()
    }

    /// Append a message, evicting the oldest entries beyond the window.
    ///
    /// A `System` message replaces the preamble instead of entering the window.
    pub fn append(&mut self, role: MessageRole, content: impl Into<String>) -> &Message {
        let message = Message {
            role,
            content: content.into(),
            sequence_no: self.bump(),
        };
        if role == MessageRole::System {
            return self.system.insert(message);
        }

        self.entries.push_back(message);
        while self.entries.len() > self.window_size {
            self.entries.pop_front();
            self.evicted += 1;
        }
        // window_size >= 1, so the new entry survived eviction
        &self.entries[self.entries.len() - 1]
    }

    /// Append a tool result as a `tool_result` message with a bounded payload
    pub fn append_tool_result(&mut self, tool: &str, result: &ToolResult) -> &Message {
        let payload = truncate_chars(&result.to_json().to_string(), self.tool_result_max_chars);
        self.append(
            MessageRole::ToolResult,
            format!("TOOL_RESULT({}): {}", tool, payload),
        )
    }

    /// System message (if any) followed by the newest `max_entries` messages
    pub fn snapshot(&self, max_entries: usize) -> Vec<Message> {
        let skip = self.entries.len().saturating_sub(max_entries);
        self.system
            .iter()
            .chain(self.entries.iter().skip(skip))
            .cloned()
            .collect()
    }

    /// The view sent to the generation service
    pub fn window(&self) -> Vec<Message> {
        self.snapshot(self.window_size)
    }

    /// Non-system messages currently held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of messages dropped so far
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&Message> {
        self.entries.back()
    }

    /// Drop all non-system messages. Sequence numbers keep increasing.
    pub fn clear(&mut self) {
        self.evicted += self.entries.len() as u64;
        self.entries.clear();
    }

    fn bump(&mut self) -> u64 {
        let n = self.next_sequence;
        self.next_sequence += 1;
        n
    }
}

/// Cut `s` to at most `max_chars` characters, appending the truncation marker
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((byte_idx, _)) => format!("{}{}", &s[..byte_idx], TRUNCATION_MARKER),
    }
}
