//! Ollama `/api/chat` client
//!
//! Non-streaming and streaming chat, model listing via `/api/tags`, and
//! model unloading (`keep_alive: 0`).

use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::agent::{Message, MessageRole};
use crate::config::OllamaConfig;

/// A message in a chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        match message.role {
            MessageRole::System => ChatMessage::system(message.content.clone()),
            MessageRole::User => ChatMessage::user(message.content.clone()),
            MessageRole::Assistant => ChatMessage::assistant(message.content.clone()),
            MessageRole::ToolResult => ChatMessage::tool(message.content.clone()),
        }
    }
}

/// One frame from /api/chat; the whole response when not streaming
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub model: String,
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub eval_count: u32,
    #[serde(default)]
    pub eval_duration: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl ChatResponse {
    pub fn content(&self) -> &str {
        self.message.as_ref().map(|m| m.content.as_str()).unwrap_or("")
    }
}

/// A locally available model, from /api/tags
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// Error type for chat operations
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("could not reach Ollama: {0}")]
    Connect(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Ollama returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Ollama error: {0}")]
    Backend(String),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("empty response from Ollama")]
    EmptyResponse,
}

/// Client for Ollama's HTTP API
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    client: reqwest::Client,
    temperature: f32,
    num_ctx: Option<u32>,
    keep_alive: Option<String>,
    request_timeout: Duration,
}

impl ChatClient {
    /// Create a new chat client with default options
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::from_config(&OllamaConfig {
            base_url: base_url.into(),
            ..OllamaConfig::default()
        })
    }

    pub fn from_config(config: &OllamaConfig) -> Self {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            temperature: config.temperature,
            num_ctx: config.num_ctx,
            keep_alive: config.keep_alive.clone(),
            request_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body(&self, messages: &[ChatMessage], model: &str, stream: bool) -> serde_json::Value {
        let mut options = serde_json::json!({ "temperature": self.temperature });
        if let Some(num_ctx) = self.num_ctx {
            options["num_ctx"] = num_ctx.into();
        }
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
            "options": options,
        });
        if let Some(keep_alive) = &self.keep_alive {
            body["keep_alive"] = keep_alive.clone().into();
        }
        body
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response, ChatError> {
        let endpoint = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;
        check_status(response).await
    }

    fn map_reqwest(&self, e: reqwest::Error) -> ChatError {
        if e.is_timeout() {
            ChatError::Timeout(self.request_timeout)
        } else {
            ChatError::Connect(e.to_string())
        }
    }

    /// Send a non-streaming chat request
    ///
    /// # Arguments
    /// * `messages` - The conversation window
    /// * `model` - The model name (e.g., "llama3.2:3b")
    pub async fn chat(&self, messages: &[ChatMessage], model: &str) -> Result<ChatResponse, ChatError> {
        let body = self.request_body(messages, model, false);
        let fut = async {
            let response = self.post("/api/chat", &body).await?;
            let text = response.text().await.map_err(|e| self.map_reqwest(e))?;
            if text.trim().is_empty() {
                return Err(ChatError::EmptyResponse);
            }
            parse_frame(text.as_bytes())
        };
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| ChatError::Timeout(self.request_timeout))?
    }

    /// Send a streaming chat request, calling `on_token` for each fragment.
    ///
    /// Returns the assembled response; `eval_count` and `eval_duration`
    /// come from the final frame.
    pub async fn chat_stream<F>(
        &self,
        messages: &[ChatMessage],
        model: &str,
        mut on_token: F,
    ) -> Result<ChatResponse, ChatError>
    where
        F: FnMut(&str) + Send,
    {
        let body = self.request_body(messages, model, true);
        let response = self.post("/api/chat", &body).await?;
        let mut bytes_stream = response.bytes_stream();

        let mut decoder = NdjsonDecoder::default();
        let mut assembler = StreamAssembler::default();

        'read: while let Some(chunk) = bytes_stream.next().await {
            let bytes = chunk.map_err(|e| self.map_reqwest(e))?;
            for line in decoder.push(&bytes) {
                assembler.accept(parse_frame(&line)?, &mut on_token);
                if assembler.done {
                    break 'read;
                }
            }
        }
        if !assembler.done {
            if let Some(line) = decoder.finish() {
                assembler.accept(parse_frame(&line)?, &mut on_token);
            }
        }

        let response = assembler.finish()?;
        debug!(model = %model, eval_count = response.eval_count, "Chat stream finished");
        Ok(response)
    }

    /// Models available on the server
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ChatError> {
        let endpoint = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;
        let text = check_status(response)
            .await?
            .text()
            .await
            .map_err(|e| self.map_reqwest(e))?;
        let tags: TagsResponse = serde_json::from_str(&text)?;
        Ok(tags.models)
    }

    /// Ask the server to drop `model` from memory now
    pub async fn unload(&self, model: &str) -> Result<(), ChatError> {
        let body = serde_json::json!({ "model": model, "keep_alive": 0 });
        self.post("/api/generate", &body).await?;
        debug!(model = %model, "Model unloaded");
        Ok(())
    }
}

/// Folds streamed frames into one response; frames after `done` are ignored
#[derive(Debug, Default)]
struct StreamAssembler {
    content: String,
    last: Option<ChatResponse>,
    done: bool,
}

impl StreamAssembler {
    fn accept<F: FnMut(&str)>(&mut self, frame: ChatResponse, on_token: &mut F) {
        if self.done {
            return;
        }
        let token = frame.content();
        if !token.is_empty() {
            on_token(token);
            self.content.push_str(token);
        }
        self.done = frame.done;
        self.last = Some(frame);
    }

    fn finish(self) -> Result<ChatResponse, ChatError> {
        let mut response = self.last.ok_or(ChatError::EmptyResponse)?;
        response.message = Some(ChatMessage::assistant(self.content));
        Ok(response)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or(body);
    Err(ChatError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Parse one JSON frame, surfacing in-band `{"error": ...}` frames
pub(crate) fn parse_frame(bytes: &[u8]) -> Result<ChatResponse, ChatError> {
    let frame: ChatResponse = serde_json::from_slice(bytes)?;
    match frame.error {
        Some(error) => Err(ChatError::Backend(error)),
        None => Ok(frame),
    }
}

/// Splits a byte stream into newline-delimited records.
///
/// HTTP chunks do not respect line boundaries, so partial lines are held
/// until the rest arrives.
#[derive(Debug, Default)]
pub(crate) struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = trim_ascii(&line[..line.len() - 1]);
            if !line.is_empty() {
                lines.push(line.to_vec());
            }
        }
        lines
    }

    /// Whatever is left after the stream ends without a trailing newline
    pub(crate) fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = trim_ascii(&rest);
        (!rest.is_empty()).then(|| rest.to_vec())
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}
