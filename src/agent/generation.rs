//! Generation service seam
//!
//! The agent loop only needs "turn this window of messages into text".
//! The Ollama client implements it for real use; tests plug in scripted
//! fakes.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::history::Message;
use super::sink::OutputSink;
use crate::scheduler::Role;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    /// The backend could not be reached or refused the request
    #[error("generation service unavailable: {0}")]
    ServiceUnavailable(String),
    /// No response within the allotted time
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    /// The backend answered with something we could not read
    #[error("malformed generation response: {0}")]
    Protocol(String),
    #[error("generation service returned an empty response")]
    EmptyResponse,
}

/// Which model a generation call is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTarget {
    pub role: Role,
    pub model: String,
}

impl ModelTarget {
    pub fn new(role: Role, model: impl Into<String>) -> Self {
        Self {
            role,
            model: model.into(),
        }
    }
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Produce the full response text for `window`
    async fn generate(
        &self,
        window: &[Message],
        target: &ModelTarget,
    ) -> Result<String, GenerationError>;

    /// Produce the response, pushing fragments to `sink` as they arrive.
    ///
    /// Returns the assembled text. The default delivers it as one fragment.
    async fn generate_stream(
        &self,
        window: &[Message],
        target: &ModelTarget,
        sink: &OutputSink,
    ) -> Result<String, GenerationError> {
        let text = self.generate(window, target).await?;
        sink.chunk(text.clone());
        Ok(text)
    }

    /// Ask the backend to drop a model from memory. Best effort.
    async fn unload(&self, _model: &str) -> Result<(), GenerationError> {
        Ok(())
    }
}
