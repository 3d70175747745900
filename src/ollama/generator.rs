//! `GenerationService` backed by Ollama

use async_trait::async_trait;
use tracing::debug;

use super::chat::{ChatClient, ChatError, ChatMessage};
use crate::agent::{GenerationError, GenerationService, Message, ModelTarget, OutputSink};

impl From<ChatError> for GenerationError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::Connect(msg) => GenerationError::ServiceUnavailable(msg),
            ChatError::Status { status, body } => {
                GenerationError::ServiceUnavailable(format!("HTTP {}: {}", status, body))
            }
            ChatError::Timeout(after) => GenerationError::Timeout(after),
            ChatError::Backend(msg) => GenerationError::Protocol(msg),
            ChatError::Parse(e) => GenerationError::Protocol(e.to_string()),
            ChatError::EmptyResponse => GenerationError::EmptyResponse,
        }
    }
}

/// Generation over Ollama's chat endpoint, one model per role
#[derive(Clone)]
pub struct OllamaGenerator {
    client: ChatClient,
}

impl OllamaGenerator {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ChatClient {
        &self.client
    }
}

fn to_chat(window: &[Message]) -> Vec<ChatMessage> {
    window.iter().map(ChatMessage::from).collect()
}

#[async_trait]
impl GenerationService for OllamaGenerator {
    async fn generate(
        &self,
        window: &[Message],
        target: &ModelTarget,
    ) -> Result<String, GenerationError> {
        let response = self.client.chat(&to_chat(window), &target.model).await?;
        debug!(role = %target.role, eval_count = response.eval_count, "Generation finished");
        Ok(response.content().to_string())
    }

    async fn generate_stream(
        &self,
        window: &[Message],
        target: &ModelTarget,
        sink: &OutputSink,
    ) -> Result<String, GenerationError> {
        let response = self
            .client
            .chat_stream(&to_chat(window), &target.model, |token| {
                sink.chunk(token);
            })
            .await?;
        Ok(response.content().to_string())
    }

    async fn unload(&self, model: &str) -> Result<(), GenerationError> {
        self.client.unload(model).await.map_err(GenerationError::from)
    }
}
