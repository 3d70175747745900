//! Ollama LLM integration module
//!
//! This module provides a client for Ollama's HTTP API and the
//! `GenerationService` implementation the agent loop uses in production.

pub mod chat;
pub mod generator;

// Re-export public types so other modules can `use crate::ollama::ChatClient`
pub use chat::{ChatClient, ChatError, ChatMessage, ChatResponse, ModelInfo};
pub use generator::OllamaGenerator;
