//! Runtime abstractions for the model service.
//!
//! The pipeline talks to a language model through [`AIProvider`]. Requests
//! carry role-tagged [`Turn`]s built from core [`Message`]s; concrete
//! providers translate them into their own wire format.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use quill_core::{Message, Role, UsageMetadata};

pub mod providers;

pub use providers::{GeminiConfig, GeminiProvider};

/// One role-tagged text turn of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

impl From<&Message> for Turn {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            text: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub thinking_budget: Option<i32>,
    /// Ask the service to return reasoning text alongside the answer.
    pub include_thoughts: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub contents: Vec<Turn>,
    pub model: Option<String>,
    pub generation_config: GenerationConfig,
    pub system_instruction: Option<String>,
}

impl GenerateRequest {
    pub fn new(contents: Vec<Turn>) -> Self {
        Self {
            contents,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub content: String,
    pub thoughts: Option<String>,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<UsageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChunk {
    Delta { text: String },
    Thought { text: String },
    Usage { usage: UsageMetadata },
    Done,
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("mock provider has no queued response")]
    MockQueueEmpty,
    #[error("provider error: {0}")]
    Message(String),
    #[error("missing provider configuration: {0}")]
    MissingConfig(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("model returned no usable content")]
    EmptyResponse,
}

#[async_trait]
pub trait AIProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, ProviderError>;

    async fn generate_stream(&self, req: GenerateRequest) -> Result<ProviderStream, ProviderError>;

    /// Prompt token count of `req.contents` as the service would bill it.
    async fn count_tokens(&self, req: GenerateRequest) -> Result<u32, ProviderError>;
}

/// Drain a stream into one response, keeping the last reported usage.
pub async fn collect_stream(mut stream: ProviderStream) -> Result<GenerateResponse, ProviderError> {
    let mut response = GenerateResponse::default();
    let mut thoughts = String::new();

    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::Delta { text } => response.content.push_str(&text),
            StreamChunk::Thought { text } => thoughts.push_str(&text),
            StreamChunk::Usage { usage } => response.usage = Some(usage),
            StreamChunk::Done => break,
        }
    }

    if !thoughts.is_empty() {
        response.thoughts = Some(thoughts);
    }
    Ok(response)
}

/// Scripted provider for tests. Every request is recorded.
#[derive(Debug, Default)]
pub struct MockProvider {
    generate_queue: Mutex<VecDeque<Result<GenerateResponse, ProviderError>>>,
    stream_queue: Mutex<VecDeque<Result<Vec<StreamChunk>, ProviderError>>>,
    count_queue: Mutex<VecDeque<Result<u32, ProviderError>>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_generate(&self, result: Result<GenerateResponse, ProviderError>) {
        self.generate_queue
            .lock()
            .expect("mock generate queue poisoned")
            .push_back(result);
    }

    pub fn enqueue_stream(&self, result: Result<Vec<StreamChunk>, ProviderError>) {
        self.stream_queue
            .lock()
            .expect("mock stream queue poisoned")
            .push_back(result);
    }

    pub fn enqueue_count_tokens(&self, result: Result<u32, ProviderError>) {
        self.count_queue
            .lock()
            .expect("mock count queue poisoned")
            .push_back(result);
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .expect("mock request log poisoned")
            .clone()
    }

    fn record(&self, req: GenerateRequest) {
        self.requests
            .lock()
            .expect("mock request log poisoned")
            .push(req);
    }
}

#[async_trait]
impl AIProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        self.record(req);
        self.generate_queue
            .lock()
            .expect("mock generate queue poisoned")
            .pop_front()
            .unwrap_or(Err(ProviderError::MockQueueEmpty))
    }

    async fn generate_stream(&self, req: GenerateRequest) -> Result<ProviderStream, ProviderError> {
        self.record(req);
        let next = self
            .stream_queue
            .lock()
            .expect("mock stream queue poisoned")
            .pop_front()
            .unwrap_or(Err(ProviderError::MockQueueEmpty))?;

        Ok(Box::pin(stream::iter(next.into_iter().map(Ok))))
    }

    async fn count_tokens(&self, _req: GenerateRequest) -> Result<u32, ProviderError> {
        self.count_queue
            .lock()
            .expect("mock count queue poisoned")
            .pop_front()
            .unwrap_or(Err(ProviderError::MockQueueEmpty))
    }
}
