//! Gemini `generateContent` provider.
//!
//! Translates [`Turn`]s into `{role, parts: [{text}]}` contents and reads
//! text, reasoning parts and `usageMetadata` back out of the first candidate.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    AIProvider, GenerateRequest, GenerateResponse, GenerationConfig, ProviderError,
    ProviderStream, StreamChunk, Turn, UsageMetadata,
};

const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for [`GeminiProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Read `GEMINI_API_KEY`, `GEMINI_API_BASE` and `QUILL_MODEL`, loading a
    /// `.env` file first when one is present.
    pub fn from_env() -> Result<Self, ProviderError> {
        let _ = dotenvy::dotenv();

        let api_key = env::var("GEMINI_API_KEY").map_err(|_| {
            ProviderError::MissingConfig(
                "missing required environment variable 'GEMINI_API_KEY'".to_string(),
            )
        })?;
        if api_key.trim().is_empty() {
            return Err(ProviderError::MissingConfig(
                "environment variable 'GEMINI_API_KEY' is empty".to_string(),
            ));
        }

        Ok(Self {
            api_key,
            base_url: env::var("GEMINI_API_BASE")
                .unwrap_or_else(|_| DEFAULT_GEMINI_BASE_URL.to_string()),
            default_model: env::var("QUILL_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(GeminiConfig::from_env()?)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{}",
            self.config.base_url.trim_end_matches('/'),
            model,
            method
        )
    }

    fn model_for(&self, req: &GenerateRequest) -> String {
        req.model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    fn payload(&self, req: GenerateRequest) -> (String, GeminiGenerateRequest) {
        let model = self.model_for(&req);
        (
            model,
            GeminiGenerateRequest {
                contents: req.contents.iter().map(GeminiContent::from).collect(),
                generation_config: GeminiGenerationConfig::from(&req.generation_config),
                system_instruction: req
                    .system_instruction
                    .filter(|text| !text.trim().is_empty())
                    .map(|text| GeminiSystemInstruction {
                        parts: vec![GeminiPart::text(text)],
                    }),
            },
        )
    }

    async fn parse_error_response(status: StatusCode, response: reqwest::Response) -> ProviderError {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());

        let parsed = serde_json::from_str::<GeminiErrorEnvelope>(&body)
            .ok()
            .map(|err| err.error.message)
            .unwrap_or_else(|| body.clone());

        ProviderError::HttpStatus {
            status: status.as_u16(),
            body: parsed,
        }
    }
}

#[async_trait]
impl AIProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        let (model, payload) = self.payload(req);
        debug!(model = %model, turns = payload.contents.len(), "gemini generateContent");

        let response = self
            .client
            .post(self.endpoint(&model, "generateContent"))
            .query(&[("key", self.config.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::parse_error_response(status, response).await);
        }

        let body: GeminiGenerateResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;

        let usage = body.usage_metadata;
        let candidate = body
            .candidates
            .into_iter()
            .next()
            .ok_or(ProviderError::EmptyResponse)?;

        let (content, thoughts) = split_parts(candidate.content.parts);

        Ok(GenerateResponse {
            content,
            thoughts: (!thoughts.is_empty()).then_some(thoughts),
            model: Some(model),
            finish_reason: candidate.finish_reason,
            usage,
        })
    }

    async fn generate_stream(&self, req: GenerateRequest) -> Result<ProviderStream, ProviderError> {
        let (model, payload) = self.payload(req);
        debug!(model = %model, turns = payload.contents.len(), "gemini streamGenerateContent");

        let request = self
            .client
            .post(self.endpoint(&model, "streamGenerateContent"))
            .query(&[("alt", "sse"), ("key", self.config.api_key.as_str())])
            .json(&payload);

        let mut event_source = request
            .eventsource()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<StreamChunk, ProviderError>>(32);
        tokio::spawn(async move {
            let mut done_sent = false;
            let mut last_usage: Option<UsageMetadata> = None;

            while let Some(event) = event_source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => {
                        let chunk = match serde_json::from_str::<GeminiGenerateResponse>(&message.data) {
                            Ok(chunk) => chunk,
                            Err(err) => {
                                let _ = tx.send(Err(ProviderError::Decode(err.to_string()))).await;
                                event_source.close();
                                break;
                            }
                        };

                        if chunk.usage_metadata.is_some() {
                            last_usage = chunk.usage_metadata;
                        }

                        if let Some(candidate) = chunk.candidates.into_iter().next() {
                            for part in candidate.content.parts {
                                if part.text.is_empty() {
                                    continue;
                                }
                                let chunk = if part.thought {
                                    StreamChunk::Thought { text: part.text }
                                } else {
                                    StreamChunk::Delta { text: part.text }
                                };
                                let _ = tx.send(Ok(chunk)).await;
                            }

                            if candidate.finish_reason.is_some() {
                                if let Some(usage) = last_usage.take() {
                                    let _ = tx.send(Ok(StreamChunk::Usage { usage })).await;
                                }
                                let _ = tx.send(Ok(StreamChunk::Done)).await;
                                done_sent = true;
                                event_source.close();
                                break;
                            }
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(err) => {
                        warn!(error = %err, "gemini stream failed");
                        let _ = tx.send(Err(ProviderError::Transport(err.to_string()))).await;
                        event_source.close();
                        break;
                    }
                }
            }

            if !done_sent {
                if let Some(usage) = last_usage {
                    let _ = tx.send(Ok(StreamChunk::Usage { usage })).await;
                }
                let _ = tx.send(Ok(StreamChunk::Done)).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn count_tokens(&self, req: GenerateRequest) -> Result<u32, ProviderError> {
        let model = self.model_for(&req);
        let payload = GeminiCountTokensRequest {
            contents: req.contents.iter().map(GeminiContent::from).collect(),
        };

        let response = self
            .client
            .post(self.endpoint(&model, "countTokens"))
            .query(&[("key", self.config.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::parse_error_response(status, response).await);
        }

        let body: GeminiCountTokensResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;
        Ok(body.total_tokens)
    }
}

/// Concatenate answer parts and reasoning parts separately, in array order.
fn split_parts(parts: Vec<GeminiPart>) -> (String, String) {
    let mut content = String::new();
    let mut thoughts = String::new();
    for part in parts {
        if part.thought {
            thoughts.push_str(&part.text);
        } else {
            content.push_str(&part.text);
        }
    }
    (content, thoughts)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerateRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
}

#[derive(Debug, Serialize)]
struct GeminiCountTokensRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCountTokensResponse {
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

impl From<&Turn> for GeminiContent {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role.as_str().to_string(),
            parts: vec![GeminiPart::text(turn.text.clone())],
        }
    }
}

#[derive(Debug, Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    thought: bool,
}

impl GeminiPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            thought: false,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<GeminiThinkingConfig>,
}

impl From<&GenerationConfig> for GeminiGenerationConfig {
    fn from(config: &GenerationConfig) -> Self {
        let thinking_config = (config.include_thoughts || config.thinking_budget.is_some())
            .then_some(GeminiThinkingConfig {
                include_thoughts: config.include_thoughts,
                thinking_budget: config.thinking_budget,
            });

        Self {
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            thinking_config,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiThinkingConfig {
    include_thoughts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_budget: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerateResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiCandidateContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorEnvelope {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
}
