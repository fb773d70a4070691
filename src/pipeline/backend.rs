//! Vision model backends: one request in, one chat-completions response out.
//!
//! A backend only moves bytes. It never interprets the answer text; that is
//! [`crate::pipeline::extract`]'s job. Two implementations ship:
//!
//! * [`AzureOpenAiBackend`]: direct REST call to an Azure OpenAI deployment
//!   (`/openai/deployments/{name}/chat/completions`).
//! * [`ProviderBackend`]: any `edgequake-llm` provider (OpenAI, Anthropic,
//!   Gemini, Ollama, …), with its reply reshaped into the same response type.
//!
//! Neither retries. One failed attempt is one [`ExtractionFailure`].

use crate::config::AzureSettings;
use crate::error::{ExtractionFailure, Pdf2SheetError};
use crate::output::Usage;
use crate::pipeline::encode::EncodedImage;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Azure OpenAI REST API version used for chat completions.
pub const AZURE_API_VERSION: &str = "2024-02-15-preview";

/// Longest slice of an error body kept in a failure message.
const ERROR_BODY_LIMIT: usize = 500;

/// One page to read: instruction text plus the encoded image.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub prompt: String,
    pub image: EncodedImage,
    pub max_tokens: u32,
    pub temperature: f32,
}

// ── Wire format ──────────────────────────────────────────────────────────

/// Chat-completions request body.
#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<WireMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ChatRequest {
    /// A single user turn: the prompt text followed by the image.
    pub fn from_vision(request: &VisionRequest) -> Self {
        Self {
            messages: vec![WireMessage {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: request.prompt.clone(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: request.image.data_url(),
                        },
                    },
                ],
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }
}

/// Chat-completions response body. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub message: ChoiceMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatResponse {
    /// Response carrying one answer.
    pub fn single(content: impl Into<String>, usage: Usage) -> Self {
        Self {
            choices: vec![Choice {
                message: ChoiceMessage {
                    content: Some(content.into()),
                },
            }],
            usage: Some(usage),
        }
    }

    /// The first choice's content, if there is one.
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }
}

// ── Backend trait ────────────────────────────────────────────────────────

/// Sends one vision request to a model endpoint.
///
/// Implementations must be `Send + Sync`: pages are extracted concurrently.
/// A response that arrives, whatever its content, is `Ok`; only transport
/// errors and non-success statuses are `Err`.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    /// Short label for logs ("azure:gpt-4o", "openai:gpt-4.1-nano", …).
    fn name(&self) -> &str;

    async fn complete(&self, request: &VisionRequest) -> Result<ChatResponse, ExtractionFailure>;
}

// ── Azure OpenAI ─────────────────────────────────────────────────────────

/// Direct HTTP backend for an Azure OpenAI vision deployment.
pub struct AzureOpenAiBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
    label: String,
}

impl AzureOpenAiBackend {
    pub fn new(settings: &AzureSettings, timeout: Duration) -> Result<Self, Pdf2SheetError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Pdf2SheetError::Internal(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: chat_url(&settings.endpoint, &settings.deployment),
            api_key: settings.api_key.clone(),
            label: format!("azure:{}", settings.deployment),
        })
    }
}

/// Chat-completions URL for a deployment.
pub fn chat_url(endpoint: &str, deployment: &str) -> String {
    format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        endpoint.trim_end_matches('/'),
        deployment,
        AZURE_API_VERSION
    )
}

#[async_trait]
impl VisionBackend for AzureOpenAiBackend {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, request: &VisionRequest) -> Result<ChatResponse, ExtractionFailure> {
        let body = ChatRequest::from_vision(request);

        let response = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExtractionFailure::transport(format!("Request timed out: {}", e))
                } else {
                    ExtractionFailure::transport(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExtractionFailure::transport(format!("Reading response failed: {}", e)))?;

        if !status.is_success() {
            return Err(ExtractionFailure::service(format!(
                "HTTP {}: {}",
                status,
                truncate(&text, ERROR_BODY_LIMIT)
            )));
        }

        debug!("{}: {} bytes response", self.label, text.len());
        parse_response(&text)
    }
}

/// Decode a chat-completions body.
pub fn parse_response(body: &str) -> Result<ChatResponse, ExtractionFailure> {
    serde_json::from_str(body).map_err(|e| {
        ExtractionFailure::service(format!(
            "Unreadable response body ({}): {}",
            e,
            truncate(body, ERROR_BODY_LIMIT)
        ))
    })
}

fn truncate(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ── edgequake-llm providers ──────────────────────────────────────────────

/// Backend over any `edgequake-llm` provider.
pub struct ProviderBackend {
    provider: Arc<dyn LLMProvider>,
    label: String,
}

impl ProviderBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        Self {
            provider,
            label: label.into(),
        }
    }
}

#[async_trait]
impl VisionBackend for ProviderBackend {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, request: &VisionRequest) -> Result<ChatResponse, ExtractionFailure> {
        // `detail: "high"` keeps small print legible for GPT-4-class models.
        let image = ImageData::new(request.image.base64.clone(), request.image.mime_type)
            .with_detail("high");
        let messages = vec![ChatMessage::user_with_images(
            request.prompt.as_str(),
            vec![image],
        )];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens as usize),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| ExtractionFailure::service(format!("{}: {}", self.label, e)))?;

        let usage = Usage {
            prompt_tokens: response.prompt_tokens as u64,
            completion_tokens: response.completion_tokens as u64,
            total_tokens: (response.prompt_tokens + response.completion_tokens) as u64,
        };

        if response.content.trim().is_empty() {
            return Ok(ChatResponse {
                choices: Vec::new(),
                usage: Some(usage),
            });
        }
        Ok(ChatResponse::single(response.content, usage))
    }
}
