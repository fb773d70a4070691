//! Per-page extraction: send one page image with a prompt and normalise the
//! model's answer into an [`ExtractionOutcome`].
//!
//! ## Normalisation
//!
//! | Response                         | Outcome                                   |
//! |----------------------------------|-------------------------------------------|
//! | transport error / deadline       | `Failure { TransportError }`              |
//! | non-success status               | `Failure { ServiceError }`                |
//! | no choice (or no content)        | `Failure { EmptyResponse }`               |
//! | answer is a JSON object          | `Success { Structured(map) }`             |
//! | anything else                    | `Success { RawText(answer) }`             |
//!
//! An answer that is not JSON is a success. Only the three failure rows are
//! failures. There is no retry: callers wanting resilience wrap [`ExtractionClient::extract`].

use crate::error::ExtractionFailure;
use crate::output::{ExtractedFields, ExtractionOutcome, PageImage};
use crate::pipeline::backend::{ChatResponse, VisionBackend, VisionRequest};
use crate::pipeline::encode::{encode_file, EncodedImage};
use crate::prompts::structured_prompt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Response-size hint sent with every request.
pub const MAX_TOKENS: u32 = 1000;

/// Sampling temperature sent with every request.
pub const TEMPERATURE: f32 = 0.7;

/// Extracts fields from page images through a [`VisionBackend`].
#[derive(Clone)]
pub struct ExtractionClient {
    backend: Arc<dyn VisionBackend>,
    call_timeout: Duration,
}

impl ExtractionClient {
    /// `call_timeout` bounds each request; expiry is a transport failure.
    pub fn new(backend: Arc<dyn VisionBackend>, call_timeout: Duration) -> Self {
        Self {
            backend,
            call_timeout,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Read `image` from disk and ask the model about it.
    pub async fn extract(&self, image: &PageImage, prompt: &str) -> ExtractionOutcome {
        let encoded = match encode_file(&image.path).await {
            Ok(e) => e,
            Err(e) => {
                return ExtractionOutcome::Failure(ExtractionFailure::transport(format!(
                    "Could not read page image '{}': {}",
                    image.path.display(),
                    e
                )))
            }
        };
        self.extract_encoded(encoded, prompt).await
    }

    /// [`Self::extract`] with the canonical structured-fields prompt around `instruction`.
    pub async fn extract_structured(&self, image: &PageImage, instruction: &str) -> ExtractionOutcome {
        self.extract(image, &structured_prompt(instruction)).await
    }

    /// Ask the model about an already-encoded image.
    pub async fn extract_encoded(&self, image: EncodedImage, prompt: &str) -> ExtractionOutcome {
        let request = VisionRequest {
            prompt: prompt.to_string(),
            image,
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        };

        match tokio::time::timeout(self.call_timeout, self.backend.complete(&request)).await {
            Err(_) => {
                warn!(
                    "{}: no response within {}s",
                    self.backend.name(),
                    self.call_timeout.as_secs()
                );
                ExtractionOutcome::Failure(ExtractionFailure::transport(format!(
                    "No response within {}s",
                    self.call_timeout.as_secs()
                )))
            }
            Ok(Err(failure)) => ExtractionOutcome::Failure(failure),
            Ok(Ok(response)) => normalize_response(response),
        }
    }
}

/// Turn a received response into an outcome.
pub fn normalize_response(response: ChatResponse) -> ExtractionOutcome {
    let usage = response.usage.unwrap_or_default();

    let content = match response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
    {
        Some(c) => c,
        None => {
            return ExtractionOutcome::Failure(ExtractionFailure::empty(
                "Model response contained no answer",
            ))
        }
    };

    let fields = parse_fields(&content);
    debug!(
        "Answer parsed as {}",
        match fields {
            ExtractedFields::Structured(_) => "structured fields",
            ExtractedFields::RawText(_) => "raw text",
        }
    );

    ExtractionOutcome::Success {
        fields,
        raw_response: content,
        usage,
    }
}

/// A JSON object becomes structured fields; everything else stays text.
///
/// A single surrounding Markdown code fence (```` ```json ````) is ignored.
pub fn parse_fields(content: &str) -> ExtractedFields {
    match serde_json::from_str::<Value>(strip_code_fence(content)) {
        Ok(Value::Object(map)) => ExtractedFields::Structured(map),
        _ => ExtractedFields::RawText(content.to_string()),
    }
}

static RE_CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\n(.*?)\n?```$").unwrap());

fn strip_code_fence(input: &str) -> &str {
    let trimmed = input.trim();
    match RE_CODE_FENCE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(m) => m.as_str(),
        None => trimmed,
    }
}
