//! Result types produced by a run.
//!
//! A run yields one [`PageResult`] per rendered page, in page order, wrapped
//! in a [`Manifest`] together with the location of the output table. Every
//! type here is `Serialize` so the CLI can print the manifest as JSON.

use crate::error::ExtractionFailure;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Keys that make an extraction "valid" for [`ExtractionOutcome::is_valid`].
pub const REQUIRED_FIELDS: [&str; 3] = ["type_document", "date", "montant"];

/// Key used when the model answered with free text instead of a JSON object.
pub const RAW_TEXT_KEY: &str = "raw_text";

/// One rasterised page written to the images directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    /// 1-indexed page number.
    pub page: usize,
    /// Full path of the PNG file.
    pub path: PathBuf,
    /// File name only (`{stem}_page_{NNN}.png`), for retrieval by name.
    pub filename: String,
    /// Size of the PNG file in bytes.
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
}

/// Fields read from one page.
///
/// The model is asked for JSON but may answer with prose; both shapes are
/// kept distinct so consumers can branch on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "value", rename_all = "snake_case")]
pub enum ExtractedFields {
    /// The answer parsed as a JSON object.
    Structured(Map<String, Value>),
    /// The answer was not a JSON object; the text is kept verbatim.
    RawText(String),
}

impl ExtractedFields {
    /// View the fields as a mapping. Raw text becomes `{"raw_text": …}`.
    pub fn to_map(&self) -> Map<String, Value> {
        match self {
            ExtractedFields::Structured(map) => map.clone(),
            ExtractedFields::RawText(text) => {
                let mut map = Map::new();
                map.insert(RAW_TEXT_KEY.to_string(), Value::String(text.clone()));
                map
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            ExtractedFields::Structured(map) => map.get(key),
            ExtractedFields::RawText(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ExtractedFields::Structured(map) => map.len(),
            ExtractedFields::RawText(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Token accounting reported by the model endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Outcome of one extraction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    Success {
        fields: ExtractedFields,
        /// The model's answer exactly as received.
        raw_response: String,
        usage: Usage,
    },
    Failure(ExtractionFailure),
}

impl ExtractionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExtractionOutcome::Success { .. })
    }

    /// Advisory check: a success whose fields contain at least
    /// `type_document`, `date` and `montant` (values may be empty).
    pub fn is_valid(&self) -> bool {
        match self {
            ExtractionOutcome::Success { fields, .. } => {
                let map = fields.to_map();
                REQUIRED_FIELDS.iter().all(|key| map.contains_key(*key))
            }
            ExtractionOutcome::Failure(_) => false,
        }
    }

    pub fn fields(&self) -> Option<&ExtractedFields> {
        match self {
            ExtractionOutcome::Success { fields, .. } => Some(fields),
            ExtractionOutcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ExtractionFailure> {
        match self {
            ExtractionOutcome::Success { .. } => None,
            ExtractionOutcome::Failure(f) => Some(f),
        }
    }

    pub fn usage(&self) -> Usage {
        match self {
            ExtractionOutcome::Success { usage, .. } => *usage,
            ExtractionOutcome::Failure(_) => Usage::default(),
        }
    }
}

/// A page image paired with its extraction outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-indexed page number (same as `image.page`).
    pub page: usize,
    pub image: PageImage,
    pub outcome: ExtractionOutcome,
    /// Wall-clock time of the extraction call.
    pub duration_ms: u64,
}

/// Basic facts about a document, read without rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub path: PathBuf,
    pub page_count: usize,
    pub file_size: u64,
}

/// Aggregate statistics for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_pages: usize,
    pub succeeded_pages: usize,
    pub failed_pages: usize,
    /// Successes that pass [`ExtractionOutcome::is_valid`].
    pub valid_pages: usize,
    pub rows_appended: usize,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub render_duration_ms: u64,
    pub extract_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Everything a caller needs after a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub document: PathBuf,
    /// One entry per page, in page order.
    pub pages: Vec<PageResult>,
    /// Where the table was persisted.
    pub table_path: PathBuf,
    pub stats: RunStats,
}

impl Manifest {
    pub fn failed_pages(&self) -> impl Iterator<Item = &PageResult> {
        self.pages.iter().filter(|p| !p.outcome.is_success())
    }
}
