//! Error types for the edgequake-pdf2sheet library.
//!
//! Three types reflect three failure modes:
//!
//! * [`Pdf2SheetError`] (fatal): the run cannot proceed (missing input,
//!   unreadable PDF, unwritable output table, no model configured).
//!
//! * [`ExtractionFailure`] (per page): one page's model call failed.
//!   Stored inside [`crate::output::ExtractionOutcome::Failure`] so the other
//!   pages of the document still reach the table.
//!
//! * [`RunError`]: how an aborted run ended. It names the [`Stage`] that
//!   failed and carries the fatal cause plus any page results already
//!   produced.

use crate::output::PageResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdf2sheet library.
#[derive(Debug, Error)]
pub enum Pdf2SheetError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("File not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Rendering errors ──────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// Requested page does not exist in the document.
    #[error("Page {page} not found (document has {total} pages)")]
    PageNotFound { page: usize, total: usize },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// A rendered page could not be written to the images directory.
    #[error("Failed to write page image '{path}': {detail}")]
    ImageWriteFailed { path: PathBuf, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Table errors ──────────────────────────────────────────────────────
    /// An existing table could not be opened or parsed.
    #[error("Failed to read table '{path}': {detail}")]
    TableReadFailed { path: PathBuf, detail: String },

    /// The output table could not be written.
    #[error("Failed to write table '{path}': {detail}")]
    TableWriteFailed { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// No vision backend could be resolved (missing endpoint, API key …).
    #[error("Vision backend '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`Pdf2SheetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing input document or table.
    NotFound,
    /// Malformed, unsupported or locked document.
    Render,
    /// Output table not readable or writable.
    Aggregation,
    /// Missing or invalid configuration.
    Config,
    /// Anything else.
    Internal,
}

impl Pdf2SheetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Pdf2SheetError::FileNotFound { .. } | Pdf2SheetError::PermissionDenied { .. } => {
                ErrorKind::NotFound
            }
            Pdf2SheetError::NotAPdf { .. }
            | Pdf2SheetError::CorruptPdf { .. }
            | Pdf2SheetError::PasswordRequired { .. }
            | Pdf2SheetError::WrongPassword { .. }
            | Pdf2SheetError::PageNotFound { .. }
            | Pdf2SheetError::RasterisationFailed { .. }
            | Pdf2SheetError::ImageWriteFailed { .. }
            | Pdf2SheetError::PdfiumBindingFailed(_) => ErrorKind::Render,
            Pdf2SheetError::TableReadFailed { .. } | Pdf2SheetError::TableWriteFailed { .. } => {
                ErrorKind::Aggregation
            }
            Pdf2SheetError::ProviderNotConfigured { .. } | Pdf2SheetError::InvalidConfig(_) => {
                ErrorKind::Config
            }
            Pdf2SheetError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Why a single page's extraction call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error, unreachable endpoint, or the per-call deadline expired.
    TransportError,
    /// The endpoint answered with a non-success status or an unreadable body.
    ServiceError,
    /// The endpoint answered without any choice to read.
    EmptyResponse,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransportError => "transport_error",
            FailureKind::ServiceError => "service_error",
            FailureKind::EmptyResponse => "empty_response",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal error for one page's extraction call.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ExtractionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExtractionFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::TransportError,
            message: message.into(),
        }
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::ServiceError,
            message: message.into(),
        }
    }

    pub fn empty(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::EmptyResponse,
            message: message.into(),
        }
    }
}

/// The pipeline stage at which a run aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Pre-flight: backend resolution, table path checks.
    Setup,
    /// Rasterising the document.
    Rendering,
    /// Writing rows to the output table.
    Aggregation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Setup => "setup",
            Stage::Rendering => "rendering",
            Stage::Aggregation => "aggregation",
        };
        f.write_str(s)
    }
}

/// Terminal failure of a run.
///
/// `pages` is empty unless the run failed at [`Stage::Aggregation`], in which
/// case it holds every page's extraction result in page order.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct RunError {
    pub stage: Stage,
    #[source]
    pub source: Pdf2SheetError,
    pub pages: Vec<PageResult>,
}

impl RunError {
    pub fn new(stage: Stage, source: Pdf2SheetError) -> Self {
        Self {
            stage,
            source,
            pages: Vec::new(),
        }
    }

    pub fn with_pages(mut self, pages: Vec<PageResult>) -> Self {
        self.pages = pages;
        self
    }
}
