//! # edgequake-pdf2sheet
//!
//! Extract structured fields from scanned documents (invoices, receipts,
//! statements) with a Vision Language Model and append them to a
//! spreadsheet, one row per page.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      check the document (and optional existing table)
//!  ├─ 2. Render     rasterise every page at 300 DPI to images/{stem}_page_NNN.png
//!  ├─ 3. Extract    concurrent vision calls, one per page (Azure OpenAI / edgequake-llm)
//!  ├─ 4. Normalise  JSON object → fields, anything else → raw text, errors → failure
//!  └─ 5. Aggregate  append one row per page to the .xlsx table, in page order
//! ```
//!
//! A page whose extraction fails still gets a row (blank fields plus the
//! error in "Autres Informations"). Only rendering and table errors abort
//! a run.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2sheet::{run, ExtractionConfig, DEFAULT_ANALYSIS_PROMPT};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Backend from AZURE_AI_ENDPOINT / AZURE_AI_API_KEY, or OPENAI_API_KEY, …
//!     let config = ExtractionConfig::builder()
//!         .output_path("output/invoices.xlsx")
//!         .structured(true)
//!         .build()?;
//!     let manifest = run(Path::new("invoices.pdf"), None, DEFAULT_ANALYSIS_PROMPT, &config).await?;
//!     for page in &manifest.pages {
//!         println!("page {}: success={}", page.page, page.outcome.is_success());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2sheet` binary (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod run;
pub mod sheet;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{AzureSettings, ExtractionConfig, ExtractionConfigBuilder};
pub use error::{ErrorKind, ExtractionFailure, FailureKind, Pdf2SheetError, RunError, Stage};
pub use output::{
    DocumentInfo, ExtractedFields, ExtractionOutcome, Manifest, PageImage, PageResult, RunStats,
    Usage,
};
pub use pipeline::aggregate::{Cell, Table, COLUMNS};
pub use pipeline::backend::{AzureOpenAiBackend, ChatResponse, ProviderBackend, VisionBackend, VisionRequest};
pub use pipeline::extract::ExtractionClient;
pub use pipeline::render::{PageRenderer, PdfiumRenderer};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use prompts::{structured_prompt, DEFAULT_ANALYSIS_PROMPT};
pub use run::{inspect, render_single_page, run, run_sync};
