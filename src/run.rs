//! Run orchestration: document → page images → extraction → table.
//!
//! ```text
//! Start ──▶ Rendered ──▶ Extracted ──▶ Aggregated ──▶ Done
//!   │          │                           │
//!   └──────────┴───────── Failed(stage, cause) ◀┘
//! ```
//!
//! Rendering and aggregation errors abort the run. Extraction errors never
//! do: each one becomes that page's `Failure` outcome and the page still
//! gets its row.

use crate::config::{AzureSettings, ExtractionConfig};
use crate::error::{Pdf2SheetError, RunError, Stage};
use crate::output::{DocumentInfo, ExtractionOutcome, Manifest, PageImage, PageResult, RunStats};
use crate::pipeline::aggregate::timestamp_now;
use crate::pipeline::backend::{AzureOpenAiBackend, ProviderBackend, VisionBackend};
use crate::pipeline::extract::ExtractionClient;
use crate::pipeline::input;
use crate::pipeline::render::{ensure_dir, PageRenderer, PdfiumRenderer};
use crate::prompts::structured_prompt;
use crate::sheet;
use edgequake_llm::ProviderFactory;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Model used with a named provider when none is configured.
const DEFAULT_PROVIDER_MODEL: &str = "gpt-4.1-nano";

/// Render `document`, extract every page with `prompt`, and append one row
/// per page to the table.
///
/// `table` is an existing table whose rows are carried over; the result is
/// written to `config.output_path` (which may be the same file). With
/// `config.structured` set, `prompt` is wrapped in the canonical field
/// instructions.
///
/// # Errors
/// A [`RunError`] naming the aborting [`Stage`]:
/// - `Rendering`: document missing, not a PDF, locked or unrenderable;
///   no extraction call has been made. The document is checked before
///   anything else.
/// - `Setup`: `table` given but missing, no vision backend configured
/// - `Aggregation`: table unreadable or output unwritable; `pages` holds
///   every extraction result
pub async fn run(
    document: &Path,
    table: Option<&Path>,
    prompt: &str,
    config: &ExtractionConfig,
) -> Result<Manifest, RunError> {
    let total_start = Instant::now();
    info!("Starting run: {}", document.display());

    let document = input::resolve_document(document)
        .map_err(|e| RunError::new(Stage::Rendering, e))?;

    // ── Setup ────────────────────────────────────────────────────────────
    let table = input::resolve_table(table).map_err(|e| RunError::new(Stage::Setup, e))?;
    let backend = resolve_backend(config).map_err(|e| RunError::new(Stage::Setup, e))?;
    let client = ExtractionClient::new(backend, Duration::from_secs(config.api_timeout_secs));
    debug!("Vision backend: {}", client.backend_name());

    // ── Rendering ────────────────────────────────────────────────────────
    let render_start = Instant::now();
    let images = render_document(&document, config)
        .await
        .map_err(|e| RunError::new(Stage::Rendering, e))?;
    let render_duration_ms = render_start.elapsed().as_millis() as u64;
    info!(
        "PDF loaded: {} pages rendered in {}ms",
        images.len(),
        render_duration_ms
    );

    // ── Extraction ───────────────────────────────────────────────────────
    let prompt = if config.structured {
        structured_prompt(prompt)
    } else {
        prompt.to_string()
    };

    let total_pages = images.len();
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_start(total_pages);
    }

    let extract_start = Instant::now();
    let pages = extract_pages(&client, images, &prompt, config).await;
    let extract_duration_ms = extract_start.elapsed().as_millis() as u64;

    let succeeded = pages.iter().filter(|p| p.outcome.is_success()).count();
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_complete(total_pages, succeeded);
    }

    // ── Aggregation ──────────────────────────────────────────────────────
    let written = match sheet::append_to_file(
        table.as_deref(),
        &config.output_path,
        &pages,
        timestamp_now(),
    )
    .await
    {
        Ok(t) => t,
        Err(e) => return Err(RunError::new(Stage::Aggregation, e).with_pages(pages)),
    };
    debug!("Table now has {} rows", written.len());

    let stats = RunStats {
        total_pages,
        succeeded_pages: succeeded,
        failed_pages: total_pages - succeeded,
        valid_pages: pages.iter().filter(|p| p.outcome.is_valid()).count(),
        rows_appended: pages.len(),
        total_prompt_tokens: pages.iter().map(|p| p.outcome.usage().prompt_tokens).sum(),
        total_completion_tokens: pages
            .iter()
            .map(|p| p.outcome.usage().completion_tokens)
            .sum(),
        render_duration_ms,
        extract_duration_ms,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };

    info!(
        "Run complete: {}/{} pages extracted, {} rows appended to {}, {}ms total",
        stats.succeeded_pages,
        stats.total_pages,
        stats.rows_appended,
        config.output_path.display(),
        stats.total_duration_ms
    );

    Ok(Manifest {
        document,
        pages,
        table_path: config.output_path.clone(),
        stats,
    })
}

/// Synchronous wrapper around [`run`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_sync(
    document: &Path,
    table: Option<&Path>,
    prompt: &str,
    config: &ExtractionConfig,
) -> Result<Manifest, RunError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| {
            RunError::new(
                Stage::Setup,
                Pdf2SheetError::Internal(format!("Failed to create tokio runtime: {}", e)),
            )
        })?
        .block_on(run(document, table, prompt, config))
}

/// Page count and file size, without rendering or any model call.
pub async fn inspect(document: &Path) -> Result<DocumentInfo, Pdf2SheetError> {
    inspect_with(&PdfiumRenderer::default(), document).await
}

/// [`inspect`] with a caller-chosen renderer.
pub async fn inspect_with(
    renderer: &dyn PageRenderer,
    document: &Path,
) -> Result<DocumentInfo, Pdf2SheetError> {
    let path = input::resolve_document(document)?;
    let file_size = std::fs::metadata(&path)
        .map(|m| m.len())
        .map_err(|_| Pdf2SheetError::FileNotFound { path: path.clone() })?;
    let page_count = renderer.page_count(&path).await?;

    Ok(DocumentInfo {
        path,
        page_count,
        file_size,
    })
}

/// Render one 1-indexed page into `config.images_dir`.
pub async fn render_single_page(
    document: &Path,
    page: usize,
    config: &ExtractionConfig,
) -> Result<PageImage, Pdf2SheetError> {
    let path = input::resolve_document(document)?;
    ensure_dir(&config.images_dir)?;
    renderer_for(config)
        .render_page(&path, page, &config.images_dir)
        .await
}

// ── Internal helpers ─────────────────────────────────────────────────────

fn renderer_for(config: &ExtractionConfig) -> Arc<dyn PageRenderer> {
    match config.renderer {
        Some(ref r) => Arc::clone(r),
        None => Arc::new(PdfiumRenderer::new(config.password.clone())),
    }
}

/// Render an already-checked document and verify pages come back as `1..=N`.
async fn render_document(
    document: &Path,
    config: &ExtractionConfig,
) -> Result<Vec<PageImage>, Pdf2SheetError> {
    ensure_dir(&config.images_dir)?;
    let images = renderer_for(config)
        .render(document, &config.images_dir)
        .await?;

    if let Some((i, img)) = images.iter().enumerate().find(|(i, img)| img.page != i + 1) {
        return Err(Pdf2SheetError::Internal(format!(
            "Renderer returned page {} at position {}",
            img.page,
            i + 1
        )));
    }
    Ok(images)
}

/// Extract every page with at most `config.concurrency` calls in flight.
///
/// Results land in a slot per page, so the returned order is page order
/// whatever order the calls complete in.
async fn extract_pages(
    client: &ExtractionClient,
    images: Vec<PageImage>,
    prompt: &str,
    config: &ExtractionConfig,
) -> Vec<PageResult> {
    let total_pages = images.len();
    let mut slots: Vec<Option<PageResult>> = (0..total_pages).map(|_| None).collect();

    let mut completions = stream::iter(images.into_iter().enumerate().map(|(slot, image)| {
        let client = client.clone();
        let callback = config.progress_callback.clone();
        let prompt = prompt.to_string();
        async move {
            let page = image.page;
            if let Some(ref cb) = callback {
                cb.on_page_start(page, total_pages);
            }

            let start = Instant::now();
            let outcome = client.extract(&image, &prompt).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match &outcome {
                ExtractionOutcome::Success { fields, .. } => {
                    debug!("Page {}/{}: {} fields", page, total_pages, fields.len());
                    if let Some(ref cb) = callback {
                        cb.on_page_complete(page, total_pages, fields.len());
                    }
                }
                ExtractionOutcome::Failure(failure) => {
                    warn!("Page {}/{} extraction failed: {}", page, total_pages, failure);
                    if let Some(ref cb) = callback {
                        cb.on_page_error(page, total_pages, &failure.to_string());
                    }
                }
            }

            (
                slot,
                PageResult {
                    page,
                    image,
                    outcome,
                    duration_ms,
                },
            )
        }
    }))
    .buffer_unordered(config.concurrency.max(1));

    while let Some((slot, result)) = completions.next().await {
        slots[slot] = Some(result);
    }

    slots.into_iter().flatten().collect()
}

/// Resolve the vision backend, from most-specific to least-specific.
///
/// 1. Pre-built backend (`config.backend`)
/// 2. Named edgequake-llm provider (`config.provider_name` + `config.model`)
/// 3. Azure OpenAI deployment from `AZURE_AI_*` variables
/// 4. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`
/// 5. `ProviderFactory::from_env` auto-detection
pub fn resolve_backend(config: &ExtractionConfig) -> Result<Arc<dyn VisionBackend>, Pdf2SheetError> {
    if let Some(ref backend) = config.backend {
        return Ok(Arc::clone(backend));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_PROVIDER_MODEL);
        return provider_backend(name, model);
    }

    let timeout = Duration::from_secs(config.api_timeout_secs);
    match AzureSettings::from_env() {
        Ok(settings) => {
            return Ok(Arc::new(AzureOpenAiBackend::new(&settings, timeout)?));
        }
        Err(e) => debug!("Azure backend unavailable: {}", e),
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return provider_backend(&prov, &model);
        }
    }

    let (llm, _embedding) =
        ProviderFactory::from_env().map_err(|e| Pdf2SheetError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No vision backend could be found in the environment.\n\
                Set AZURE_AI_ENDPOINT and AZURE_AI_API_KEY, or OPENAI_API_KEY, \
                or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;
    Ok(Arc::new(ProviderBackend::new(llm, "auto")))
}

fn provider_backend(name: &str, model: &str) -> Result<Arc<dyn VisionBackend>, Pdf2SheetError> {
    let llm = ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        Pdf2SheetError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{e}"),
        }
    })?;
    Ok(Arc::new(ProviderBackend::new(llm, format!("{}:{}", name, model))))
}
