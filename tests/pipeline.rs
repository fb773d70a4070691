//! Pipeline tests with a fake renderer and a scripted vision backend.
//!
//! The fake renderer writes real PNGs whose first pixel encodes the page
//! number; the scripted backend decodes the image it receives to decide
//! what to answer. No pdfium and no network are involved.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_pdf2sheet::error::ErrorKind;
use edgequake_pdf2sheet::pipeline::input::document_stem;
use edgequake_pdf2sheet::pipeline::render::save_page_image;
use edgequake_pdf2sheet::run::inspect_with;
use edgequake_pdf2sheet::{
    render_single_page, run, run_sync, sheet, Cell, ChatResponse, ExtractedFields,
    ExtractionConfig, ExtractionFailure, ExtractionOutcome, ExtractionProgressCallback,
    FailureKind, PageImage, PageRenderer, Pdf2SheetError, Stage, Usage, VisionBackend,
    VisionRequest,
};
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Fakes ────────────────────────────────────────────────────────────────

struct FakeRenderer {
    pages: usize,
}

impl FakeRenderer {
    fn page(&self, document: &Path, page: usize, out_dir: &Path) -> Result<PageImage, Pdf2SheetError> {
        if page == 0 || page > self.pages {
            return Err(Pdf2SheetError::PageNotFound {
                page,
                total: self.pages,
            });
        }
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(24, 32, Rgb([page as u8, 200, 200])));
        save_page_image(&img, out_dir, &document_stem(document), page)
    }
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    async fn page_count(&self, _document: &Path) -> Result<usize, Pdf2SheetError> {
        Ok(self.pages)
    }

    async fn render(&self, document: &Path, out_dir: &Path) -> Result<Vec<PageImage>, Pdf2SheetError> {
        (1..=self.pages)
            .map(|p| self.page(document, p, out_dir))
            .collect()
    }

    async fn render_page(
        &self,
        document: &Path,
        page: usize,
        out_dir: &Path,
    ) -> Result<PageImage, Pdf2SheetError> {
        self.page(document, page, out_dir)
    }
}

/// Renderer whose `render` fails the way a damaged or locked PDF does.
enum BrokenRenderer {
    Corrupt,
    Locked,
}

#[async_trait]
impl PageRenderer for BrokenRenderer {
    async fn page_count(&self, document: &Path) -> Result<usize, Pdf2SheetError> {
        Err(self.error(document))
    }

    async fn render(&self, document: &Path, _out_dir: &Path) -> Result<Vec<PageImage>, Pdf2SheetError> {
        Err(self.error(document))
    }

    async fn render_page(
        &self,
        document: &Path,
        _page: usize,
        _out_dir: &Path,
    ) -> Result<PageImage, Pdf2SheetError> {
        Err(self.error(document))
    }
}

impl BrokenRenderer {
    fn error(&self, document: &Path) -> Pdf2SheetError {
        let path = document.to_path_buf();
        match self {
            BrokenRenderer::Corrupt => Pdf2SheetError::CorruptPdf {
                path,
                detail: "trailer not found".into(),
            },
            BrokenRenderer::Locked => Pdf2SheetError::PasswordRequired { path },
        }
    }
}

/// Renderer that skips page 2 of a three-page document.
struct GappyRenderer;

#[async_trait]
impl PageRenderer for GappyRenderer {
    async fn page_count(&self, _document: &Path) -> Result<usize, Pdf2SheetError> {
        Ok(3)
    }

    async fn render(&self, document: &Path, out_dir: &Path) -> Result<Vec<PageImage>, Pdf2SheetError> {
        let pages = FakeRenderer { pages: 3 };
        Ok(vec![
            pages.page(document, 1, out_dir)?,
            pages.page(document, 3, out_dir)?,
        ])
    }

    async fn render_page(
        &self,
        document: &Path,
        page: usize,
        out_dir: &Path,
    ) -> Result<PageImage, Pdf2SheetError> {
        FakeRenderer { pages: 3 }.page(document, page, out_dir)
    }
}

#[derive(Clone)]
enum Reply {
    Answer(String),
    Fail(ExtractionFailure),
    NoChoices,
}

#[derive(Default)]
struct ScriptedBackend {
    replies: HashMap<usize, Reply>,
    delays_ms: HashMap<usize, u64>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn answer(mut self, page: usize, content: impl Into<String>) -> Self {
        self.replies.insert(page, Reply::Answer(content.into()));
        self
    }

    fn fail(mut self, page: usize, failure: ExtractionFailure) -> Self {
        self.replies.insert(page, Reply::Fail(failure));
        self
    }

    fn no_choices(mut self, page: usize) -> Self {
        self.replies.insert(page, Reply::NoChoices);
        self
    }

    fn delay(mut self, page: usize, ms: u64) -> Self {
        self.delays_ms.insert(page, ms);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Page number the fake renderer stamped into the first pixel.
fn page_of(request: &VisionRequest) -> usize {
    let bytes = STANDARD.decode(&request.image.base64).expect("base64");
    let img = image::load_from_memory(&bytes).expect("png").to_rgb8();
    img.get_pixel(0, 0)[0] as usize
}

#[async_trait]
impl VisionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &VisionRequest) -> Result<ChatResponse, ExtractionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());

        let page = page_of(request);
        if let Some(ms) = self.delays_ms.get(&page) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let usage = Usage {
            prompt_tokens: 100,
            completion_tokens: 10,
            total_tokens: 110,
        };
        match self.replies.get(&page).cloned() {
            Some(Reply::Answer(text)) => Ok(ChatResponse::single(text, usage)),
            Some(Reply::Fail(f)) => Err(f),
            Some(Reply::NoChoices) => Ok(ChatResponse {
                choices: Vec::new(),
                usage: Some(usage),
            }),
            None => Ok(ChatResponse::single("{}", usage)),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

struct Workspace {
    dir: tempfile::TempDir,
    document: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let document = dir.path().join("scan.pdf");
        std::fs::write(&document, b"%PDF-1.7\n% fake body\n").expect("write pdf");
        Self { dir, document }
    }

    fn output(&self) -> PathBuf {
        self.dir.path().join("output/resultat.xlsx")
    }

    fn config(&self, pages: usize, backend: Arc<ScriptedBackend>) -> ExtractionConfig {
        ExtractionConfig::builder()
            .images_dir(self.dir.path().join("images"))
            .output_path(self.output())
            .renderer(Arc::new(FakeRenderer { pages }))
            .backend(backend)
            .build()
            .expect("config")
    }
}

fn invoice_a() -> String {
    json!({"type_document": "invoice", "date": "2024-01-01", "montant": "100"}).to_string()
}

fn receipt_b() -> String {
    json!({"type_document": "receipt", "date": "2024-01-02", "montant": "50"}).to_string()
}

fn text(s: &str) -> Cell {
    Cell::Text(s.to_string())
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_pages_become_two_rows() {
    let ws = Workspace::new();
    let backend = Arc::new(ScriptedBackend::default().answer(1, invoice_a()).answer(2, receipt_b()));
    let config = ws.config(2, backend.clone());

    let manifest = run(&ws.document, None, "Analyse", &config).await.expect("run");

    assert_eq!(manifest.pages.len(), 2);
    assert!(manifest.pages.iter().all(|p| p.outcome.is_valid()));
    assert_eq!(manifest.table_path, ws.output());
    assert_eq!(manifest.stats.rows_appended, 2);
    assert_eq!(manifest.stats.total_prompt_tokens, 200);
    assert_eq!(backend.calls(), 2);
    for page in &manifest.pages {
        assert!(page.image.path.exists());
        assert_eq!(page.image.filename, format!("scan_page_{:03}.png", page.page));
    }

    let table = sheet::load_table(&ws.output()).expect("load");
    assert_eq!(table.len(), 3);
    let rows = table.rows();
    assert_eq!(rows[0][0], text("Page"));
    assert_eq!(rows[1][0], Cell::Number(1.0));
    assert_eq!(rows[1][1], text("invoice"));
    assert_eq!(rows[1][2], text("2024-01-01"));
    assert_eq!(rows[1][3], text("100"));
    assert_eq!(rows[2][0], Cell::Number(2.0));
    assert_eq!(rows[2][1], text("receipt"));
    assert_eq!(rows[2][2], text("2024-01-02"));
    assert_eq!(rows[2][3], text("50"));
    for row in &rows[1..] {
        assert!(matches!(&row[10], Cell::Text(s) if !s.is_empty()));
    }
}

#[tokio::test]
async fn failed_page_still_gets_a_row() {
    let ws = Workspace::new();
    let backend = Arc::new(
        ScriptedBackend::default()
            .answer(1, invoice_a())
            .fail(2, ExtractionFailure::transport("connection refused"))
            .answer(3, receipt_b()),
    );
    let config = ws.config(3, backend);

    let manifest = run(&ws.document, None, "Analyse", &config).await.expect("run");

    assert_eq!(manifest.pages.len(), 3);
    assert!(manifest.pages[0].outcome.is_success());
    assert_eq!(
        manifest.pages[1].outcome.failure().map(|f| f.kind),
        Some(FailureKind::TransportError)
    );
    assert!(manifest.pages[2].outcome.is_success());
    assert_eq!(manifest.stats.failed_pages, 1);
    assert_eq!(manifest.failed_pages().count(), 1);

    let table = sheet::load_table(&ws.output()).unwrap();
    assert_eq!(table.len(), 4);
    let failed_row = &table.rows()[2];
    assert_eq!(failed_row[0], Cell::Number(2.0));
    assert!(failed_row[1..8].iter().all(Cell::is_empty));
    assert!(matches!(&failed_row[8], Cell::Text(s) if s.contains("transport_error")));
}

#[tokio::test]
async fn rerun_appends_without_deduplicating() {
    let ws = Workspace::new();
    let backend = Arc::new(ScriptedBackend::default().answer(1, invoice_a()).answer(2, receipt_b()));
    let config = ws.config(2, backend);

    run(&ws.document, None, "Analyse", &config).await.expect("first run");
    let first = sheet::load_table(&ws.output()).unwrap();

    let output = ws.output();
    run(&ws.document, Some(&output), "Analyse", &config)
        .await
        .expect("second run");
    let second = sheet::load_table(&ws.output()).unwrap();

    assert_eq!(second.len(), 5);
    assert_eq!(&second.rows()[..3], first.rows());
    assert_eq!(second.rows()[3][0], Cell::Number(1.0));
    assert_eq!(second.rows()[4][0], Cell::Number(2.0));
    assert_eq!(second.rows()[4][1], text("receipt"));
}

#[tokio::test]
async fn missing_document_fails_before_any_call() {
    let ws = Workspace::new();
    let backend = Arc::new(ScriptedBackend::default());
    let config = ws.config(2, backend.clone());

    let err = run(&ws.dir.path().join("absent.pdf"), None, "Analyse", &config)
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Rendering);
    assert_eq!(err.source.kind(), ErrorKind::NotFound);
    assert_eq!(backend.calls(), 0);
    assert!(!ws.output().exists());
}

#[tokio::test]
async fn missing_document_is_reported_before_backend_resolution() {
    let ws = Workspace::new();
    // No backend and an unknown provider: resolving one would fail at Setup.
    let config = ExtractionConfig::builder()
        .images_dir(ws.dir.path().join("images"))
        .output_path(ws.output())
        .renderer(Arc::new(FakeRenderer { pages: 1 }))
        .provider_name("no-such-provider")
        .build()
        .expect("config");

    let err = run(&ws.dir.path().join("absent.pdf"), None, "Analyse", &config)
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Rendering);
    assert_eq!(err.source.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn renderer_failure_aborts_before_extraction() {
    for renderer in [BrokenRenderer::Corrupt, BrokenRenderer::Locked] {
        let ws = Workspace::new();
        let backend = Arc::new(ScriptedBackend::default());
        let config = ExtractionConfig {
            renderer: Some(Arc::new(renderer)),
            ..ws.config(2, backend.clone())
        };

        let err = run(&ws.document, None, "Analyse", &config)
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Rendering);
        assert_eq!(err.source.kind(), ErrorKind::Render);
        assert!(err.pages.is_empty());
        assert_eq!(backend.calls(), 0);
        assert!(!ws.output().exists());
    }
}

#[tokio::test]
async fn renderer_skipping_a_page_is_rejected() {
    let ws = Workspace::new();
    let backend = Arc::new(ScriptedBackend::default());
    let config = ExtractionConfig {
        renderer: Some(Arc::new(GappyRenderer)),
        ..ws.config(3, backend.clone())
    };

    let err = run(&ws.document, None, "Analyse", &config)
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Rendering);
    assert_eq!(err.source.kind(), ErrorKind::Internal);
    assert_eq!(backend.calls(), 0);
    assert!(!ws.output().exists());
}

#[tokio::test]
async fn missing_existing_table_is_setup_failure() {
    let ws = Workspace::new();
    let backend = Arc::new(ScriptedBackend::default());
    let config = ws.config(1, backend.clone());
    let table = ws.dir.path().join("nope.xlsx");

    let err = run(&ws.document, Some(&table), "Analyse", &config)
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Setup);
    assert_eq!(err.source.kind(), ErrorKind::NotFound);
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn page_order_survives_out_of_order_completion() {
    let ws = Workspace::new();
    let mut backend = ScriptedBackend::default();
    for page in 1..=5 {
        backend = backend
            .answer(page, json!({"numero_document": format!("N-{page}")}).to_string())
            .delay(page, (6 - page as u64) * 30);
    }
    let backend = Arc::new(backend);
    let config = ExtractionConfig {
        concurrency: 5,
        ..ws.config(5, backend.clone())
    };

    let manifest = run(&ws.document, None, "Analyse", &config).await.expect("run");

    let pages: Vec<usize> = manifest.pages.iter().map(|p| p.page).collect();
    assert_eq!(pages, vec![1, 2, 3, 4, 5]);
    assert!(backend.max_in_flight.load(Ordering::SeqCst) > 1);

    let table = sheet::load_table(&ws.output()).unwrap();
    for (i, row) in table.data_rows().iter().enumerate() {
        assert_eq!(row[0], Cell::Number((i + 1) as f64));
        assert_eq!(row[7], Cell::Text(format!("N-{}", i + 1)));
    }
}

#[tokio::test]
async fn concurrency_bounds_calls_in_flight() {
    let ws = Workspace::new();
    let mut backend = ScriptedBackend::default();
    for page in 1..=6 {
        backend = backend.delay(page, 20);
    }
    let backend = Arc::new(backend);
    let config = ExtractionConfig {
        concurrency: 2,
        ..ws.config(6, backend.clone())
    };

    run(&ws.document, None, "Analyse", &config).await.expect("run");

    assert_eq!(backend.calls(), 6);
    assert!(backend.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn empty_document_writes_header_only_table() {
    let ws = Workspace::new();
    let backend = Arc::new(ScriptedBackend::default());
    let config = ws.config(0, backend.clone());

    let manifest = run(&ws.document, None, "Analyse", &config).await.expect("run");

    assert!(manifest.pages.is_empty());
    assert_eq!(backend.calls(), 0);
    let table = sheet::load_table(&ws.output()).unwrap();
    assert_eq!(table.len(), 1);
}

#[tokio::test]
async fn prose_and_empty_answers_are_classified() {
    let ws = Workspace::new();
    let backend = Arc::new(
        ScriptedBackend::default()
            .answer(1, "An invoice from ACME, total 100 EUR.")
            .no_choices(2)
            .fail(3, ExtractionFailure::service("HTTP 429 Too Many Requests")),
    );
    let config = ws.config(3, backend);

    let manifest = run(&ws.document, None, "Analyse", &config).await.expect("run");

    match &manifest.pages[0].outcome {
        ExtractionOutcome::Success {
            fields: ExtractedFields::RawText(t),
            ..
        } => assert!(t.contains("ACME")),
        other => panic!("expected raw text, got {other:?}"),
    }
    assert!(!manifest.pages[0].outcome.is_valid());
    assert_eq!(
        manifest.pages[1].outcome.failure().map(|f| f.kind),
        Some(FailureKind::EmptyResponse)
    );
    assert_eq!(
        manifest.pages[2].outcome.failure().map(|f| f.kind),
        Some(FailureKind::ServiceError)
    );

    let table = sheet::load_table(&ws.output()).unwrap();
    assert!(matches!(&table.rows()[1][8], Cell::Text(s) if s.contains("raw_text")));
    assert!(matches!(&table.rows()[2][8], Cell::Text(s) if s.contains("empty_response")));
}

#[tokio::test]
async fn unwritable_output_is_aggregation_failure_with_pages() {
    let ws = Workspace::new();
    let backend = Arc::new(ScriptedBackend::default().answer(1, invoice_a()));
    let blocked = ws.dir.path().join("blocked.xlsx");
    std::fs::create_dir_all(blocked.join("inner")).unwrap();
    let config = ExtractionConfig {
        output_path: blocked,
        ..ws.config(2, backend.clone())
    };

    let err = run(&ws.document, None, "Analyse", &config).await.unwrap_err();

    assert_eq!(err.stage, Stage::Aggregation);
    assert_eq!(err.source.kind(), ErrorKind::Aggregation);
    assert_eq!(err.pages.len(), 2);
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn structured_flag_wraps_prompt() {
    let ws = Workspace::new();
    let backend = Arc::new(ScriptedBackend::default());
    let config = ExtractionConfig {
        structured: true,
        ..ws.config(1, backend.clone())
    };

    run(&ws.document, None, "Lis la facture.", &config).await.expect("run");

    let prompts = backend.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].starts_with("Lis la facture."));
    assert!(prompts[0].contains("numero_document"));
}

#[derive(Default)]
struct Events {
    total: AtomicUsize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    succeeded: AtomicUsize,
}

impl ExtractionProgressCallback for Events {
    fn on_run_start(&self, total_pages: usize) {
        self.total.store(total_pages, Ordering::SeqCst);
    }
    fn on_page_complete(&self, _page: usize, _total: usize, _fields: usize) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_page_error(&self, _page: usize, _total: usize, _error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
    fn on_run_complete(&self, _total: usize, success_count: usize) {
        self.succeeded.store(success_count, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn progress_events_follow_outcomes() {
    let ws = Workspace::new();
    let backend = Arc::new(ScriptedBackend::default().fail(2, ExtractionFailure::transport("reset")));
    let events = Arc::new(Events::default());
    let config = ExtractionConfig {
        progress_callback: Some(events.clone() as Arc<dyn ExtractionProgressCallback>),
        ..ws.config(3, backend)
    };

    run(&ws.document, None, "Analyse", &config).await.expect("run");

    assert_eq!(events.total.load(Ordering::SeqCst), 3);
    assert_eq!(events.completed.load(Ordering::SeqCst), 2);
    assert_eq!(events.errors.load(Ordering::SeqCst), 1);
    assert_eq!(events.succeeded.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn single_page_render_and_inspection() {
    let ws = Workspace::new();
    let config = ws.config(3, Arc::new(ScriptedBackend::default()));

    let image = render_single_page(&ws.document, 2, &config).await.expect("render");
    assert_eq!(image.page, 2);
    assert!(image.path.ends_with("scan_page_002.png"));
    assert!(image.path.exists());

    let err = render_single_page(&ws.document, 4, &config).await.unwrap_err();
    assert!(matches!(err, Pdf2SheetError::PageNotFound { page: 4, total: 3 }));

    let info = inspect_with(&FakeRenderer { pages: 3 }, &ws.document)
        .await
        .expect("inspect");
    assert_eq!(info.page_count, 3);
    assert!(info.file_size > 0);
}

#[test]
fn blocking_wrapper_runs_pipeline() {
    let ws = Workspace::new();
    let backend = Arc::new(ScriptedBackend::default().answer(1, invoice_a()));
    let config = ws.config(1, backend);

    let manifest = run_sync(&ws.document, None, "Analyse", &config).expect("run");
    assert_eq!(manifest.pages.len(), 1);
    assert_eq!(sheet::load_table(&ws.output()).unwrap().len(), 2);
}
