//! End-to-end tests against real pdfium and a live vision model.
//!
//! These use PDF files in `./test_cases/` and make real API calls, so they
//! are gated behind the `E2E_ENABLED` environment variable.
//!
//! Run with:
//!   E2E_ENABLED=1 PDFIUM_LIB_PATH=/path/to/libpdfium cargo test --test e2e -- --nocapture
//!
//! The model is resolved like the CLI does: `AZURE_AI_*` first, then
//! `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, then auto-detection.

use edgequake_pdf2sheet::{
    inspect, render_single_page, run, sheet, ExtractionConfig, DEFAULT_ANALYSIS_PROMPT,
};
use std::path::PathBuf;

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

/// Skip unless E2E_ENABLED is set and the PDF at `path` exists.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP — set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP — test file not found: {}", p.display());
            return;
        }
        p
    }};
}

fn config_in(dir: &tempfile::TempDir) -> ExtractionConfig {
    ExtractionConfig::builder()
        .images_dir(dir.path().join("images"))
        .output_path(dir.path().join("output/resultat_traite.xlsx"))
        .concurrency(2)
        .build()
        .expect("config")
}

#[tokio::test]
async fn test_inspect_invoice() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("invoice.pdf"));

    let info = inspect(&pdf).await.expect("inspect");
    println!("{:?}", info);
    assert!(info.page_count >= 1);
    assert!(info.file_size > 0);
}

#[tokio::test]
async fn test_render_first_page() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("invoice.pdf"));
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);

    let image = render_single_page(&pdf, 1, &config).await.expect("render");
    println!("{:?}", image);
    assert!(image.path.exists());
    assert!(image.filename.ends_with("_page_001.png"));
    // 300 DPI: an A4 or Letter page is well over 2000 px tall.
    assert!(image.height > 2000, "height {}", image.height);
}

#[tokio::test]
async fn test_full_run_structured() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("invoice.pdf"));
    let dir = tempfile::tempdir().unwrap();
    let config = ExtractionConfig {
        structured: true,
        ..config_in(&dir)
    };

    let manifest = run(&pdf, None, DEFAULT_ANALYSIS_PROMPT, &config)
        .await
        .expect("run");
    println!("{}", serde_json::to_string_pretty(&manifest.stats).unwrap());

    assert!(!manifest.pages.is_empty());
    assert!(
        manifest.stats.succeeded_pages > 0,
        "every page failed: {:?}",
        manifest.failed_pages().collect::<Vec<_>>()
    );

    let table = sheet::load_table(&manifest.table_path).expect("load");
    assert_eq!(table.len(), manifest.pages.len() + 1);
}

#[tokio::test]
async fn test_multi_page_append_twice() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("receipts.pdf"));
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);

    let first = run(&pdf, None, DEFAULT_ANALYSIS_PROMPT, &config)
        .await
        .expect("first run");
    let second = run(&pdf, Some(&first.table_path), DEFAULT_ANALYSIS_PROMPT, &config)
        .await
        .expect("second run");

    let table = sheet::load_table(&second.table_path).expect("load");
    assert_eq!(table.len(), 1 + first.pages.len() + second.pages.len());
}
