//! CLI binary for edgequake-pdf2sheet.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ExtractionConfig`, runs the pipeline and prints the manifest.

use anyhow::{bail, Context, Result};
use clap::Parser;
use edgequake_pdf2sheet::{
    inspect, render_single_page, run, sheet, ExtractedFields, ExtractionConfig,
    ExtractionOutcome, ExtractionProgressCallback, Manifest, ProgressCallback,
    DEFAULT_ANALYSIS_PROMPT,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const SPINNER_TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per page. Pages may finish out of
/// order when several extraction calls are in flight.
struct CliProgressCallback {
    bar: ProgressBar,
    started: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner until `on_run_start` reports the page count.
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(SPINNER_TICKS),
        );
        bar.set_prefix("Rendering");
        bar.set_message("Rasterising pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            started: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, page: usize) -> f64 {
        self.started
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&page)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_pages: usize) {
        self.bar.set_length(total_pages as u64);
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} pages  \
                 ⏱ {elapsed_precise}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(SPINNER_TICKS),
        );
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting fields from {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page: usize, _total: usize) {
        self.started
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(page, Instant::now());
        self.bar.set_message(format!("page {page}"));
    }

    fn on_page_complete(&self, page: usize, total: usize, field_count: usize) {
        let secs = self.elapsed_secs(page);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<10}  {}",
            green("✓"),
            page,
            total,
            dim(&format!("{field_count:>2} fields")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(page);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            format!("{}…", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_pages: usize, success_count: usize) {
        self.bar.finish_and_clear();
        let failed = self.errors.load(Ordering::SeqCst);
        if failed == 0 {
            eprintln!(
                "{} {} pages extracted",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages extracted  ({} failed, rows still written)",
                if failed == total_pages { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract every page of a scan into the default table
  pdf2sheet invoices.pdf

  # Ask for the canonical invoice fields as JSON
  pdf2sheet --structured invoices.pdf -o output/invoices.xlsx

  # Append to an existing table (written to -o)
  pdf2sheet --table output/invoices.xlsx -o output/invoices.xlsx march.pdf

  # Use an edgequake-llm provider instead of Azure
  pdf2sheet --provider openai --model gpt-4.1-mini invoices.pdf

  # Page count only (no API key needed)
  pdf2sheet --inspect-only invoices.pdf

  # Render page 3 to the images directory, no extraction
  pdf2sheet --page 3 invoices.pdf

  # Create an empty table, or dump one as JSON
  pdf2sheet --init-template output/empty.xlsx
  pdf2sheet --read output/invoices.xlsx --json

  # Add extra columns to an existing table
  pdf2sheet --table output/invoices.xlsx --add-headers TVA,Projet

ENVIRONMENT VARIABLES:
  AZURE_AI_ENDPOINT         Azure OpenAI resource endpoint
  AZURE_AI_API_KEY          Azure OpenAI API key
  AZURE_AI_DEPLOYMENT_NAME  Vision deployment (default gpt-4-vision-preview)
  OPENAI_API_KEY            Used when no Azure settings are present
  EDGEQUAKE_LLM_PROVIDER    Provider for auto-detection (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL           Model for EDGEQUAKE_LLM_PROVIDER
  PDFIUM_LIB_PATH           Path to libpdfium (otherwise the system library)
  RUST_LOG                  Log filter, overrides -v / -q

A .env file in the working directory is loaded before arguments are parsed.
"#;

/// Extract fields from scanned PDF pages into a spreadsheet.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2sheet",
    version,
    about = "Extract fields from scanned PDF pages into a spreadsheet using Vision LLMs",
    long_about = "Render each page of a PDF to an image, ask a vision model to read it, \
and append one row per page to an .xlsx table. Supports Azure OpenAI deployments and any \
edgequake-llm provider (OpenAI, Anthropic, Gemini, Ollama, …).",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF document to process.
    document: Option<PathBuf>,

    /// Existing table whose rows are kept; new rows are appended after them.
    #[arg(long, env = "PDF2SHEET_TABLE")]
    table: Option<PathBuf>,

    /// Where to write the result table.
    #[arg(short, long, env = "PDF2SHEET_OUTPUT", default_value = "output/resultat_traite.xlsx")]
    output: PathBuf,

    /// Directory for rendered page images.
    #[arg(long, env = "PDF2SHEET_IMAGES_DIR", default_value = "images")]
    images_dir: PathBuf,

    /// Instruction sent with every page.
    #[arg(long, env = "PDF2SHEET_PROMPT")]
    prompt: Option<String>,

    /// Ask for the canonical JSON fields (type_document, date, montant, …).
    #[arg(long, env = "PDF2SHEET_STRUCTURED")]
    structured: bool,

    /// Number of concurrent extraction calls.
    #[arg(short, long, env = "PDF2SHEET_CONCURRENCY", default_value_t = 4,
          value_parser = clap::value_parser!(u16).range(1..))]
    concurrency: u16,

    /// Per-page model call timeout in seconds.
    #[arg(long, env = "PDF2SHEET_API_TIMEOUT", default_value_t = 60,
          value_parser = clap::value_parser!(u64).range(1..))]
    api_timeout: u64,

    /// edgequake-llm provider: openai, anthropic, gemini, ollama, …
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Model for --provider (default gpt-4.1-nano).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2SHEET_PASSWORD")]
    password: Option<String>,

    /// Print JSON instead of text.
    #[arg(long, env = "PDF2SHEET_JSON")]
    json: bool,

    /// Print page count and file size only.
    #[arg(long)]
    inspect_only: bool,

    /// Render this 1-indexed page to the images directory and exit.
    #[arg(long, value_name = "N")]
    page: Option<usize>,

    /// Write a header-only table to PATH and exit.
    #[arg(long, value_name = "PATH")]
    init_template: Option<PathBuf>,

    /// Print the rows of the table at PATH and exit.
    #[arg(long, value_name = "PATH")]
    read: Option<PathBuf>,

    /// Add these column headers to the --table file and exit (comma-separated).
    #[arg(long, value_name = "NAMES", value_delimiter = ',', requires = "table")]
    add_headers: Vec<String>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2SHEET_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2SHEET_QUIET")]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2SHEET_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Table-only modes ─────────────────────────────────────────────────
    if let Some(ref path) = cli.init_template {
        sheet::create_template(path)
            .with_context(|| format!("Failed to create template {}", path.display()))?;
        if !cli.quiet {
            eprintln!("{} Template written to {}", green("✔"), bold(&path.display().to_string()));
        }
        return Ok(());
    }

    if let Some(ref path) = cli.read {
        return print_records(path, cli.json);
    }

    if let Some(path) = cli.table.as_ref().filter(|_| !cli.add_headers.is_empty()) {
        let table = sheet::add_headers(path, &cli.add_headers)
            .await
            .with_context(|| format!("Failed to add headers to {}", path.display()))?;
        if !cli.quiet {
            eprintln!(
                "{} {} now has {} columns",
                green("✔"),
                bold(&path.display().to_string()),
                table.width()
            );
        }
        return Ok(());
    }

    let document = match cli.document {
        Some(ref d) => d.clone(),
        None => bail!("No document given. Run `pdf2sheet --help` for usage."),
    };

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let info = inspect(&document).await.context("Failed to inspect PDF")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&info).context("Failed to serialise document info")?
            );
        } else {
            println!("File:   {}", info.path.display());
            println!("Pages:  {}", info.page_count);
            println!("Size:   {} bytes", info.file_size);
        }
        return Ok(());
    }

    let progress_cb: Option<ProgressCallback> = if show_progress && cli.page.is_none() {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Single-page render ───────────────────────────────────────────────
    if let Some(page) = cli.page {
        let image = render_single_page(&document, page, &config)
            .await
            .with_context(|| format!("Failed to render page {page}"))?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&image).context("Failed to serialise page image")?
            );
        } else {
            println!(
                "{}  {}x{}  {} bytes",
                image.path.display(),
                image.width,
                image.height,
                image.size_bytes
            );
        }
        return Ok(());
    }

    // ── Full run ─────────────────────────────────────────────────────────
    let table = existing_table(cli.table.as_deref(), cli.quiet);
    let prompt = cli.prompt.as_deref().unwrap_or(DEFAULT_ANALYSIS_PROMPT);

    let manifest = run(&document, table.as_deref(), prompt, &config)
        .await
        .context("Extraction run failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&manifest).context("Failed to serialise manifest")?
        );
    } else if !cli.quiet {
        print_manifest(&manifest);
    }

    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .images_dir(&cli.images_dir)
        .output_path(&cli.output)
        .concurrency(cli.concurrency as usize)
        .api_timeout_secs(cli.api_timeout)
        .structured(cli.structured);

    if let Some(ref p) = cli.provider {
        builder = builder.provider_name(p);
    }
    if let Some(ref m) = cli.model {
        builder = builder.model(m);
    }
    if let Some(ref pw) = cli.password {
        builder = builder.password(pw);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// A `--table` that does not exist yet starts a fresh table.
fn existing_table(table: Option<&Path>, quiet: bool) -> Option<PathBuf> {
    let table = table?;
    if table.exists() {
        return Some(table.to_path_buf());
    }
    if !quiet {
        eprintln!(
            "{} {} does not exist yet, starting a new table",
            cyan("◆"),
            table.display()
        );
    }
    None
}

fn print_manifest(manifest: &Manifest) {
    for page in &manifest.pages {
        match &page.outcome {
            ExtractionOutcome::Success {
                fields: ExtractedFields::Structured(map),
                ..
            } => {
                let show = |k: &str| {
                    map.get(k)
                        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                        .unwrap_or_else(|| "-".to_string())
                };
                println!(
                    "{} Page {:>3}  {:<16} {:<12} {:>12}  {}",
                    if page.outcome.is_valid() { green("✓") } else { cyan("~") },
                    page.page,
                    show("type_document"),
                    show("date"),
                    show("montant"),
                    dim(&page.image.filename),
                );
            }
            ExtractionOutcome::Success {
                fields: ExtractedFields::RawText(text),
                ..
            } => {
                let preview: String = text.chars().take(60).collect();
                println!(
                    "{} Page {:>3}  {}  {}",
                    cyan("~"),
                    page.page,
                    dim(&preview.replace('\n', " ")),
                    dim(&page.image.filename),
                );
            }
            ExtractionOutcome::Failure(f) => {
                println!("{} Page {:>3}  {}", red("✗"), page.page, red(&f.to_string()));
            }
        }
    }

    let s = &manifest.stats;
    eprintln!(
        "{}  {}/{} pages  {} rows  {}ms  →  {}",
        if s.failed_pages == 0 { green("✔") } else { cyan("⚠") },
        s.succeeded_pages,
        s.total_pages,
        s.rows_appended,
        s.total_duration_ms,
        bold(&manifest.table_path.display().to_string()),
    );
    eprintln!(
        "   {} tokens in  /  {} tokens out",
        dim(&s.total_prompt_tokens.to_string()),
        dim(&s.total_completion_tokens.to_string()),
    );
}

fn print_records(path: &Path, json: bool) -> Result<()> {
    let records = sheet::read_records(path)
        .with_context(|| format!("Failed to read table {}", path.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&records).context("Failed to serialise records")?
        );
        return Ok(());
    }

    for (i, record) in records.iter().enumerate() {
        println!("{}", bold(&format!("Row {}", i + 1)));
        for (key, value) in record {
            if value.is_null() {
                continue;
            }
            let text = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            println!("  {:<20} {}", key, text);
        }
    }
    eprintln!("{} rows", records.len());
    Ok(())
}
