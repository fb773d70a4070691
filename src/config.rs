//! Configuration for a document-to-table run.
//!
//! Every knob lives in [`ExtractionConfig`], built through
//! [`ExtractionConfigBuilder`]. Azure connection settings come from the
//! environment via [`AzureSettings::from_env`].

use crate::error::Pdf2SheetError;
use crate::pipeline::backend::VisionBackend;
use crate::pipeline::render::PageRenderer;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Environment variable holding the Azure OpenAI resource endpoint.
pub const AZURE_ENDPOINT_ENV: &str = "AZURE_AI_ENDPOINT";
/// Environment variable holding the Azure OpenAI API key.
pub const AZURE_API_KEY_ENV: &str = "AZURE_AI_API_KEY";
/// Environment variable holding the vision deployment name.
pub const AZURE_DEPLOYMENT_ENV: &str = "AZURE_AI_DEPLOYMENT_NAME";
/// Deployment used when [`AZURE_DEPLOYMENT_ENV`] is unset.
pub const DEFAULT_AZURE_DEPLOYMENT: &str = "gpt-4-vision-preview";

/// Default directory for rendered page images.
pub const DEFAULT_IMAGES_DIR: &str = "images";
/// Default location of the result table.
pub const DEFAULT_OUTPUT_PATH: &str = "output/resultat_traite.xlsx";

/// Configuration for one run.
///
/// # Example
/// ```rust
/// use edgequake_pdf2sheet::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .images_dir("scans/images")
///     .output_path("scans/results.xlsx")
///     .concurrency(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 2);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Where page images are written. Created on demand. Default: `images`.
    pub images_dir: PathBuf,

    /// Where the result table is written. Default: `output/resultat_traite.xlsx`.
    pub output_path: PathBuf,

    /// Pages extracted at the same time. Default: 4.
    ///
    /// Rows are appended in page order whatever this is set to.
    pub concurrency: usize,

    /// Deadline for one extraction call, in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Wrap the caller's prompt in the canonical JSON field instructions.
    pub structured: bool,

    /// Pre-built vision backend. Takes precedence over everything else.
    pub backend: Option<Arc<dyn VisionBackend>>,

    /// `edgequake-llm` provider name ("openai", "anthropic", "ollama", …).
    /// When unset, Azure settings from the environment are tried first.
    pub provider_name: Option<String>,

    /// Model for `provider_name`. If None, uses the provider default.
    pub model: Option<String>,

    /// Page renderer. If None, pdfium is used.
    pub renderer: Option<Arc<dyn PageRenderer>>,

    /// Per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            concurrency: 4,
            api_timeout_secs: 60,
            password: None,
            structured: false,
            backend: None,
            provider_name: None,
            model: None,
            renderer: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("images_dir", &self.images_dir)
            .field("output_path", &self.output_path)
            .field("concurrency", &self.concurrency)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("structured", &self.structured)
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("renderer", &self.renderer.as_ref().map(|_| "<dyn PageRenderer>"))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl ExtractionConfig {
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn images_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.images_dir = dir.into();
        self
    }

    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output_path = path.into();
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn structured(mut self, v: bool) -> Self {
        self.config.structured = v;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn VisionBackend>) -> Self {
        self.config.backend = Some(backend);
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.config.renderer = Some(renderer);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, Pdf2SheetError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(Pdf2SheetError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(Pdf2SheetError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if c.output_path.as_os_str().is_empty() {
            return Err(Pdf2SheetError::InvalidConfig(
                "Output path must not be empty".into(),
            ));
        }
        if c.images_dir.as_os_str().is_empty() {
            return Err(Pdf2SheetError::InvalidConfig(
                "Images directory must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Azure settings ───────────────────────────────────────────────────────

/// Connection settings for an Azure OpenAI vision deployment.
#[derive(Clone, PartialEq, Eq)]
pub struct AzureSettings {
    pub endpoint: String,
    pub api_key: String,
    pub deployment: String,
}

impl fmt::Debug for AzureSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureSettings")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("deployment", &self.deployment)
            .finish()
    }
}

impl AzureSettings {
    /// Read `AZURE_AI_ENDPOINT`, `AZURE_AI_API_KEY` and
    /// `AZURE_AI_DEPLOYMENT_NAME` from the process environment.
    pub fn from_env() -> Result<Self, Pdf2SheetError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Pdf2SheetError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let endpoint = get(AZURE_ENDPOINT_ENV);
        let api_key = get(AZURE_API_KEY_ENV);

        let missing: Vec<&str> = [
            (AZURE_ENDPOINT_ENV, endpoint.is_none()),
            (AZURE_API_KEY_ENV, api_key.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        match (endpoint, api_key) {
            (Some(endpoint), Some(api_key)) => Ok(Self {
                endpoint,
                api_key,
                deployment: get(AZURE_DEPLOYMENT_ENV)
                    .unwrap_or_else(|| DEFAULT_AZURE_DEPLOYMENT.to_string()),
            }),
            _ => Err(Pdf2SheetError::ProviderNotConfigured {
                provider: "azure".into(),
                hint: format!("Set {}.", missing.join(" and ")),
            }),
        }
    }
}
