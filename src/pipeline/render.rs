//! PDF rasterisation: render every page to a PNG file via pdfium.
//!
//! ## Threading
//!
//! pdfium keeps thread-local state and must not be driven from async tasks.
//! Rendering and PNG encoding run under `tokio::task::spawn_blocking`.
//!
//! ## Fixed resolution
//!
//! Pages are always rendered at [`RENDER_DPI`]. The same document therefore
//! yields the same image dimensions on every run. A pixel cap on the longest
//! edge only kicks in for oversized pages (posters, plans).

use crate::error::Pdf2SheetError;
use crate::output::PageImage;
use crate::pipeline::input::document_stem;
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info};

/// Rendering resolution for every page.
pub const RENDER_DPI: u32 = 300;

/// Longest edge allowed for a rendered page, in pixels.
pub const MAX_EDGE_PX: i32 = 10_000;

/// Environment variable naming an explicit pdfium shared library.
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

/// Turns a document into page images on disk.
///
/// Implementations must return pages numbered `1..=N` in increasing order,
/// one image per page, and must create `out_dir` if it does not exist.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Number of pages in the document.
    async fn page_count(&self, document: &Path) -> Result<usize, Pdf2SheetError>;

    /// Render every page. A document without pages yields an empty vector.
    async fn render(&self, document: &Path, out_dir: &Path)
        -> Result<Vec<PageImage>, Pdf2SheetError>;

    /// Render one 1-indexed page without touching the others.
    async fn render_page(
        &self,
        document: &Path,
        page: usize,
        out_dir: &Path,
    ) -> Result<PageImage, Pdf2SheetError>;
}

/// File name for a page image: `{stem}_page_{NNN}.png`.
///
/// Zero-padding keeps lexical order equal to page order. Re-running on the
/// same document overwrites the previous images.
pub fn page_filename(stem: &str, page: usize) -> String {
    format!("{}_page_{:03}.png", stem, page)
}

/// Write a rendered page to `out_dir` as PNG and describe it.
pub fn save_page_image(
    img: &DynamicImage,
    out_dir: &Path,
    stem: &str,
    page: usize,
) -> Result<PageImage, Pdf2SheetError> {
    let filename = page_filename(stem, page);
    let path = out_dir.join(&filename);

    img.save_with_format(&path, ImageFormat::Png)
        .map_err(|e| Pdf2SheetError::ImageWriteFailed {
            path: path.clone(),
            detail: e.to_string(),
        })?;

    let size_bytes = std::fs::metadata(&path)
        .map_err(|e| Pdf2SheetError::ImageWriteFailed {
            path: path.clone(),
            detail: e.to_string(),
        })?
        .len();

    Ok(PageImage {
        page,
        path,
        filename,
        size_bytes,
        width: img.width(),
        height: img.height(),
    })
}

/// Create the images directory if it is missing.
pub fn ensure_dir(dir: &Path) -> Result<(), Pdf2SheetError> {
    std::fs::create_dir_all(dir).map_err(|e| Pdf2SheetError::ImageWriteFailed {
        path: dir.to_path_buf(),
        detail: e.to_string(),
    })
}

/// [`PageRenderer`] backed by the pdfium library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRenderer {
    password: Option<String>,
}

impl PdfiumRenderer {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }
}

#[async_trait]
impl PageRenderer for PdfiumRenderer {
    async fn page_count(&self, document: &Path) -> Result<usize, Pdf2SheetError> {
        let path = document.to_path_buf();
        let password = self.password.clone();

        tokio::task::spawn_blocking(move || {
            let pdfium = bind_pdfium()?;
            let doc = load_document(&pdfium, &path, password.as_deref())?;
            Ok(doc.pages().len() as usize)
        })
        .await
        .map_err(|e| Pdf2SheetError::Internal(format!("Page-count task panicked: {}", e)))?
    }

    async fn render(
        &self,
        document: &Path,
        out_dir: &Path,
    ) -> Result<Vec<PageImage>, Pdf2SheetError> {
        let path = document.to_path_buf();
        let out = out_dir.to_path_buf();
        let password = self.password.clone();

        tokio::task::spawn_blocking(move || render_all_blocking(&path, &out, password.as_deref()))
            .await
            .map_err(|e| Pdf2SheetError::Internal(format!("Render task panicked: {}", e)))?
    }

    async fn render_page(
        &self,
        document: &Path,
        page: usize,
        out_dir: &Path,
    ) -> Result<PageImage, Pdf2SheetError> {
        let path = document.to_path_buf();
        let out = out_dir.to_path_buf();
        let password = self.password.clone();

        tokio::task::spawn_blocking(move || {
            render_one_blocking(&path, page, &out, password.as_deref())
        })
        .await
        .map_err(|e| Pdf2SheetError::Internal(format!("Render task panicked: {}", e)))?
    }
}

/// Bind to pdfium: `PDFIUM_LIB_PATH` first, then the working directory,
/// then the system library search path.
fn bind_pdfium() -> Result<Pdfium, Pdf2SheetError> {
    if let Ok(lib) = std::env::var(PDFIUM_LIB_PATH_ENV) {
        if !lib.is_empty() {
            let bindings = Pdfium::bind_to_library(&lib)
                .map_err(|e| Pdf2SheetError::PdfiumBindingFailed(format!("{}: {:?}", lib, e)))?;
            return Ok(Pdfium::new(bindings));
        }
    }

    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map(Pdfium::new)
        .map_err(|e| Pdf2SheetError::PdfiumBindingFailed(format!("{:?}", e)))
}

fn load_document<'a>(
    pdfium: &'a Pdfium,
    pdf_path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, Pdf2SheetError> {
    pdfium.load_pdf_from_file(pdf_path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            if password.is_some() {
                Pdf2SheetError::WrongPassword {
                    path: pdf_path.to_path_buf(),
                }
            } else {
                Pdf2SheetError::PasswordRequired {
                    path: pdf_path.to_path_buf(),
                }
            }
        } else {
            Pdf2SheetError::CorruptPdf {
                path: pdf_path.to_path_buf(),
                detail: err_str,
            }
        }
    })
}

fn render_config() -> PdfRenderConfig {
    PdfRenderConfig::new()
        .scale_page_by_factor(RENDER_DPI as f32 / 72.0)
        .set_maximum_width(MAX_EDGE_PX)
        .set_maximum_height(MAX_EDGE_PX)
}

fn rasterise(page: &PdfPage, page_num: usize) -> Result<DynamicImage, Pdf2SheetError> {
    let bitmap = page.render_with_config(&render_config()).map_err(|e| {
        Pdf2SheetError::RasterisationFailed {
            page: page_num,
            detail: format!("{:?}", e),
        }
    })?;

    let image = bitmap.as_image();
    debug!(
        "Rendered page {} → {}x{} px",
        page_num,
        image.width(),
        image.height()
    );
    Ok(image)
}

fn render_all_blocking(
    pdf_path: &Path,
    out_dir: &Path,
    password: Option<&str>,
) -> Result<Vec<PageImage>, Pdf2SheetError> {
    let pdfium = bind_pdfium()?;
    let document = load_document(&pdfium, pdf_path, password)?;
    let stem = document_stem(pdf_path);

    let pages = document.pages();
    let total = pages.len() as usize;
    info!("PDF loaded: {} pages", total);

    ensure_dir(out_dir)?;

    let mut images = Vec::with_capacity(total);
    for (idx, page) in pages.iter().enumerate() {
        let page_num = idx + 1;
        let image = rasterise(&page, page_num)?;
        images.push(save_page_image(&image, out_dir, &stem, page_num)?);
    }

    Ok(images)
}

fn render_one_blocking(
    pdf_path: &Path,
    page_num: usize,
    out_dir: &Path,
    password: Option<&str>,
) -> Result<PageImage, Pdf2SheetError> {
    let pdfium = bind_pdfium()?;
    let document = load_document(&pdfium, pdf_path, password)?;
    let pages = document.pages();
    let total = pages.len() as usize;

    if page_num == 0 || page_num > total {
        return Err(Pdf2SheetError::PageNotFound {
            page: page_num,
            total,
        });
    }

    let page = pages
        .get((page_num - 1) as u16)
        .map_err(|e| Pdf2SheetError::RasterisationFailed {
            page: page_num,
            detail: format!("{:?}", e),
        })?;

    ensure_dir(out_dir)?;
    let image = rasterise(&page, page_num)?;
    save_page_image(&image, out_dir, &document_stem(pdf_path), page_num)
}
