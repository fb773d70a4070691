//! Input resolution: validate the document and optional table paths.
//!
//! pdfium crashes or returns opaque errors on non-PDF input, so the magic
//! bytes (`%PDF`) are checked here first. Missing files surface as
//! [`Pdf2SheetError::FileNotFound`] before any rendering or model call.

use crate::error::Pdf2SheetError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Validate that `path` is an existing, readable PDF.
pub fn resolve_document(path: &Path) -> Result<PathBuf, Pdf2SheetError> {
    let path = path.to_path_buf();

    if !path.exists() {
        return Err(Pdf2SheetError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
                return Err(Pdf2SheetError::NotAPdf { path, magic });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(Pdf2SheetError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(Pdf2SheetError::FileNotFound { path });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(path)
}

/// Validate that an existing table path, when given, points at a file.
pub fn resolve_table(path: Option<&Path>) -> Result<Option<PathBuf>, Pdf2SheetError> {
    match path {
        None => Ok(None),
        Some(p) if p.is_file() => Ok(Some(p.to_path_buf())),
        Some(p) => Err(Pdf2SheetError::FileNotFound {
            path: p.to_path_buf(),
        }),
    }
}

/// Base name used for page image files: the document's file stem.
pub fn document_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "document".to_string())
}
