//! Progress-callback trait for per-page extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`].
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2sheet::{ExtractionConfig, ExtractionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl ExtractionProgressCallback for Counter {
//!     fn on_page_complete(&self, page: usize, total: usize, field_count: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {}/{}: {} fields", page, total, field_count);
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it extracts each page.
///
/// Page events may arrive concurrently and out of page order when
/// concurrency is above 1. All methods default to no-ops.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once after rendering, before any extraction call.
    fn on_run_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called just before the model request for a page is sent.
    fn on_page_start(&self, page: usize, total_pages: usize) {
        let _ = (page, total_pages);
    }

    /// Called when a page's extraction succeeded.
    ///
    /// `field_count` is the number of extracted fields (1 for raw text).
    fn on_page_complete(&self, page: usize, total_pages: usize, field_count: usize) {
        let _ = (page, total_pages, field_count);
    }

    /// Called when a page's extraction failed.
    fn on_page_error(&self, page: usize, total_pages: usize, error: &str) {
        let _ = (page, total_pages, error);
    }

    /// Called once after every page has been attempted.
    fn on_run_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// No-op implementation; the default when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// The type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
