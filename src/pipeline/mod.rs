//! Pipeline stages for PDF-to-table extraction.
//!
//! Each submodule implements one step and is testable on its own.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ backend ──▶ extract ──▶ aggregate
//! (checks)  (pdfium)   (base64)   (HTTP)      (normalise)  (rows)
//! ```
//!
//! 1. [`input`]: check the document and optional table paths
//! 2. [`render`]: rasterise every page to PNG; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`encode`]: base64-wrap a page image for the request body
//! 4. [`backend`]: send one vision request (Azure OpenAI or edgequake-llm)
//! 5. [`extract`]: turn the answer into structured fields, raw text or a
//!    failure
//! 6. [`aggregate`]: map page results onto table rows

pub mod aggregate;
pub mod backend;
pub mod encode;
pub mod extract;
pub mod input;
pub mod render;
