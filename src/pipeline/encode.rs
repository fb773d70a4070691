//! Image encoding: page image file → base64 payload for the model request.
//!
//! Vision endpoints accept images as base64 data-URIs embedded in the JSON
//! body. The bytes are sent exactly as written by the renderer (lossless PNG),
//! so what the model reads is what the caller can retrieve from the images
//! directory.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::Path;
use tracing::debug;

/// A page image ready to embed in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: &'static str,
    /// Standard base64, no line breaks.
    pub base64: String,
}

impl EncodedImage {
    /// `data:{mime};base64,{payload}` as used in `image_url` content parts.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

/// MIME type inferred from the file extension; PNG unless clearly JPEG.
pub fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/png",
    }
}

/// Encode raw image bytes.
pub fn encode_bytes(bytes: &[u8], mime_type: &'static str) -> EncodedImage {
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded image → {} bytes base64", b64.len());
    EncodedImage {
        mime_type,
        base64: b64,
    }
}

/// Read and encode an image file.
pub async fn encode_file(path: &Path) -> std::io::Result<EncodedImage> {
    let bytes = tokio::fs::read(path).await?;
    Ok(encode_bytes(&bytes, mime_for(path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_shape() {
        let img = encode_bytes(b"\x89PNG", "image/png");
        assert_eq!(img.data_url(), "data:image/png;base64,iVBORw==");
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_for(Path::new("a/page_001.png")), "image/png");
        assert_eq!(mime_for(Path::new("a/page_001.JPG")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a/page_001")), "image/png");
    }

    #[tokio::test]
    async fn encode_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.png");
        std::fs::write(&path, [1u8, 2, 3, 4, 5]).unwrap();

        let img = encode_file(&path).await.expect("encode");
        assert_eq!(STANDARD.decode(&img.base64).unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn encode_missing_file_errors() {
        assert!(encode_file(Path::new("/no/such/page.png")).await.is_err());
    }
}
