pub const FALLBACK_MIME: &str = "application/octet-stream";

/// Sniff the content type of an image from its leading bytes.
pub fn detect_image_mime(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(format) => format.to_mime_type(),
        Err(_) => {
            tracing::warn!(
                "Unrecognized image format (first 4 bytes: {:02X?}), falling back to {}",
                &bytes[..bytes.len().min(4)],
                FALLBACK_MIME
            );
            FALLBACK_MIME
        }
    }
}
