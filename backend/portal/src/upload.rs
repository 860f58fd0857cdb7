//! Proof image intake.
//!
//! Browsers hand us the output of a file reader: either bare base64 or a
//! `data:<mime>;base64,<payload>` URL. The declared MIME type is ignored;
//! the format is sniffed from the decoded bytes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("image payload is empty")]
    Empty,

    #[error("image payload is not valid base64")]
    BadEncoding,

    #[error("image is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("unsupported image format (expected PNG, JPEG, WebP or GIF)")]
    UnsupportedFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Decode and validate an uploaded proof image.
pub fn decode_image(payload: &str, max_bytes: usize) -> Result<DecodedImage, UploadError> {
    let encoded = strip_data_url(payload.trim());
    if encoded.is_empty() {
        return Err(UploadError::Empty);
    }
    // 4 base64 chars carry 3 bytes; refuse obviously oversized input before decoding.
    let estimated = encoded.len() / 4 * 3;
    if estimated > max_bytes + 3 {
        return Err(UploadError::TooLarge {
            size: estimated,
            limit: max_bytes,
        });
    }

    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| UploadError::BadEncoding)?;
    if bytes.len() > max_bytes {
        return Err(UploadError::TooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }
    let content_type = sniff(&bytes).ok_or(UploadError::UnsupportedFormat)?;
    Ok(DecodedImage {
        content_type,
        bytes,
    })
}

fn strip_data_url(payload: &str) -> &str {
    match payload.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or("", |(_, data)| data),
        None => payload,
    }
}

fn sniff(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}
