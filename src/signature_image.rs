use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::RgbaImage;
use thiserror::Error;

const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";
const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

#[derive(Debug, Error)]
pub enum SignatureImageError {
    #[error("signature image required")]
    Empty,
    #[error("signature image must be a base64 png data uri")]
    NotDataUri,
    #[error("signature image is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("signature image is not a png")]
    NotPng,
    #[error("signature image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
}

/// Decodes a `data:image/png;base64,` payload into RGBA pixels. All
/// validation happens here, before the pipeline touches the blob store.
pub fn decode_signature_png(payload: &str) -> Result<RgbaImage, SignatureImageError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Err(SignatureImageError::Empty);
    }

    let encoded = trimmed
        .strip_prefix(PNG_DATA_URI_PREFIX)
        .ok_or(SignatureImageError::NotDataUri)?;
    if encoded.is_empty() {
        return Err(SignatureImageError::Empty);
    }

    let bytes = BASE64.decode(encoded.as_bytes())?;
    if bytes.len() < PNG_MAGIC.len() || bytes[..PNG_MAGIC.len()] != PNG_MAGIC {
        return Err(SignatureImageError::NotPng);
    }

    let decoded = image::load_from_memory_with_format(&bytes, image::ImageFormat::Png)?;
    Ok(decoded.to_rgba8())
}
