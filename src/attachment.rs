use std::path::Path;

use base64::Engine;
use image::ImageFormat;

use crate::error::MaterializeError;

/// An image picked by the user, read into memory and ready to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    /// `data:` URI the timeline shows independently of whether the upload succeeds.
    pub preview_uri: String,
}

/// Read `path` and produce a locally displayable preview plus the upload payload.
pub async fn materialize(path: &Path) -> Result<ImageUpload, MaterializeError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| MaterializeError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    let format = ImageFormat::from_path(path)
        .ok()
        .or_else(|| image::guess_format(&bytes).ok())
        .ok_or_else(|| MaterializeError::UnsupportedFormat(path.to_path_buf()))?;

    let mime = format.to_mime_type().to_string();
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.png".to_string());

    let preview_uri = format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(&bytes)
    );

    tracing::debug!(%filename, %mime, size = bytes.len(), "materialized image");

    Ok(ImageUpload {
        filename,
        mime,
        bytes,
        preview_uri,
    })
}
