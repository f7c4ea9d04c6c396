//! Still captures
//!
//! The camera has genuine pixels and stores a lossless PNG of the current
//! frame. A viewer only has the compressed stills it received, so it stores
//! the latest one as-is.

use std::io::Cursor;

use bytes::Bytes;
use image::ImageFormat;

use super::mime;
use super::recorder::RecordedMedia;
use crate::capture::CaptureStream;
use crate::errors::RelayError;
use crate::relay;
use crate::types::{FramePayload, MediaKind};

fn screenshot_name(extension: &str) -> String {
    format!(
        "screenshot_{}.{}",
        chrono::Utc::now().timestamp_millis(),
        extension
    )
}

/// Full-resolution PNG of the camera's current frame
pub fn capture_still(stream: &dyn CaptureStream) -> Result<RecordedMedia, RelayError> {
    let frame = stream
        .snapshot()
        .ok_or_else(|| RelayError::Stream("camera has not produced a frame yet".to_string()))?;

    let mut buffer = Cursor::new(Vec::new());
    frame.write_to(&mut buffer, ImageFormat::Png)?;

    Ok(RecordedMedia {
        kind: MediaKind::Screenshot,
        file_name: screenshot_name("png"),
        mime_type: mime::PNG.to_string(),
        bytes: Bytes::from(buffer.into_inner()),
        width: Some(frame.width()),
        height: Some(frame.height()),
        duration_secs: None,
    })
}

/// The received still, byte for byte
pub fn still_from_frame(payload: &FramePayload) -> Result<RecordedMedia, RelayError> {
    let (mime_type, bytes) = relay::decode_data_uri(&payload.frame)?;
    let dimensions = image::load_from_memory(&bytes)
        .map(|img| (img.width(), img.height()))
        .ok();

    Ok(RecordedMedia {
        kind: MediaKind::Screenshot,
        file_name: screenshot_name(mime::extension_for(&mime_type)),
        mime_type,
        bytes: Bytes::from(bytes),
        width: dimensions.map(|d| d.0),
        height: dimensions.map(|d| d.1),
        duration_secs: None,
    })
}
