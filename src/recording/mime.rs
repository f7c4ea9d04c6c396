//! MIME helpers for recorded media

use super::backend::EncoderBackend;

pub const MOTION_JPEG: &str = "video/x-motion-jpeg";
pub const MP4: &str = "video/mp4";
pub const PNG: &str = "image/png";
pub const JPEG: &str = "image/jpeg";

/// `video/webm;codecs=vp9` -> `video/webm`
pub fn base_type(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Value of the `codecs` parameter, if present
pub fn codecs(mime: &str) -> Option<String> {
    mime.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("codecs") {
            Some(value.trim().trim_matches('"').to_ascii_lowercase())
        } else {
            None
        }
    })
}

/// File extension for a stored artifact of type `mime`
pub fn extension_for(mime: &str) -> &'static str {
    match base_type(mime).as_str() {
        "video/webm" => "webm",
        "video/mp4" => "mp4",
        "video/x-motion-jpeg" => "mjpeg",
        "video/x-matroska" => "mkv",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "bin",
    }
}

/// First preference `backend` can encode
pub fn select_mime(preferences: &[String], backend: &dyn EncoderBackend) -> Option<String> {
    preferences
        .iter()
        .find(|mime| backend.is_supported(mime))
        .cloned()
}
