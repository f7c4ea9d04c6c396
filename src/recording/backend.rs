//! Encoder backends
//!
//! A backend advertises which MIME types it can produce and creates chunk
//! encoders for them. Chunks are opaque byte runs; concatenated in order
//! they form the finished file.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

use super::mime;
use crate::config::RecordingConfig;
use crate::errors::RelayError;

/// Geometry and rate of the frames fed to an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Stateful encoder for one recording
pub trait ChunkEncoder: Send {
    /// Encode one frame presented at `pts_secs`, returning any chunks that
    /// became available
    fn push_frame(&mut self, frame: &RgbImage, pts_secs: f64) -> Result<Vec<Bytes>, RelayError>;

    /// Flush and return the trailing chunks
    fn finish(self: Box<Self>) -> Result<Vec<Bytes>, RelayError>;
}

pub trait EncoderBackend: Send + Sync {
    fn name(&self) -> &str;

    fn is_supported(&self, mime: &str) -> bool;

    fn create(&self, mime: &str, format: VideoFormat) -> Result<Box<dyn ChunkEncoder>, RelayError>;
}

/// Every frame becomes a standalone JPEG chunk
pub struct MotionJpegBackend {
    quality: u8,
}

impl MotionJpegBackend {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for MotionJpegBackend {
    fn default() -> Self {
        Self::new(80)
    }
}

impl EncoderBackend for MotionJpegBackend {
    fn name(&self) -> &str {
        "motion-jpeg"
    }

    fn is_supported(&self, mime_type: &str) -> bool {
        mime::base_type(mime_type) == mime::MOTION_JPEG
    }

    fn create(&self, mime_type: &str, format: VideoFormat) -> Result<Box<dyn ChunkEncoder>, RelayError> {
        if !self.is_supported(mime_type) {
            return Err(RelayError::Recording(format!(
                "{} cannot encode {}",
                self.name(),
                mime_type
            )));
        }
        Ok(Box::new(MotionJpegEncoder {
            quality: self.quality,
            format,
        }))
    }
}

struct MotionJpegEncoder {
    quality: u8,
    format: VideoFormat,
}

impl ChunkEncoder for MotionJpegEncoder {
    fn push_frame(&mut self, frame: &RgbImage, _pts_secs: f64) -> Result<Vec<Bytes>, RelayError> {
        let resized;
        let frame = if frame.dimensions() != (self.format.width, self.format.height) {
            resized = image::imageops::resize(
                frame,
                self.format.width,
                self.format.height,
                image::imageops::FilterType::Triangle,
            );
            &resized
        } else {
            frame
        };

        let mut buffer = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut buffer, self.quality).encode_image(frame)?;
        Ok(vec![Bytes::from(buffer.into_inner())])
    }

    fn finish(self: Box<Self>) -> Result<Vec<Bytes>, RelayError> {
        Ok(Vec::new())
    }
}

/// Backends tried in registration order
pub struct BackendRegistry {
    backends: Vec<Box<dyn EncoderBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    pub fn with(mut self, backend: impl EncoderBackend + 'static) -> Self {
        self.backends.push(Box::new(backend));
        self
    }

    /// Every backend compiled into this build
    pub fn from_config(config: &RecordingConfig) -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "recording")]
        {
            registry = registry.with(super::encoder::Mp4H264Backend::new());
        }
        registry.with(MotionJpegBackend::new(config.mjpeg_quality))
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::from_config(&crate::config::CamRelayConfig::default().recording)
    }
}

impl EncoderBackend for BackendRegistry {
    fn name(&self) -> &str {
        "registry"
    }

    fn is_supported(&self, mime_type: &str) -> bool {
        self.backends.iter().any(|b| b.is_supported(mime_type))
    }

    fn create(&self, mime_type: &str, format: VideoFormat) -> Result<Box<dyn ChunkEncoder>, RelayError> {
        let backend = self
            .backends
            .iter()
            .find(|b| b.is_supported(mime_type))
            .ok_or_else(|| {
                RelayError::Recording(format!("no encoder available for {}", mime_type))
            })?;
        log::debug!("Encoding {} with {}", mime_type, backend.name());
        backend.create(mime_type, format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_jpeg_emits_one_chunk_per_frame() {
        let backend = MotionJpegBackend::new(70);
        let format = VideoFormat {
            width: 32,
            height: 16,
            fps: 5,
        };
        let mut encoder = backend.create(mime::MOTION_JPEG, format).unwrap();
        let frame = RgbImage::from_pixel(64, 32, image::Rgb([200, 10, 10]));

        let chunks = encoder.push_frame(&frame, 0.0).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&chunks[0]).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
        assert!(encoder.finish().unwrap().is_empty());
    }

    #[test]
    fn test_registry_rejects_unknown_mime() {
        let registry = BackendRegistry::new().with(MotionJpegBackend::default());
        assert!(!registry.is_supported("video/webm;codecs=vp9"));
        let format = VideoFormat {
            width: 2,
            height: 2,
            fps: 1,
        };
        assert!(matches!(
            registry.create("video/webm", format),
            Err(RelayError::Recording(_))
        ));
    }

    #[test]
    fn test_default_registry_selects_motion_jpeg_without_h264() {
        let registry = BackendRegistry::default();
        let prefs = crate::config::CamRelayConfig::default().recording.mime_preferences;
        let selected = mime::select_mime(&prefs, &registry).unwrap();
        if cfg!(feature = "recording") {
            assert_eq!(selected, "video/mp4;codecs=avc1");
        } else {
            assert_eq!(selected, mime::MOTION_JPEG);
        }
    }
}
