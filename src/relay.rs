//! Frame relay
//!
//! The camera side samples its live stream at a fixed cadence, downscales
//! each frame to a bounded width, JPEG-encodes it at reduced quality and
//! publishes it as a data URI. The viewer side decodes those data URIs back
//! into images for display and for the frame-sequence recorder.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use tokio::task::JoinHandle;

use crate::capture::CaptureStream;
use crate::config::StreamingConfig;
use crate::errors::RelayError;
use crate::recording::mime;
use crate::topics;
use crate::transport::Connection;
use crate::types::FramePayload;

/// Size of a frame scaled to `target_width`, aspect ratio preserved.
///
/// Frames already narrower than the target keep their size.
pub fn downscale_dimensions(width: u32, height: u32, target_width: u32) -> (u32, u32) {
    if width == 0 || height == 0 || width <= target_width || target_width == 0 {
        return (width, height);
    }
    let scaled = (f64::from(height) * f64::from(target_width) / f64::from(width)).round();
    (target_width, (scaled as u32).max(1))
}

pub fn data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
}

/// Split a base64 data URI into its MIME type and payload bytes
pub fn decode_data_uri(uri: &str) -> Result<(String, Vec<u8>), RelayError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| RelayError::Stream("frame is not a data URI".to_string()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| RelayError::Stream("data URI has no payload".to_string()))?;
    let mime_type = meta
        .strip_suffix(";base64")
        .ok_or_else(|| RelayError::Stream("only base64 data URIs are supported".to_string()))?;
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| RelayError::Stream(format!("invalid base64 frame: {}", e)))?;
    let mime_type = if mime_type.is_empty() {
        "text/plain".to_string()
    } else {
        mime_type.to_ascii_lowercase()
    };
    Ok((mime_type, bytes))
}

/// Downscale and JPEG-encode `frame` into a data URI
pub fn encode_frame(frame: &RgbImage, target_width: u32, quality: u8) -> Result<String, RelayError> {
    let (width, height) = downscale_dimensions(frame.width(), frame.height(), target_width);
    let resized;
    let frame = if (width, height) != frame.dimensions() {
        resized = image::imageops::resize(frame, width, height, FilterType::Triangle);
        &resized
    } else {
        frame
    };

    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(frame)?;
    Ok(data_uri(mime::JPEG, buffer.get_ref()))
}

/// Decode the still carried by a received payload
pub fn decode_frame_image(payload: &FramePayload) -> Result<RgbImage, RelayError> {
    let (mime_type, bytes) = decode_data_uri(&payload.frame)?;
    if !mime_type.starts_with("image/") {
        return Err(RelayError::Stream(format!(
            "frame carries {}, not an image",
            mime_type
        )));
    }
    Ok(image::load_from_memory(&bytes)?.to_rgb8())
}

/// Camera-side publish loop for one session.
///
/// Each tick schedules the next only once it has published or deferred, so
/// a slow encode stretches the cadence instead of piling up work. Aborted
/// on `stop` or drop.
pub struct FramePublisher {
    session_id: String,
    published: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl FramePublisher {
    pub fn start(
        conn: Connection,
        session_id: &str,
        stream: Arc<dyn CaptureStream>,
        config: StreamingConfig,
    ) -> Self {
        let published = Arc::new(AtomicU64::new(0));
        let destination = topics::frame_destination(session_id);
        let counter = Arc::clone(&published);

        let task = tokio::spawn(async move {
            loop {
                // No decoded frame yet: try again shortly
                let frame = match stream.dimensions() {
                    Some((w, h)) if w > 0 && h > 0 => stream.snapshot(),
                    _ => None,
                };
                let Some(frame) = frame else {
                    tokio::time::sleep(config.dimension_retry()).await;
                    continue;
                };

                let (width, quality) = (config.target_width, config.jpeg_quality);
                let encoded =
                    tokio::task::spawn_blocking(move || encode_frame(&frame, width, quality)).await;
                match encoded {
                    Ok(Ok(uri)) => {
                        match conn.publish(&destination, &FramePayload::now(uri)).await {
                            Ok(()) => {
                                counter.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => log::debug!("Frame not published: {}", e),
                        }
                    }
                    Ok(Err(e)) => log::warn!("Skipping frame that failed to encode: {}", e),
                    Err(e) => log::warn!("Frame encode task failed: {}", e),
                }

                tokio::time::sleep(config.frame_interval()).await;
            }
        });

        log::info!("Publishing frames for session {}", session_id);
        Self {
            session_id: session_id.to_string(),
            published,
            task,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Frames successfully handed to the relay
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        if !self.task.is_finished() {
            self.task.abort();
            log::info!("Stopped publishing frames for session {}", self.session_id);
        }
    }
}

impl Drop for FramePublisher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CamRelayConfig;
    use crate::testing::{synthetic_video_frame, wait_until, LoopbackBroker};
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::broadcast;

    /// Stream that has a frame buffered but reports no size until `ready`
    struct UndecodedStream {
        ready: AtomicBool,
        frame: RgbImage,
        frames: broadcast::Sender<Arc<RgbImage>>,
    }

    impl CaptureStream for UndecodedStream {
        fn label(&self) -> String {
            "undecoded".to_string()
        }

        fn dimensions(&self) -> Option<(u32, u32)> {
            self.ready
                .load(Ordering::SeqCst)
                .then(|| self.frame.dimensions())
        }

        fn snapshot(&self) -> Option<RgbImage> {
            Some(self.frame.clone())
        }

        fn subscribe(&self) -> broadcast::Receiver<Arc<RgbImage>> {
            self.frames.subscribe()
        }

        fn frame_rate(&self) -> u32 {
            5
        }

        fn has_audio(&self) -> bool {
            false
        }

        fn stop(&self) {}
    }

    #[tokio::test]
    async fn test_publisher_waits_for_dimensions_then_publishes() {
        let broker = LoopbackBroker::new();
        let conn = Connection::new(Arc::new(broker.clone()), CamRelayConfig::default().transport);
        conn.connect().await.unwrap();

        let stream = Arc::new(UndecodedStream {
            ready: AtomicBool::new(false),
            frame: synthetic_video_frame(0, 64, 48),
            frames: broadcast::channel(1).0,
        });
        let config = StreamingConfig {
            frame_interval_ms: 20,
            dimension_retry_ms: 20,
            ..CamRelayConfig::default().streaming
        };
        let publisher = FramePublisher::start(conn, "S1", stream.clone(), config);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(publisher.published(), 0);
        assert!(publisher.is_running());
        assert!(broker.sent_to(&topics::frame_destination("S1")).is_empty());

        stream.ready.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(2), || publisher.published() > 0).await);
        assert!(
            wait_until(Duration::from_secs(1), || {
                !broker.sent_to(&topics::frame_destination("S1")).is_empty()
            })
            .await
        );

        publisher.stop();
    }

    #[test]
    fn test_downscale_keeps_aspect() {
        assert_eq!(downscale_dimensions(1280, 720, 480), (480, 270));
        assert_eq!(downscale_dimensions(720, 1280, 480), (480, 853));
        assert_eq!(downscale_dimensions(320, 240, 480), (320, 240));
        assert_eq!(downscale_dimensions(0, 0, 480), (0, 0));
    }

    #[test]
    fn test_encode_frame_is_jpeg_data_uri() {
        let frame = synthetic_video_frame(1, 1280, 720);
        let uri = encode_frame(&frame, 480, 50).unwrap();
        assert!(uri.starts_with("data:image/jpeg;base64,"));

        let decoded = decode_frame_image(&FramePayload::new(uri, 1000)).unwrap();
        assert_eq!(decoded.dimensions(), (480, 270));
    }

    #[test]
    fn test_decode_data_uri_rejects_malformed() {
        assert!(decode_data_uri("image/jpeg;base64,AAAA").is_err());
        assert!(decode_data_uri("data:image/jpeg;base64").is_err());
        assert!(decode_data_uri("data:image/jpeg,plain").is_err());
        assert!(decode_data_uri("data:image/jpeg;base64,@@@").is_err());
    }

    #[test]
    fn test_non_image_frame_rejected() {
        let payload = FramePayload::new(data_uri("text/plain", b"hello"), 1);
        assert!(matches!(
            decode_frame_image(&payload),
            Err(RelayError::Stream(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_downscale_bounded_and_proportional(w in 1u32..4000, h in 1u32..4000, target in 16u32..1000) {
            let (sw, sh) = downscale_dimensions(w, h, target);
            prop_assert!(sw <= target);
            prop_assert!(sw <= w && sh <= h.max(1));
            prop_assert!(sh >= 1);
            // Aspect within one pixel of rounding
            let expected = f64::from(h) * f64::from(sw) / f64::from(w);
            prop_assert!((f64::from(sh) - expected).abs() <= 1.0);
        }
    }
}
