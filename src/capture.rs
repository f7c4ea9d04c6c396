//! Camera acquisition
//!
//! Devices differ wildly in which constraint combinations they honor, so a
//! camera is acquired through a fallback ladder: the caller's ideal
//! constraints, then any environment-facing camera without audio, then any
//! camera at all. Only when every rung fails does the caller see an error.

use std::sync::Arc;

use async_trait::async_trait;
use image::RgbImage;
use tokio::sync::broadcast;

use crate::config::CaptureConfig;
use crate::errors::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

/// What to ask the media devices for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Exact device to open
    pub device_id: Option<String>,
    pub facing: Option<FacingMode>,
    pub ideal_resolution: Option<(u32, u32)>,
    pub audio: bool,
}

impl CaptureConstraints {
    /// The preferred request: explicit device if given, otherwise the rear
    /// camera, at the configured resolution
    pub fn ideal(device_id: Option<&str>, config: &CaptureConfig) -> Self {
        Self {
            device_id: device_id.map(str::to_string),
            facing: if device_id.is_some() {
                None
            } else {
                Some(FacingMode::Environment)
            },
            ideal_resolution: Some((config.ideal_resolution[0], config.ideal_resolution[1])),
            audio: config.request_audio,
        }
    }

    pub fn environment_without_audio() -> Self {
        Self {
            device_id: None,
            facing: Some(FacingMode::Environment),
            ideal_resolution: None,
            audio: false,
        }
    }

    /// Any video source, no audio
    pub fn any_video() -> Self {
        Self {
            device_id: None,
            facing: None,
            ideal_resolution: None,
            audio: false,
        }
    }

    /// The three attempts made for `self`, most specific first
    pub fn fallback_ladder(&self) -> [CaptureConstraints; 3] {
        [
            self.clone(),
            Self::environment_without_audio(),
            Self::any_video(),
        ]
    }
}

/// A live local media stream
pub trait CaptureStream: Send + Sync {
    fn label(&self) -> String;

    /// Decoded frame size; `None` until the first frame has been decoded
    fn dimensions(&self) -> Option<(u32, u32)>;

    /// Copy of the current frame at full resolution
    fn snapshot(&self) -> Option<RgbImage>;

    /// Every decoded frame, as it arrives
    fn subscribe(&self) -> broadcast::Receiver<Arc<RgbImage>>;

    fn frame_rate(&self) -> u32;

    fn has_audio(&self) -> bool;

    /// Release the device. Idempotent.
    fn stop(&self);
}

/// Source of camera streams
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Arc<dyn CaptureStream>, RelayError>;
}

/// Open a camera, relaxing `constraints` step by step
pub async fn acquire_with_fallback(
    devices: &dyn MediaDevices,
    constraints: &CaptureConstraints,
    config: &CaptureConfig,
) -> Result<Arc<dyn CaptureStream>, RelayError> {
    let mut last_error = None;

    for (attempt, rung) in constraints.fallback_ladder().iter().enumerate() {
        match devices.open(rung).await {
            Ok(stream) => {
                if attempt > 0 {
                    log::info!(
                        "Camera acquired with relaxed constraints (attempt {}): {:?}",
                        attempt + 1,
                        rung
                    );
                } else {
                    log::info!("Camera acquired: {}", stream.label());
                }
                return Ok(stream);
            }
            Err(e) => {
                log::warn!("Camera attempt {} failed ({:?}): {}", attempt + 1, rung, e);
                last_error = Some(e);
            }
        }
    }

    Err(actionable_error(last_error, config))
}

fn actionable_error(last: Option<RelayError>, config: &CaptureConfig) -> RelayError {
    let secure_hint = if config.secure_context {
        ""
    } else {
        " Camera access requires a secure context: serve the page over HTTPS or use localhost."
    };

    match last {
        Some(RelayError::PermissionDenied(detail)) => RelayError::PermissionDenied(format!(
            "{}. Allow camera access in the browser or system settings and try again.{}",
            detail, secure_hint
        )),
        Some(other) => RelayError::Capture(format!(
            "no camera could be opened ({}). Check that a camera is connected and not in use by another application.{}",
            other, secure_hint
        )),
        None => RelayError::Capture(format!("no camera could be opened.{}", secure_hint)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CamRelayConfig;
    use crate::testing::SyntheticDevices;

    #[test]
    fn test_ideal_prefers_explicit_device() {
        let config = CamRelayConfig::default().capture;
        let with_device = CaptureConstraints::ideal(Some("cam-2"), &config);
        assert_eq!(with_device.device_id.as_deref(), Some("cam-2"));
        assert_eq!(with_device.facing, None);
        assert!(with_device.audio);

        let rear = CaptureConstraints::ideal(None, &config);
        assert_eq!(rear.facing, Some(FacingMode::Environment));
        assert_eq!(rear.ideal_resolution, Some((1280, 720)));
    }

    #[tokio::test]
    async fn test_second_rung_drops_audio() {
        let devices = SyntheticDevices::new(64, 48);
        devices.fail_next(RelayError::Capture("OverconstrainedError".into()));
        let config = CamRelayConfig::default().capture;

        let constraints = CaptureConstraints::ideal(Some("cam-2"), &config);
        let stream = acquire_with_fallback(&devices, &constraints, &config)
            .await
            .unwrap();
        assert!(!stream.has_audio());

        let attempts = devices.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1], CaptureConstraints::environment_without_audio());
        stream.stop();
    }

    #[tokio::test]
    async fn test_permission_error_keeps_kind_and_hint() {
        let devices = SyntheticDevices::new(64, 48);
        for _ in 0..3 {
            devices.fail_next(RelayError::PermissionDenied("NotAllowedError".into()));
        }
        let mut config = CamRelayConfig::default().capture;
        config.secure_context = false;

        let result =
            acquire_with_fallback(&devices, &CaptureConstraints::any_video(), &config).await;
        match result {
            Err(RelayError::PermissionDenied(msg)) => assert!(msg.contains("HTTPS")),
            other => panic!("expected permission error, got {:?}", other.err()),
        }
        assert_eq!(devices.attempts().len(), 3);
    }
}
