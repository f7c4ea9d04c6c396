//! Configuration management for camrelay
//!
//! Provides configuration loading, saving, and validation for the relay
//! transport, the session directory client, frame streaming cadence,
//! recorder preferences and capture constraints.

use crate::errors::RelayError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamRelayConfig {
    pub transport: TransportConfig,
    pub directory: DirectoryConfig,
    pub streaming: StreamingConfig,
    pub recording: RecordingConfig,
    pub capture: CaptureConfig,
}

/// Pub/sub relay connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// WebSocket endpoint of the STOMP relay
    pub url: String,
    /// Reconnect automatically after an unexpected disconnect
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts in milliseconds
    pub reconnect_delay_ms: u64,
    /// Heartbeat we promise to send, in milliseconds (0 disables)
    pub heartbeat_outgoing_ms: u64,
    /// Heartbeat we want to receive, in milliseconds (0 disables)
    pub heartbeat_incoming_ms: u64,
    /// Hard limit for socket open plus STOMP handshake, in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-subscription delivery queue depth
    pub subscription_queue: usize,
}

/// Session directory (HTTP) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Base URL of the camera API, without trailing slash
    pub base_url: String,
    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,
}

/// Camera-side frame publishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Delay between publish ticks in milliseconds (200 ms is ~5 fps)
    pub frame_interval_ms: u64,
    /// Width frames are downscaled to before publishing
    pub target_width: u32,
    /// JPEG quality of published frames (1-100)
    pub jpeg_quality: u8,
    /// Retry delay while the source has no known dimensions
    pub dimension_retry_ms: u64,
}

/// Recorder settings shared by both recorder variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Ordered encoder preference; the first supported MIME type wins
    pub mime_preferences: Vec<String>,
    /// Capture rate of the frame-sequence surface
    pub synthetic_fps: u32,
    /// JPEG quality used by the Motion-JPEG backend
    pub mjpeg_quality: u8,
}

/// Camera acquisition constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Ideal capture resolution [width, height]
    pub ideal_resolution: [u32; 2],
    /// Request audio on the first acquisition attempt
    pub request_audio: bool,
    /// Whether the embedding runs in a secure (HTTPS) context
    pub secure_context: bool,
    /// Identity the camera reports to the directory; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Default for CamRelayConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig {
                url: "ws://localhost:8080/ws".to_string(),
                auto_reconnect: true,
                reconnect_delay_ms: 2000,
                heartbeat_outgoing_ms: 10_000,
                heartbeat_incoming_ms: 10_000,
                connect_timeout_ms: 10_000,
                subscription_queue: 64,
            },
            directory: DirectoryConfig {
                base_url: "http://localhost:8080/api/camera".to_string(),
                request_timeout_ms: 30_000,
            },
            streaming: StreamingConfig {
                frame_interval_ms: 200,
                target_width: 480,
                jpeg_quality: 50,
                dimension_retry_ms: 200,
            },
            recording: RecordingConfig {
                mime_preferences: vec![
                    "video/webm;codecs=vp9".to_string(),
                    "video/webm;codecs=vp8".to_string(),
                    "video/webm".to_string(),
                    "video/mp4;codecs=avc1".to_string(),
                    "video/mp4".to_string(),
                    "video/x-motion-jpeg".to_string(),
                ],
                synthetic_fps: 5,
                mjpeg_quality: 80,
            },
            capture: CaptureConfig {
                ideal_resolution: [1280, 720],
                request_audio: true,
                secure_context: true,
                device_id: None,
            },
        }
    }
}

impl TransportConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl StreamingConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn dimension_retry(&self) -> Duration {
        Duration::from_millis(self.dimension_retry_ms)
    }
}

impl CamRelayConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;

        let config: CamRelayConfig = toml::from_str(&contents)
            .map_err(|e| RelayError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate().map_err(RelayError::Config)?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RelayError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                RelayError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| RelayError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("camrelay.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if !(self.transport.url.starts_with("ws://") || self.transport.url.starts_with("wss://")) {
            return Err("Transport URL must use ws:// or wss://".to_string());
        }
        if self.transport.subscription_queue == 0 {
            return Err("Subscription queue depth must be at least 1".to_string());
        }
        if self.transport.connect_timeout_ms == 0 {
            return Err("Connect timeout must be non-zero".to_string());
        }

        if !(self.directory.base_url.starts_with("http://")
            || self.directory.base_url.starts_with("https://"))
        {
            return Err("Directory base URL must use http:// or https://".to_string());
        }

        if self.streaming.frame_interval_ms == 0 {
            return Err("Frame interval must be non-zero".to_string());
        }
        if self.streaming.target_width == 0 {
            return Err("Target width must be non-zero".to_string());
        }
        if self.streaming.jpeg_quality == 0 || self.streaming.jpeg_quality > 100 {
            return Err("JPEG quality must be between 1 and 100".to_string());
        }

        if self.recording.mime_preferences.is_empty() {
            return Err("At least one recorder MIME preference is required".to_string());
        }
        if self.recording.synthetic_fps == 0
            || self.recording.synthetic_fps > crate::recording::FrameCanvas::MAX_FPS
        {
            return Err(format!(
                "Synthetic FPS must be between 1 and {}",
                crate::recording::FrameCanvas::MAX_FPS
            ));
        }
        if self.recording.mjpeg_quality == 0 || self.recording.mjpeg_quality > 100 {
            return Err("Motion-JPEG quality must be between 1 and 100".to_string());
        }

        if self.capture.ideal_resolution[0] == 0 || self.capture.ideal_resolution[1] == 0 {
            return Err("Invalid ideal capture resolution".to_string());
        }
        if self.capture.device_id.as_deref().is_some_and(str::is_empty) {
            return Err("Device id must not be empty".to_string());
        }

        Ok(())
    }
}
