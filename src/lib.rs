//! camrelay: camera/viewer session pairing over a STOMP pub/sub relay
//!
//! A camera client captures video, registers a session with the session
//! directory and publishes downscaled frames on the session's frame topic.
//! Viewer clients attach to the session, render the frames and send
//! commands (toggle recording, take a screenshot, end the session) that only
//! the camera executes. Either side can turn what it has into uploaded
//! media: the camera records its live stream, a viewer records the stills
//! it receives.
//!
//! # Features
//! - One memoized, auto-reconnecting relay connection per client
//! - At most one attached session per client, stale deliveries dropped
//! - Self-scheduling frame publishing at a configurable cadence
//! - Role-scoped command execution with origin tagging
//! - Live-stream and frame-sequence recorders with a shared contract
//! - H.264/MP4 recording with the `recording` feature
//!
//! # Usage
//! ```toml
//! [dependencies]
//! camrelay = { version = "0.1", features = ["recording"] }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use camrelay::{CamRelayConfig, CameraClient, Connection, HttpDirectory, SubscriptionManager};
//! use camrelay::capture::CaptureConstraints;
//! use camrelay::recording::BackendRegistry;
//!
//! let config = CamRelayConfig::load_or_default();
//! let manager = Arc::new(SubscriptionManager::new(Connection::websocket(config.transport.clone())?));
//! let camera = CameraClient::new(
//!     manager,
//!     Arc::new(HttpDirectory::new(&config.directory)?),
//!     devices,
//!     Arc::new(BackendRegistry::from_config(&config.recording)),
//!     config.clone(),
//! );
//! let session = camera.start(CaptureConstraints::ideal(None, &config.capture)).await?;
//! ```
pub mod capture;
pub mod commands;
pub mod config;
pub mod directory;
pub mod errors;
pub mod recent;
pub mod recording;
pub mod relay;
pub mod session;
pub mod topics;
pub mod transport;
pub mod types;

// Testing utilities - offline collaborators for every external seam
pub mod testing;

// Re-exports for convenience
pub use config::CamRelayConfig;
pub use directory::{HttpDirectory, SessionDirectory};
pub use errors::RelayError;
pub use session::{CameraClient, SubscriptionManager, ViewerClient};
pub use transport::Connection;
pub use types::{Command, CommandPayload, FramePayload, MediaArtifact, MediaKind, Session};

/// Initialize logging for the relay client
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "camrelay=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// User agent sent to the directory and recorded on sessions
pub fn user_agent() -> String {
    format!("{}/{}", NAME, VERSION)
}

/// Recording time as `MM:SS`; minutes keep counting past the hour
pub fn format_elapsed(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
