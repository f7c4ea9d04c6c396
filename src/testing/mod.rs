//! Testing utilities for camrelay
//!
//! Offline collaborators for every external seam: an in-process STOMP
//! relay, an in-memory session directory and synthetic cameras.

pub mod broker;
pub mod directory;
pub mod synthetic_data;

pub use broker::LoopbackBroker;
pub use directory::MemoryDirectory;
pub use synthetic_data::{synthetic_video_frame, SyntheticCaptureStream, SyntheticDevices};

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F: Fn() -> bool>(timeout: std::time::Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
