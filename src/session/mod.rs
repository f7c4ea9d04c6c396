//! Session coordination
//!
//! Both roles share one [`SubscriptionManager`] per client process, which
//! keeps that client attached to at most one session at a time.

mod camera;
mod subscriptions;
mod viewer;

pub use camera::{generate_device_id, CameraClient};
pub use subscriptions::{SessionCommand, SessionFrame, SubscriptionManager, TransitionStats};
pub use viewer::{FrameSink, ViewerClient};
