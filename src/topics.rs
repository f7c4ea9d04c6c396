//! Pub/sub destinations used by the relay.
//!
//! Clients publish to `/app/...` destinations; the relay rebroadcasts to the
//! matching `/topic/...` destination that clients subscribe to.

/// New sessions announced by the directory
pub const SESSIONS_STARTED: &str = "/topic/sessions";
/// Sessions ended by the directory
pub const SESSIONS_ENDED: &str = "/topic/sessions/ended";
/// Newly stored video artifacts
pub const VIDEOS_NEW: &str = "/topic/videos/new";
/// Newly stored screenshot artifacts
pub const SCREENSHOTS_NEW: &str = "/topic/screenshots/new";

/// Topic a viewer subscribes to for frames of `session_id`
pub fn frame_topic(session_id: &str) -> String {
    format!("/topic/camera/{}", session_id)
}

/// Topic both roles subscribe to for commands of `session_id`
pub fn command_topic(session_id: &str) -> String {
    format!("/topic/camera/command/{}", session_id)
}

/// Destination the camera publishes frames to
pub fn frame_destination(session_id: &str) -> String {
    format!("/app/camera/frame/{}", session_id)
}

/// Destination commands are published to
pub fn command_destination(session_id: &str) -> String {
    format!("/app/camera/command/{}", session_id)
}

/// Topic a publish destination is rebroadcast on, if it is one of ours
pub fn broadcast_topic_for(destination: &str) -> Option<String> {
    if let Some(id) = destination.strip_prefix("/app/camera/frame/") {
        return Some(frame_topic(id));
    }
    if let Some(id) = destination.strip_prefix("/app/camera/command/") {
        return Some(command_topic(id));
    }
    if let Some(id) = destination.strip_prefix("/app/camera/status/") {
        return Some(format!("/topic/camera/status/{}", id));
    }
    if destination.starts_with("/topic/") {
        return Some(destination.to_string());
    }
    None
}
