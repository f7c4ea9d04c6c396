//! Command channel
//!
//! Viewers publish commands on a session's command topic; only the client
//! currently acting as that session's camera executes them. Every command
//! carries its publisher's client id so a client never executes its own
//! echo.

use crate::errors::RelayError;
use crate::session::SessionCommand;
use crate::topics;
use crate::transport::Connection;
use crate::types::{Command, CommandPayload};

/// Part a client plays in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Camera,
    Viewer,
}

/// Camera-side receiver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraPhase {
    /// No session started
    Inactive,
    Idle,
    Recording,
    /// Session ended, capture released
    Terminated,
}

impl CameraPhase {
    /// Phase after `command`; screenshots and unknown commands leave it as is
    pub fn on_command(self, command: &Command) -> CameraPhase {
        match (self, command) {
            (CameraPhase::Idle, Command::ToggleRecording) => CameraPhase::Recording,
            (CameraPhase::Recording, Command::ToggleRecording) => CameraPhase::Idle,
            (CameraPhase::Idle | CameraPhase::Recording, Command::EndSession) => {
                CameraPhase::Terminated
            }
            (phase, _) => phase,
        }
    }

    /// Whether commands can be acted on at all
    pub fn accepts_commands(self) -> bool {
        matches!(self, CameraPhase::Idle | CameraPhase::Recording)
    }
}

/// Publish `payload` to the command topic of `session_id`
pub async fn send_command(
    conn: &Connection,
    session_id: &str,
    payload: &CommandPayload,
) -> Result<(), RelayError> {
    conn.publish(&topics::command_destination(session_id), payload)
        .await
        .inspect_err(|e| log::warn!("Command {} not sent: {}", payload.command, e))?;
    log::debug!("Sent {} to session {}", payload.command, session_id);
    Ok(())
}

/// Whether the client `client_id`, in `role` for `session_id`, may execute
/// `received`
pub fn should_execute(
    role: Role,
    session_id: Option<&str>,
    client_id: &str,
    received: &SessionCommand,
) -> bool {
    if role != Role::Camera {
        return false;
    }
    if session_id != Some(received.session_id.as_str()) {
        return false;
    }
    received.payload.origin.as_deref() != Some(client_id)
}
