//! Wire and domain types shared by the transport, the session directory and
//! the recorders.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A time-bounded pairing between one capturing device and its viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Directory row id, absent for locally constructed sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub session_id: String,
    pub device_id: String,
    pub start_time: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<NaiveDateTime>,
    #[serde(rename = "isActive", alias = "active")]
    pub active: bool,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Session {
    /// Session as the camera sees it right after the directory accepted it
    pub fn started_now(session_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            id: None,
            session_id: session_id.into(),
            device_id: device_id.into(),
            start_time: chrono::Local::now().naive_local(),
            end_time: None,
            active: true,
            ip_address: None,
            user_agent: Some(crate::user_agent()),
        }
    }
}

/// One published still: a data URI plus capture time in epoch milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePayload {
    pub frame: String,
    pub timestamp: i64,
}

impl FramePayload {
    pub fn new(frame: impl Into<String>, timestamp: i64) -> Self {
        Self {
            frame: frame.into(),
            timestamp,
        }
    }

    /// Payload stamped with the current wall clock
    pub fn now(frame: impl Into<String>) -> Self {
        Self::new(frame, chrono::Utc::now().timestamp_millis())
    }
}

/// Control commands addressed to the camera of a session
///
/// Unknown values survive deserialization as `Other` so newer peers do not
/// break older ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    ToggleRecording,
    TakeScreenshot,
    EndSession,
    Other(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::ToggleRecording => "TOGGLE_RECORDING",
            Command::TakeScreenshot => "TAKE_SCREENSHOT",
            Command::EndSession => "END_SESSION",
            Command::Other(raw) => raw,
        }
    }
}

impl From<String> for Command {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "TOGGLE_RECORDING" => Command::ToggleRecording,
            "TAKE_SCREENSHOT" => Command::TakeScreenshot,
            "END_SESSION" => Command::EndSession,
            _ => Command::Other(raw),
        }
    }
}

impl From<Command> for String {
    fn from(command: Command) -> Self {
        command.as_str().to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a message on a command topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: Command,
    /// Client id of the publisher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Free-form command arguments, flattened into the body
    #[serde(flatten)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl CommandPayload {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            origin: None,
            args: serde_json::Map::new(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Screenshot,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Screenshot => write!(f, "screenshot"),
        }
    }
}

/// A finalized, uploaded media object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaArtifact {
    pub kind: MediaKind,
    #[serde(default)]
    pub id: Option<i64>,
    pub file_name: String,
    pub device_id: String,
    pub session_id: String,
    pub mime_type: String,
    pub file_size: u64,
    #[serde(default)]
    pub captured_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

/// Video row as listed by the directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: i64,
    pub file_name: String,
    #[serde(default)]
    pub file_path: Option<String>,
    pub file_size: u64,
    #[serde(default)]
    pub duration: Option<f64>,
    pub recorded_at: NaiveDateTime,
    pub device_id: String,
    pub session_id: String,
    pub mime_type: String,
    #[serde(default)]
    pub thumbnail_path: Option<String>,
}

/// Screenshot row as listed by the directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub id: i64,
    pub file_name: String,
    #[serde(default)]
    pub file_path: Option<String>,
    pub file_size: u64,
    pub captured_at: NaiveDateTime,
    pub device_id: String,
    pub session_id: String,
    pub mime_type: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl From<VideoRecord> for MediaArtifact {
    fn from(video: VideoRecord) -> Self {
        Self {
            kind: MediaKind::Video,
            id: Some(video.id),
            file_name: video.file_name,
            device_id: video.device_id,
            session_id: video.session_id,
            mime_type: video.mime_type,
            file_size: video.file_size,
            captured_at: Some(video.recorded_at),
            width: None,
            height: None,
            duration_secs: video.duration,
        }
    }
}

impl From<Screenshot> for MediaArtifact {
    fn from(shot: Screenshot) -> Self {
        Self {
            kind: MediaKind::Screenshot,
            id: Some(shot.id),
            file_name: shot.file_name,
            device_id: shot.device_id,
            session_id: shot.session_id,
            mime_type: shot.mime_type,
            file_size: shot.file_size,
            captured_at: Some(shot.captured_at),
            width: shot.width,
            height: shot.height,
            duration_secs: None,
        }
    }
}

/// `POST start-session` response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// `POST upload-*` response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, alias = "videoId", alias = "screenshotId")]
    pub id: Option<i64>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_true() -> bool {
    true
}
