//! In-memory session directory

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use crate::directory::{MediaUpload, SessionDirectory};
use crate::errors::RelayError;
use crate::types::{MediaArtifact, MediaKind, Screenshot, Session, VideoRecord};

struct StoredMedia {
    id: i64,
    kind: MediaKind,
    upload: MediaUpload,
}

#[derive(Default)]
struct DirectoryState {
    sessions: Vec<Session>,
    uploads: Vec<StoredMedia>,
    next_id: i64,
    scripted_session_ids: Vec<String>,
    fail_start: bool,
    fail_uploads: bool,
    upload_attempts: usize,
}

/// `SessionDirectory` that keeps everything in memory; clones share state
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Hand out `id` for the next started session instead of a UUID
    pub fn with_next_session_id(self, id: &str) -> Self {
        self.lock().scripted_session_ids.push(id.to_string());
        self
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.lock().fail_uploads = fail;
    }

    /// Register a session started elsewhere
    pub fn insert_session(&self, session: Session) {
        self.lock().sessions.push(session);
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.lock()
            .sessions
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned()
    }

    /// Successful uploads, oldest first
    pub fn uploads(&self) -> Vec<(MediaKind, MediaUpload)> {
        self.lock()
            .uploads
            .iter()
            .map(|m| (m.kind, m.upload.clone()))
            .collect()
    }

    /// Upload calls, including failed ones
    pub fn upload_attempts(&self) -> usize {
        self.lock().upload_attempts
    }

    fn store(&self, kind: MediaKind, upload: MediaUpload) -> Result<MediaArtifact, RelayError> {
        let mut state = self.lock();
        state.upload_attempts += 1;
        if state.fail_uploads {
            return Err(RelayError::Upload(format!(
                "upload-{} returned 500 Internal Server Error",
                kind
            )));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.uploads.push(StoredMedia {
            id,
            kind,
            upload: upload.clone(),
        });
        Ok(MediaArtifact {
            kind,
            id: Some(id),
            file_name: upload.file_name,
            device_id: upload.device_id,
            session_id: upload.session_id,
            mime_type: upload.mime_type,
            file_size: upload.bytes.len() as u64,
            captured_at: Some(chrono::Local::now().naive_local()),
            width: upload.width,
            height: upload.height,
            duration_secs: upload.duration_secs,
        })
    }

    fn stored(&self, kind: MediaKind, device_id: Option<&str>) -> Vec<(i64, MediaUpload)> {
        self.lock()
            .uploads
            .iter()
            .filter(|m| m.kind == kind && device_id.map_or(true, |d| m.upload.device_id == d))
            .map(|m| (m.id, m.upload.clone()))
            .collect()
    }
}

#[async_trait]
impl SessionDirectory for MemoryDirectory {
    async fn start_session(&self, device_id: &str) -> Result<String, RelayError> {
        let mut state = self.lock();
        if state.fail_start {
            return Err(RelayError::Session(
                "start-session failed: connection refused; check that the backend is reachable"
                    .to_string(),
            ));
        }
        let session_id = if state.scripted_session_ids.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            state.scripted_session_ids.remove(0)
        };
        let mut session = Session::started_now(session_id.clone(), device_id);
        session.id = Some(state.sessions.len() as i64 + 1);
        state.sessions.push(session);
        Ok(session_id)
    }

    async fn end_session(&self, session_id: &str) -> Result<(), RelayError> {
        let mut state = self.lock();
        if let Some(session) = state
            .sessions
            .iter_mut()
            .find(|s| s.session_id == session_id)
        {
            session.active = false;
            session.end_time = Some(chrono::Local::now().naive_local());
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, RelayError> {
        self.session(session_id)
            .ok_or_else(|| RelayError::Session(format!("session {} not found", session_id)))
    }

    async fn active_sessions(&self) -> Result<Vec<Session>, RelayError> {
        Ok(self
            .lock()
            .sessions
            .iter()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn upload_video(&self, upload: MediaUpload) -> Result<MediaArtifact, RelayError> {
        self.store(MediaKind::Video, upload)
    }

    async fn upload_screenshot(&self, upload: MediaUpload) -> Result<MediaArtifact, RelayError> {
        self.store(MediaKind::Screenshot, upload)
    }

    async fn list_videos(&self, device_id: Option<&str>) -> Result<Vec<VideoRecord>, RelayError> {
        Ok(self
            .stored(MediaKind::Video, device_id)
            .into_iter()
            .map(|(id, u)| VideoRecord {
                id,
                file_size: u.bytes.len() as u64,
                file_name: u.file_name,
                file_path: None,
                duration: u.duration_secs,
                recorded_at: chrono::Local::now().naive_local(),
                device_id: u.device_id,
                session_id: u.session_id,
                mime_type: u.mime_type,
                thumbnail_path: None,
            })
            .collect())
    }

    async fn list_screenshots(
        &self,
        device_id: Option<&str>,
    ) -> Result<Vec<Screenshot>, RelayError> {
        Ok(self
            .stored(MediaKind::Screenshot, device_id)
            .into_iter()
            .map(|(id, u)| Screenshot {
                id,
                file_size: u.bytes.len() as u64,
                file_name: u.file_name,
                file_path: None,
                captured_at: chrono::Local::now().naive_local(),
                device_id: u.device_id,
                session_id: u.session_id,
                mime_type: u.mime_type,
                width: u.width,
                height: u.height,
            })
            .collect())
    }

    async fn delete_video(&self, id: i64) -> Result<(), RelayError> {
        self.remove(MediaKind::Video, id)
    }

    async fn delete_screenshot(&self, id: i64) -> Result<(), RelayError> {
        self.remove(MediaKind::Screenshot, id)
    }

    async fn download_video(&self, file_name: &str) -> Result<Bytes, RelayError> {
        self.fetch(MediaKind::Video, file_name)
    }

    async fn download_screenshot(&self, file_name: &str) -> Result<Bytes, RelayError> {
        self.fetch(MediaKind::Screenshot, file_name)
    }
}

impl MemoryDirectory {
    fn remove(&self, kind: MediaKind, id: i64) -> Result<(), RelayError> {
        let mut state = self.lock();
        let index = state
            .uploads
            .iter()
            .position(|m| m.kind == kind && m.id == id)
            .ok_or_else(|| RelayError::Directory(format!("{} {} not found", kind, id)))?;
        state.uploads.remove(index);
        Ok(())
    }

    fn fetch(&self, kind: MediaKind, file_name: &str) -> Result<Bytes, RelayError> {
        self.lock()
            .uploads
            .iter()
            .find(|m| m.kind == kind && m.upload.file_name == file_name)
            .map(|m| m.upload.bytes.clone())
            .ok_or_else(|| RelayError::Directory(format!("{} {} not found", kind, file_name)))
    }
}
