//! Session directory client
//!
//! The directory is the HTTP backend that owns session lifecycle and stores
//! uploaded media. [`SessionDirectory`] is the seam the clients depend on;
//! [`HttpDirectory`] talks to the real service.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use crate::config::DirectoryConfig;
use crate::errors::RelayError;
use crate::types::{
    MediaArtifact, MediaKind, Screenshot, Session, StartSessionResponse, UploadResponse,
    VideoRecord,
};

/// A finished media object on its way to the directory
#[derive(Debug, Clone, PartialEq)]
pub struct MediaUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
    /// Device the artifact is attributed to
    pub device_id: String,
    pub session_id: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
}

impl MediaUpload {
    /// Complete the directory's terse upload response into a full artifact
    pub fn into_artifact(self, kind: MediaKind, response: UploadResponse) -> MediaArtifact {
        MediaArtifact {
            kind,
            id: response.id,
            file_name: response.file_name.unwrap_or(self.file_name),
            device_id: self.device_id,
            session_id: self.session_id,
            mime_type: self.mime_type,
            file_size: self.bytes.len() as u64,
            captured_at: Some(chrono::Local::now().naive_local()),
            width: self.width,
            height: self.height,
            duration_secs: self.duration_secs,
        }
    }
}

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Register a new session for `device_id`, returning its id
    async fn start_session(&self, device_id: &str) -> Result<String, RelayError>;
    async fn end_session(&self, session_id: &str) -> Result<(), RelayError>;
    async fn get_session(&self, session_id: &str) -> Result<Session, RelayError>;
    async fn active_sessions(&self) -> Result<Vec<Session>, RelayError>;

    async fn upload_video(&self, upload: MediaUpload) -> Result<MediaArtifact, RelayError>;
    async fn upload_screenshot(&self, upload: MediaUpload) -> Result<MediaArtifact, RelayError>;

    async fn list_videos(&self, device_id: Option<&str>) -> Result<Vec<VideoRecord>, RelayError>;
    async fn list_screenshots(&self, device_id: Option<&str>)
        -> Result<Vec<Screenshot>, RelayError>;
    async fn delete_video(&self, id: i64) -> Result<(), RelayError>;
    async fn delete_screenshot(&self, id: i64) -> Result<(), RelayError>;

    async fn download_video(&self, file_name: &str) -> Result<Bytes, RelayError>;
    async fn download_screenshot(&self, file_name: &str) -> Result<Bytes, RelayError>;

    /// Upload `upload` to the endpoint matching `kind`
    async fn upload(
        &self,
        kind: MediaKind,
        upload: MediaUpload,
    ) -> Result<MediaArtifact, RelayError> {
        match kind {
            MediaKind::Video => self.upload_video(upload).await,
            MediaKind::Screenshot => self.upload_screenshot(upload).await,
        }
    }
}

/// `SessionDirectory` over the backend's REST API
pub struct HttpDirectory {
    base: Url,
    client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(config: &DirectoryConfig) -> Result<Self, RelayError> {
        let base = Url::parse(config.base_url.trim_end_matches('/')).map_err(|e| {
            RelayError::Config(format!("invalid directory URL {}: {}", config.base_url, e))
        })?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(RelayError::Config(format!(
                "directory URL must be http:// or https://, got {}",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(crate::user_agent())
            .build()
            .map_err(|e| RelayError::Directory(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { base, client })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Public URL a stored file can be fetched from
    pub fn download_url(&self, kind: MediaKind, file_name: &str) -> String {
        self.endpoint(&["download", kind.to_string().as_str(), file_name])
            .to_string()
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, RelayError> {
        let response = request.send().await.map_err(|e| {
            RelayError::Directory(format!(
                "{} failed: {}; check that the backend is reachable",
                what, e
            ))
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, what, &body))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T, RelayError> {
        let response = self.send(self.client.get(url), what).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RelayError::Directory(format!("{}: invalid response: {}", what, e)))
    }

    async fn get_bytes(&self, url: Url, what: &str) -> Result<Bytes, RelayError> {
        let response = self.send(self.client.get(url), what).await?;
        response
            .bytes()
            .await
            .map_err(|e| RelayError::Directory(format!("{}: {}", what, e)))
    }

    async fn post_upload(
        &self,
        kind: MediaKind,
        upload: MediaUpload,
    ) -> Result<MediaArtifact, RelayError> {
        let what = format!("upload-{}", kind);
        let part = Part::bytes(upload.bytes.to_vec())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.mime_type)
            .map_err(|e| RelayError::Upload(format!("invalid MIME type: {}", e)))?;
        let form = Form::new()
            .part("file", part)
            .text("deviceId", upload.device_id.clone())
            .text("sessionId", upload.session_id.clone());

        let request = self.client.post(self.endpoint(&[what.as_str()])).multipart(form);
        let response = self.send(request, &what).await.map_err(|e| match e {
            RelayError::Directory(msg) => RelayError::Upload(msg),
            other => other,
        })?;
        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Upload(format!("{}: invalid response: {}", what, e)))?;
        if !body.success {
            return Err(RelayError::Upload(
                body.message
                    .unwrap_or_else(|| format!("{} rejected by backend", what)),
            ));
        }

        log::info!(
            "Uploaded {} {} ({} bytes)",
            kind,
            upload.file_name,
            upload.bytes.len()
        );
        Ok(upload.into_artifact(kind, body))
    }

    async fn delete(&self, kind: MediaKind, id: i64) -> Result<(), RelayError> {
        let what = format!("delete {} {}", kind, id);
        let url = self.endpoint(&[kind.to_string().as_str(), id.to_string().as_str()]);
        self.send(self.client.request(Method::DELETE, url), &what)
            .await?;
        Ok(())
    }
}

fn status_error(status: StatusCode, what: &str, body: &str) -> RelayError {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());
    RelayError::Directory(format!("{} returned {}: {}", what, status, detail))
}

fn as_session_error(e: RelayError) -> RelayError {
    match e {
        RelayError::Directory(msg) => RelayError::Session(msg),
        other => other,
    }
}

#[async_trait]
impl SessionDirectory for HttpDirectory {
    async fn start_session(&self, device_id: &str) -> Result<String, RelayError> {
        let request = self
            .client
            .post(self.endpoint(&["start-session"]))
            .query(&[("deviceId", device_id)]);
        let response = self
            .send(request, "start-session")
            .await
            .map_err(as_session_error)?;
        let body: StartSessionResponse = response.json().await.map_err(|e| {
            RelayError::Session(format!("start-session: invalid response: {}", e))
        })?;
        if !body.success || body.session_id.is_empty() {
            return Err(RelayError::Session(
                body.message
                    .unwrap_or_else(|| "backend refused to start a session".to_string()),
            ));
        }
        log::info!("Session {} started for {}", body.session_id, device_id);
        Ok(body.session_id)
    }

    async fn end_session(&self, session_id: &str) -> Result<(), RelayError> {
        let request = self
            .client
            .post(self.endpoint(&["end-session"]))
            .query(&[("sessionId", session_id)]);
        self.send(request, "end-session")
            .await
            .map_err(as_session_error)?;
        log::info!("Session {} ended", session_id);
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, RelayError> {
        let url = self.endpoint(&["session", session_id]);
        let response = self.client.get(url).send().await.map_err(|e| {
            RelayError::Session(format!(
                "session lookup failed: {}; check that the backend is reachable",
                e
            ))
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RelayError::Session(format!(
                "session {} not found",
                session_id
            )));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(as_session_error(status_error(status, "session lookup", &body)));
        }
        response
            .json()
            .await
            .map_err(|e| RelayError::Session(format!("session lookup: invalid response: {}", e)))
    }

    async fn active_sessions(&self) -> Result<Vec<Session>, RelayError> {
        self.get_json(self.endpoint(&["active-sessions"]), "active-sessions")
            .await
    }

    async fn upload_video(&self, upload: MediaUpload) -> Result<MediaArtifact, RelayError> {
        self.post_upload(MediaKind::Video, upload).await
    }

    async fn upload_screenshot(&self, upload: MediaUpload) -> Result<MediaArtifact, RelayError> {
        self.post_upload(MediaKind::Screenshot, upload).await
    }

    async fn list_videos(&self, device_id: Option<&str>) -> Result<Vec<VideoRecord>, RelayError> {
        let url = match device_id {
            Some(device) => self.endpoint(&["videos", "device", device]),
            None => self.endpoint(&["videos"]),
        };
        self.get_json(url, "list videos").await
    }

    async fn list_screenshots(
        &self,
        device_id: Option<&str>,
    ) -> Result<Vec<Screenshot>, RelayError> {
        let url = match device_id {
            Some(device) => self.endpoint(&["screenshots", "device", device]),
            None => self.endpoint(&["screenshots"]),
        };
        self.get_json(url, "list screenshots").await
    }

    async fn delete_video(&self, id: i64) -> Result<(), RelayError> {
        self.delete(MediaKind::Video, id).await
    }

    async fn delete_screenshot(&self, id: i64) -> Result<(), RelayError> {
        self.delete(MediaKind::Screenshot, id).await
    }

    async fn download_video(&self, file_name: &str) -> Result<Bytes, RelayError> {
        let url = self.endpoint(&["download", "video", file_name]);
        self.get_bytes(url, "download video").await
    }

    async fn download_screenshot(&self, file_name: &str) -> Result<Bytes, RelayError> {
        let url = self.endpoint(&["download", "screenshot", file_name]);
        self.get_bytes(url, "download screenshot").await
    }
}
