//! Camera role
//!
//! [`CameraClient`] acquires a camera, registers a session with the
//! directory, attaches to the session's topics, publishes frames and
//! executes commands addressed to the session by viewers.

use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use super::subscriptions::{SessionCommand, SubscriptionManager};
use crate::capture::{acquire_with_fallback, CaptureConstraints, CaptureStream, MediaDevices};
use crate::commands::{should_execute, CameraPhase, Role};
use crate::config::CamRelayConfig;
use crate::directory::SessionDirectory;
use crate::errors::RelayError;
use crate::recent::RecentMedia;
use crate::recording::{
    finalize_and_upload, screenshot, upload_media, EncoderBackend, LiveStreamRecorder,
    LiveStreamSource, RecordingPhase,
};
use crate::relay::FramePublisher;
use crate::types::{Command, MediaArtifact, Session};

const DEVICE_ID_PREFIX: &str = "mobile-device-";

/// `mobile-device-` followed by nine random characters
pub fn generate_device_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", DEVICE_ID_PREFIX, &random[..9])
}

/// Everything that exists only while a session is running
struct LiveCapture {
    session: Session,
    stream: Arc<dyn CaptureStream>,
    publisher: FramePublisher,
    recorder: Arc<LiveStreamRecorder>,
    executor: JoinHandle<()>,
}

impl Drop for LiveCapture {
    fn drop(&mut self) {
        self.executor.abort();
        self.publisher.stop();
        self.stream.stop();
    }
}

struct CameraInner {
    manager: Arc<SubscriptionManager>,
    directory: Arc<dyn SessionDirectory>,
    devices: Arc<dyn MediaDevices>,
    backend: Arc<dyn EncoderBackend>,
    config: CamRelayConfig,
    device_id: String,
    client_id: String,
    phase: watch::Sender<CameraPhase>,
    recent: RecentMedia,
    live: Mutex<Option<LiveCapture>>,
}

/// Client acting in the camera role. Cheap to clone.
#[derive(Clone)]
pub struct CameraClient {
    inner: Arc<CameraInner>,
}

impl CameraClient {
    pub fn new(
        manager: Arc<SubscriptionManager>,
        directory: Arc<dyn SessionDirectory>,
        devices: Arc<dyn MediaDevices>,
        backend: Arc<dyn EncoderBackend>,
        config: CamRelayConfig,
    ) -> Self {
        let device_id = config
            .capture
            .device_id
            .clone()
            .unwrap_or_else(generate_device_id);
        let (phase, _) = watch::channel(CameraPhase::Inactive);
        Self {
            inner: Arc::new(CameraInner {
                manager,
                directory,
                devices,
                backend,
                config,
                device_id,
                client_id: uuid::Uuid::new_v4().to_string(),
                phase,
                recent: RecentMedia::default(),
                live: Mutex::new(None),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Origin tag this client would put on commands it publishes
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn phase(&self) -> CameraPhase {
        *self.inner.phase.borrow()
    }

    pub fn phase_watch(&self) -> watch::Receiver<CameraPhase> {
        self.inner.phase.subscribe()
    }

    pub fn recent_media(&self) -> RecentMedia {
        self.inner.recent.clone()
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.inner
            .live
            .lock()
            .await
            .as_ref()
            .map(|live| live.session.clone())
    }

    /// Seconds recorded so far, zero when not recording
    pub async fn elapsed_secs(&self) -> u64 {
        match self.inner.live.lock().await.as_ref() {
            Some(live) => live.recorder.elapsed_secs(),
            None => 0,
        }
    }

    /// Acquire the camera and start a session.
    ///
    /// Nothing stays allocated on failure: a stream opened before a
    /// directory or relay error is released again, and a session the
    /// directory already created is ended.
    pub async fn start(&self, constraints: CaptureConstraints) -> Result<Session, RelayError> {
        let inner = &self.inner;
        let mut live = inner.live.lock().await;
        if let Some(current) = live.as_ref() {
            return Err(RelayError::Session(format!(
                "session {} is already running; stop it first",
                current.session.session_id
            )));
        }

        let stream =
            acquire_with_fallback(inner.devices.as_ref(), &constraints, &inner.config.capture)
                .await?;

        let session_id = match inner.directory.start_session(&inner.device_id).await {
            Ok(id) => id,
            Err(e) => {
                stream.stop();
                log::error!("Could not start a session, camera released: {}", e);
                return Err(e);
            }
        };

        let commands = inner.manager.commands();
        if let Err(e) = inner.manager.subscribe_to_session(&session_id).await {
            stream.stop();
            if let Err(end) = inner.directory.end_session(&session_id).await {
                log::warn!("Could not end abandoned session {}: {}", session_id, end);
            }
            log::error!("Could not attach to session {}: {}", session_id, e);
            return Err(e);
        }

        let publisher = FramePublisher::start(
            inner.manager.connection().clone(),
            &session_id,
            Arc::clone(&stream),
            inner.config.streaming.clone(),
        );
        let recorder = Arc::new(LiveStreamRecorder::new(
            LiveStreamSource::new(Arc::clone(&stream)),
            Arc::clone(&inner.backend),
            &inner.config.recording,
        ));
        let executor = tokio::spawn(execute_commands(
            Arc::downgrade(inner),
            commands,
            session_id.clone(),
        ));

        let session = Session::started_now(session_id, inner.device_id.clone());
        *live = Some(LiveCapture {
            session: session.clone(),
            stream,
            publisher,
            recorder,
            executor,
        });
        inner.phase.send_replace(CameraPhase::Idle);
        log::info!(
            "Camera {} live in session {}",
            inner.device_id,
            session.session_id
        );
        Ok(session)
    }

    /// End the session and release the camera.
    ///
    /// A running recording is finalized and uploaded first. Local teardown
    /// always completes; the returned error only reports a failed
    /// `end-session` call.
    pub async fn stop(&self) -> Result<(), RelayError> {
        let inner = &self.inner;
        let Some(live) = inner.live.lock().await.take() else {
            return Ok(());
        };
        live.executor.abort();
        live.publisher.stop();

        let session_id = live.session.session_id.clone();
        if live.recorder.phase() != RecordingPhase::NotRecording {
            if let Err(e) = finalize_and_upload(
                live.recorder.as_ref(),
                inner.directory.as_ref(),
                &inner.device_id,
                &session_id,
                Some(&inner.recent),
            )
            .await
            {
                log::warn!("Recording in progress at session end was lost: {}", e);
            }
        }

        inner.manager.unsubscribe_from_current().await;
        drop(live);
        inner.phase.send_replace(CameraPhase::Terminated);

        let ended = inner.directory.end_session(&session_id).await;
        match &ended {
            Ok(()) => log::info!("Session {} ended", session_id),
            Err(e) => log::error!("Session {} could not be ended: {}", session_id, e),
        }
        ended
    }

    /// Start recording when idle, stop and upload when recording.
    ///
    /// Returns the uploaded artifact when a recording was finished.
    pub async fn toggle_recording(&self) -> Result<Option<MediaArtifact>, RelayError> {
        let inner = &self.inner;
        let (recorder, session_id) = {
            let live = inner.live.lock().await;
            let live = live
                .as_ref()
                .ok_or_else(|| RelayError::Session("no session is running".to_string()))?;
            (Arc::clone(&live.recorder), live.session.session_id.clone())
        };

        if recorder.phase() == RecordingPhase::Recording {
            self.advance(CameraPhase::Recording, &Command::ToggleRecording);
            finalize_and_upload(
                recorder.as_ref(),
                inner.directory.as_ref(),
                &inner.device_id,
                &session_id,
                Some(&inner.recent),
            )
            .await
        } else {
            recorder.start().await?;
            self.advance(CameraPhase::Idle, &Command::ToggleRecording);
            Ok(None)
        }
    }

    /// Apply `command` to the phase, but only if it is still `from`
    fn advance(&self, from: CameraPhase, command: &Command) {
        self.inner.phase.send_if_modified(|phase| {
            if *phase != from {
                return false;
            }
            *phase = phase.on_command(command);
            true
        });
    }

    /// Upload a full-resolution still of the current frame
    pub async fn take_screenshot(&self) -> Result<MediaArtifact, RelayError> {
        let inner = &self.inner;
        let (stream, session_id) = {
            let live = inner.live.lock().await;
            let live = live
                .as_ref()
                .ok_or_else(|| RelayError::Session("no session is running".to_string()))?;
            (Arc::clone(&live.stream), live.session.session_id.clone())
        };

        let media = screenshot::capture_still(stream.as_ref())?;
        upload_media(
            media,
            inner.directory.as_ref(),
            &inner.device_id,
            &session_id,
            Some(&inner.recent),
        )
        .await
    }

    async fn handle_command(&self, received: SessionCommand, session_id: &str) {
        if !should_execute(
            Role::Camera,
            Some(session_id),
            &self.inner.client_id,
            &received,
        ) {
            log::debug!(
                "Not executing {} from {:?}",
                received.payload.command,
                received.payload.origin
            );
            return;
        }
        if !self.phase().accepts_commands() {
            return;
        }

        log::info!("Executing remote command {}", received.payload.command);
        match received.payload.command {
            Command::ToggleRecording => {
                if let Err(e) = self.toggle_recording().await {
                    log::error!("Remote toggle failed: {}", e);
                }
            }
            Command::TakeScreenshot => {
                if let Err(e) = self.take_screenshot().await {
                    log::error!("Remote screenshot failed: {}", e);
                }
            }
            Command::EndSession => {
                // Teardown aborts this executor, so it runs on its own task
                let client = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.stop().await {
                        log::warn!("Remote end-session: {}", e);
                    }
                });
            }
            Command::Other(raw) => log::debug!("Ignoring unknown command {}", raw),
        }
    }
}

async fn execute_commands(
    inner: Weak<CameraInner>,
    mut commands: broadcast::Receiver<SessionCommand>,
    session_id: String,
) {
    loop {
        match commands.recv().await {
            Ok(received) => {
                let Some(inner) = inner.upgrade() else { return };
                CameraClient { inner }
                    .handle_command(received, &session_id)
                    .await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Command executor fell behind, {} command(s) lost", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_device_id_shape() {
        let id = generate_device_id();
        assert!(id.starts_with("mobile-device-"));
        assert_eq!(id.len(), "mobile-device-".len() + 9);
        assert_ne!(id, generate_device_id());
    }
}
