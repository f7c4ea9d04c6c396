//! Viewer role
//!
//! [`ViewerClient`] attaches to a session someone else is capturing,
//! renders the frames it receives, sends commands to the camera and can
//! record or snapshot what it sees.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use image::RgbImage;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::camera::generate_device_id;
use super::subscriptions::{SessionFrame, SubscriptionManager};
use crate::commands;
use crate::config::CamRelayConfig;
use crate::directory::SessionDirectory;
use crate::errors::RelayError;
use crate::recent::RecentMedia;
use crate::recording::{
    finalize_and_upload, screenshot, upload_media, EncoderBackend, FrameCanvas,
    FrameSequenceRecorder, RecordingPhase,
};
use crate::relay;
use crate::types::{Command, CommandPayload, FramePayload, MediaArtifact};

/// Display surface for received frames
pub trait FrameSink: Send + Sync {
    fn render(&self, frame: &SessionFrame, image: &RgbImage);
}

type SharedSink = Arc<StdMutex<Option<Arc<dyn FrameSink>>>>;

struct Joined {
    session_id: String,
    /// Device id uploads are attributed to
    device_id: String,
    render: JoinHandle<()>,
}

impl Drop for Joined {
    fn drop(&mut self) {
        self.render.abort();
    }
}

struct ViewerInner {
    manager: Arc<SubscriptionManager>,
    directory: Arc<dyn SessionDirectory>,
    client_id: String,
    device_id: String,
    canvas: FrameCanvas,
    recorder: Arc<FrameSequenceRecorder>,
    recent: RecentMedia,
    sink: SharedSink,
    joined: Mutex<Option<Joined>>,
    /// Session id `latest_frame` answers for, readable without awaiting
    viewing: StdMutex<Option<String>>,
}

/// Client acting in the viewer role. Cheap to clone.
#[derive(Clone)]
pub struct ViewerClient {
    inner: Arc<ViewerInner>,
}

impl ViewerClient {
    pub fn new(
        manager: Arc<SubscriptionManager>,
        directory: Arc<dyn SessionDirectory>,
        backend: Arc<dyn EncoderBackend>,
        config: &CamRelayConfig,
    ) -> Self {
        let canvas = FrameCanvas::new(config.recording.synthetic_fps);
        let recorder = Arc::new(FrameSequenceRecorder::new(
            canvas.clone(),
            backend,
            &config.recording,
        ));
        Self {
            inner: Arc::new(ViewerInner {
                manager,
                directory,
                client_id: uuid::Uuid::new_v4().to_string(),
                device_id: config
                    .capture
                    .device_id
                    .clone()
                    .unwrap_or_else(generate_device_id),
                canvas,
                recorder,
                recent: RecentMedia::default(),
                sink: Arc::new(StdMutex::new(None)),
                joined: Mutex::new(None),
                viewing: StdMutex::new(None),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn set_sink(&self, sink: Arc<dyn FrameSink>) {
        *lock_sink(&self.inner.sink) = Some(sink);
    }

    pub fn recent_media(&self) -> RecentMedia {
        self.inner.recent.clone()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner
            .joined
            .lock()
            .await
            .as_ref()
            .map(|j| j.session_id.clone())
    }

    /// Start viewing `session_id`, leaving any session viewed before
    pub async fn join(&self, session_id: &str) -> Result<(), RelayError> {
        let inner = &self.inner;
        let mut joined = inner.joined.lock().await;
        if joined.as_ref().map(|j| j.session_id.as_str()) == Some(session_id) {
            return Ok(());
        }
        if let Some(previous) = joined.take() {
            self.set_viewing(None);
            self.finish_recording(&previous).await;
        }

        inner.manager.subscribe_to_session(session_id).await?;
        self.set_viewing(Some(session_id));

        // Uploads carry the camera's device id when the directory knows it
        let device_id = match inner.directory.get_session(session_id).await {
            Ok(session) => session.device_id,
            Err(e) => {
                log::debug!("Session lookup for attribution failed: {}", e);
                inner.device_id.clone()
            }
        };

        let render = tokio::spawn(render_frames(
            inner.manager.latest_frame(),
            session_id.to_string(),
            inner.canvas.clone(),
            Arc::clone(&inner.recorder),
            Arc::clone(&inner.sink),
        ));
        *joined = Some(Joined {
            session_id: session_id.to_string(),
            device_id,
            render,
        });
        log::info!("Viewing session {}", session_id);
        Ok(())
    }

    /// Stop viewing. A running recording is finalized and uploaded first.
    pub async fn leave(&self) {
        let mut joined = self.inner.joined.lock().await;
        let Some(previous) = joined.take() else {
            return;
        };
        self.set_viewing(None);
        self.finish_recording(&previous).await;
        drop(previous);
        self.inner.manager.unsubscribe_from_current().await;
        self.inner.canvas.clear();
        log::info!("Left session");
    }

    async fn finish_recording(&self, joined: &Joined) {
        if self.inner.recorder.phase() == RecordingPhase::NotRecording {
            return;
        }
        if let Err(e) = finalize_and_upload(
            self.inner.recorder.as_ref(),
            self.inner.directory.as_ref(),
            &joined.device_id,
            &joined.session_id,
            Some(&self.inner.recent),
        )
        .await
        {
            log::warn!("Recording of {} was lost: {}", joined.session_id, e);
        }
    }

    /// Publish `command` to the camera of the viewed session
    pub async fn send_command(&self, command: Command) -> Result<(), RelayError> {
        let session_id = self
            .session_id()
            .await
            .ok_or_else(|| RelayError::Session("not viewing a session".to_string()))?;
        let payload = CommandPayload::new(command).with_origin(self.inner.client_id.as_str());
        commands::send_command(self.inner.manager.connection(), &session_id, &payload).await
    }

    /// Most recent frame of the viewed session.
    ///
    /// The subscription manager may be shared; frames it cached for any
    /// other session are not reported.
    pub fn latest_frame(&self) -> Option<FramePayload> {
        let viewing = lock_viewing(&self.inner.viewing).clone()?;
        let frames = self.inner.manager.latest_frame();
        let latest = frames
            .borrow()
            .as_ref()
            .filter(|f| f.session_id == viewing)
            .map(|f| f.payload.clone());
        latest
    }

    fn set_viewing(&self, session_id: Option<&str>) {
        *lock_viewing(&self.inner.viewing) = session_id.map(str::to_string);
    }

    pub fn frames(&self) -> watch::Receiver<Option<SessionFrame>> {
        self.inner.manager.latest_frame()
    }

    pub fn recording_phase(&self) -> RecordingPhase {
        self.inner.recorder.phase()
    }

    pub fn recording_watch(&self) -> watch::Receiver<RecordingPhase> {
        self.inner.recorder.phase_watch()
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.inner.recorder.elapsed_secs()
    }

    /// Record the received frames. Refuses with `NoFrames` until a frame
    /// has arrived.
    pub async fn start_recording(&self) -> Result<String, RelayError> {
        let latest = self.latest_frame().ok_or(RelayError::NoFrames)?;
        let image = relay::decode_frame_image(&latest)?;

        self.inner.canvas.clear();
        self.inner.canvas.draw(&image);
        self.inner.recorder.start().await
    }

    /// Stop recording and upload the result
    pub async fn stop_recording(&self) -> Result<Option<MediaArtifact>, RelayError> {
        let (session_id, device_id) = {
            let joined = self.inner.joined.lock().await;
            match joined.as_ref() {
                Some(j) => (j.session_id.clone(), j.device_id.clone()),
                None => return self.inner.recorder.stop().await.map(|_| None),
            }
        };
        finalize_and_upload(
            self.inner.recorder.as_ref(),
            self.inner.directory.as_ref(),
            &device_id,
            &session_id,
            Some(&self.inner.recent),
        )
        .await
    }

    /// Upload the most recently received still
    pub async fn take_screenshot(&self) -> Result<MediaArtifact, RelayError> {
        let latest = self.latest_frame().ok_or(RelayError::NoFrames)?;
        let (session_id, device_id) = {
            let joined = self.inner.joined.lock().await;
            let joined = joined
                .as_ref()
                .ok_or_else(|| RelayError::Session("not viewing a session".to_string()))?;
            (joined.session_id.clone(), joined.device_id.clone())
        };

        let media = screenshot::still_from_frame(&latest)?;
        upload_media(
            media,
            self.inner.directory.as_ref(),
            &device_id,
            &session_id,
            Some(&self.inner.recent),
        )
        .await
    }
}

fn lock_sink(sink: &SharedSink) -> MutexGuard<'_, Option<Arc<dyn FrameSink>>> {
    sink.lock().unwrap_or_else(|p| p.into_inner())
}

fn lock_viewing(viewing: &StdMutex<Option<String>>) -> MutexGuard<'_, Option<String>> {
    viewing.lock().unwrap_or_else(|p| p.into_inner())
}

/// Render every frame of `session_id`; feed the canvas while recording
async fn render_frames(
    mut frames: watch::Receiver<Option<SessionFrame>>,
    session_id: String,
    canvas: FrameCanvas,
    recorder: Arc<FrameSequenceRecorder>,
    sink: SharedSink,
) {
    while frames.changed().await.is_ok() {
        let Some(frame) = frames.borrow_and_update().clone() else {
            continue;
        };
        if frame.session_id != session_id {
            continue;
        }

        let image = match relay::decode_frame_image(&frame.payload) {
            Ok(image) => image,
            Err(e) => {
                log::debug!("Undecodable frame in {}: {}", session_id, e);
                continue;
            }
        };
        let current = lock_sink(&sink).clone();
        if let Some(sink) = current {
            sink.render(&frame, &image);
        }
        if recorder.is_recording() {
            canvas.draw(&image);
        }
    }
}
