//! Recorders
//!
//! One [`Recorder`] drives both recording variants. What differs is the
//! [`RecordingSource`]: a live camera stream for the camera role, or a
//! [`FrameCanvas`] that the viewer redraws with every received still.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use image::RgbImage;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::backend::{EncoderBackend, VideoFormat};
use super::mime;
use crate::capture::CaptureStream;
use crate::config::RecordingConfig;
use crate::directory::{MediaUpload, SessionDirectory};
use crate::errors::RelayError;
use crate::recent::RecentMedia;
use crate::types::{MediaArtifact, MediaKind};

const FEED_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingPhase {
    NotRecording,
    Recording,
    /// Stopped, encoder still flushing
    Finalizing,
}

/// A finished, not yet uploaded, media object
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMedia {
    pub kind: MediaKind,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
}

impl RecordedMedia {
    pub fn into_upload(self, device_id: &str, session_id: &str) -> MediaUpload {
        MediaUpload {
            file_name: self.file_name,
            mime_type: self.mime_type,
            bytes: self.bytes,
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            width: self.width,
            height: self.height,
            duration_secs: self.duration_secs,
        }
    }
}

/// Frames for one recording; dropping it stops the producer
pub struct FrameFeed {
    pub rx: mpsc::Receiver<Arc<RgbImage>>,
    task: JoinHandle<()>,
}

impl FrameFeed {
    pub fn new(rx: mpsc::Receiver<Arc<RgbImage>>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }
}

impl Drop for FrameFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Where a recorder's frames come from
pub trait RecordingSource: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    /// Geometry of the frames `open_feed` will produce
    fn format(&self) -> Result<VideoFormat, RelayError>;

    fn open_feed(&self) -> FrameFeed;
}

struct ActiveRecording {
    mime_type: String,
    format: VideoFormat,
    stop: oneshot::Sender<()>,
    encode: JoinHandle<Result<Vec<Bytes>, RelayError>>,
    ticker: JoinHandle<()>,
}

/// Encode/accumulate/finalize state machine shared by both variants
pub struct Recorder<S: RecordingSource> {
    source: S,
    backend: Arc<dyn EncoderBackend>,
    preferences: Vec<String>,
    phase: watch::Sender<RecordingPhase>,
    elapsed: Arc<AtomicU64>,
    active: tokio::sync::Mutex<Option<ActiveRecording>>,
}

pub type LiveStreamRecorder = Recorder<LiveStreamSource>;
pub type FrameSequenceRecorder = Recorder<FrameCanvas>;

impl<S: RecordingSource> Recorder<S> {
    pub fn new(source: S, backend: Arc<dyn EncoderBackend>, config: &RecordingConfig) -> Self {
        let (phase, _) = watch::channel(RecordingPhase::NotRecording);
        Self {
            source,
            backend,
            preferences: config.mime_preferences.clone(),
            phase,
            elapsed: Arc::new(AtomicU64::new(0)),
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn phase(&self) -> RecordingPhase {
        *self.phase.borrow()
    }

    pub fn phase_watch(&self) -> watch::Receiver<RecordingPhase> {
        self.phase.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.phase() == RecordingPhase::Recording
    }

    /// Whole seconds since `start`
    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed.load(Ordering::SeqCst)
    }

    /// MIME type this recorder would encode with
    pub fn selected_mime(&self) -> Option<String> {
        mime::select_mime(&self.preferences, self.backend.as_ref())
    }

    /// Begin recording. Returns the MIME type selected for the output.
    pub async fn start(&self) -> Result<String, RelayError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(RelayError::Recording("a recording is already running".into()));
        }

        let mime_type = self.selected_mime().ok_or_else(|| {
            RelayError::Recording(format!(
                "none of the preferred formats can be encoded here: {}",
                self.preferences.join(", ")
            ))
        })?;
        let format = self.source.format()?;
        let mut encoder = self.backend.create(&mime_type, format)?;
        let mut feed = self.source.open_feed();

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let fps = f64::from(format.fps.max(1));
        let kind = self.source.kind();
        let encode = tokio::spawn(async move {
            let mut chunks = Vec::new();
            let mut index = 0u64;
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = &mut stop_rx => None,
                    frame = feed.rx.recv() => frame,
                };
                let Some(frame) = frame else { break };

                // Encoders are CPU bound; keep them off the runtime workers
                let pts = index as f64 / fps;
                let (returned, pushed) = tokio::task::spawn_blocking(move || {
                    let pushed = encoder.push_frame(&frame, pts);
                    (encoder, pushed)
                })
                .await
                .map_err(|e| RelayError::Encoding(format!("Frame encode task failed: {}", e)))?;
                encoder = returned;
                chunks.extend(pushed?);
                index += 1;
            }
            drop(feed);
            log::debug!("{} recorder encoded {} frame(s)", kind, index);
            let trailing = tokio::task::spawn_blocking(move || encoder.finish())
                .await
                .map_err(|e| RelayError::Encoding(format!("Finalize task failed: {}", e)))??;
            chunks.extend(trailing);
            Ok::<Vec<Bytes>, RelayError>(chunks)
        });

        self.elapsed.store(0, Ordering::SeqCst);
        let elapsed = Arc::clone(&self.elapsed);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                interval.tick().await;
                elapsed.fetch_add(1, Ordering::SeqCst);
            }
        });

        *active = Some(ActiveRecording {
            mime_type: mime_type.clone(),
            format,
            stop: stop_tx,
            encode,
            ticker,
        });
        self.phase.send_replace(RecordingPhase::Recording);
        log::info!("{} recording started as {}", kind, mime_type);
        Ok(mime_type)
    }

    /// Stop and finalize.
    ///
    /// The phase always ends at `NotRecording`, also on failure. `Ok(None)`
    /// means nothing was recording or nothing was captured.
    pub async fn stop(&self) -> Result<Option<RecordedMedia>, RelayError> {
        let mut active = self.active.lock().await;
        let Some(recording) = active.take() else {
            return Ok(None);
        };

        self.phase.send_replace(RecordingPhase::Finalizing);
        recording.ticker.abort();
        let _ = recording.stop.send(());

        let outcome = match recording.encode.await {
            Ok(result) => result,
            Err(e) => Err(RelayError::Recording(format!("encoder task failed: {}", e))),
        };
        let duration = self.elapsed.load(Ordering::SeqCst);
        self.phase.send_replace(RecordingPhase::NotRecording);

        let chunks = match outcome {
            Ok(chunks) => chunks,
            Err(e) => {
                log::error!("Recording could not be finalized: {}", e);
                return Err(e);
            }
        };
        self.elapsed.store(0, Ordering::SeqCst);

        let mut buffer = BytesMut::new();
        for chunk in &chunks {
            buffer.extend_from_slice(chunk);
        }
        if buffer.is_empty() {
            log::warn!("Recording produced no data; nothing to upload");
            return Ok(None);
        }

        let file_name = format!(
            "recording_{}.{}",
            chrono::Utc::now().timestamp_millis(),
            mime::extension_for(&recording.mime_type)
        );
        log::info!(
            "Recording finalized: {} ({} bytes, {} chunk(s))",
            file_name,
            buffer.len(),
            chunks.len()
        );
        Ok(Some(RecordedMedia {
            kind: MediaKind::Video,
            file_name,
            mime_type: recording.mime_type,
            bytes: buffer.freeze(),
            width: Some(recording.format.width),
            height: Some(recording.format.height),
            duration_secs: Some(duration as f64),
        }))
    }
}

impl<S: RecordingSource> Drop for Recorder<S> {
    fn drop(&mut self) {
        if let Some(recording) = self.active.get_mut().take() {
            recording.ticker.abort();
            recording.encode.abort();
        }
    }
}

/// Stop `recorder` and hand the result to the directory.
///
/// Upload failures are logged and returned, but the recorder is already
/// back at `NotRecording` by then.
pub async fn finalize_and_upload<S: RecordingSource>(
    recorder: &Recorder<S>,
    directory: &dyn SessionDirectory,
    device_id: &str,
    session_id: &str,
    recent: Option<&RecentMedia>,
) -> Result<Option<MediaArtifact>, RelayError> {
    let Some(media) = recorder.stop().await? else {
        return Ok(None);
    };
    upload_media(media, directory, device_id, session_id, recent)
        .await
        .map(Some)
}

/// Upload a finished artifact and register it locally
pub async fn upload_media(
    media: RecordedMedia,
    directory: &dyn SessionDirectory,
    device_id: &str,
    session_id: &str,
    recent: Option<&RecentMedia>,
) -> Result<MediaArtifact, RelayError> {
    let kind = media.kind;
    let file_name = media.file_name.clone();
    match directory
        .upload(kind, media.into_upload(device_id, session_id))
        .await
    {
        Ok(artifact) => {
            if let Some(recent) = recent {
                recent.register(artifact.clone());
            }
            Ok(artifact)
        }
        Err(e) => {
            log::error!("Upload of {} {} failed: {}", kind, file_name, e);
            Err(e)
        }
    }
}

/// Frames straight from the camera
pub struct LiveStreamSource {
    stream: Arc<dyn CaptureStream>,
}

impl LiveStreamSource {
    pub fn new(stream: Arc<dyn CaptureStream>) -> Self {
        Self { stream }
    }
}

impl RecordingSource for LiveStreamSource {
    fn kind(&self) -> &'static str {
        "live-stream"
    }

    fn format(&self) -> Result<VideoFormat, RelayError> {
        let (width, height) = self.stream.dimensions().ok_or_else(|| {
            RelayError::Stream("camera has not produced a frame yet".to_string())
        })?;
        Ok(VideoFormat {
            width,
            height,
            fps: self.stream.frame_rate().max(1),
        })
    }

    fn open_feed(&self) -> FrameFeed {
        let mut frames = self.stream.subscribe();
        let (tx, rx) = mpsc::channel(FEED_QUEUE);
        let task = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("Live recorder skipped {} frame(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        FrameFeed::new(rx, task)
    }
}

#[derive(Default)]
struct Surface {
    image: Option<Arc<RgbImage>>,
    draws: u64,
}

/// Off-screen surface the viewer paints received stills onto.
///
/// Sized by the first frame drawn after a `clear`; later frames of a
/// different size are scaled to fit. Its feed samples the surface at a
/// fixed rate, turning discrete stills into a continuous stream.
#[derive(Clone)]
pub struct FrameCanvas {
    surface: Arc<Mutex<Surface>>,
    fps: u32,
}

impl FrameCanvas {
    /// Highest rate the feed samples at; `fps` is clamped to `1..=60`
    pub const MAX_FPS: u32 = 60;

    pub fn new(fps: u32) -> Self {
        Self {
            surface: Arc::new(Mutex::new(Surface::default())),
            fps: fps.clamp(1, Self::MAX_FPS),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Surface> {
        self.surface.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn draw(&self, frame: &RgbImage) {
        let mut surface = self.lock();
        let image = match &surface.image {
            Some(current) if current.dimensions() != frame.dimensions() => {
                let (width, height) = current.dimensions();
                image::imageops::resize(
                    frame,
                    width,
                    height,
                    image::imageops::FilterType::Triangle,
                )
            }
            _ => frame.clone(),
        };
        surface.image = Some(Arc::new(image));
        surface.draws += 1;
    }

    pub fn clear(&self) {
        *self.lock() = Surface::default();
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.lock().image.as_ref().map(|i| i.dimensions())
    }

    /// Frames drawn since the last `clear`
    pub fn draw_count(&self) -> u64 {
        self.lock().draws
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    fn current(&self) -> Option<Arc<RgbImage>> {
        self.lock().image.clone()
    }
}

impl RecordingSource for FrameCanvas {
    fn kind(&self) -> &'static str {
        "frame-sequence"
    }

    fn format(&self) -> Result<VideoFormat, RelayError> {
        let (width, height) = self.dimensions().ok_or(RelayError::NoFrames)?;
        Ok(VideoFormat {
            width,
            height,
            fps: self.fps,
        })
    }

    fn open_feed(&self) -> FrameFeed {
        let canvas = self.clone();
        let (tx, rx) = mpsc::channel(FEED_QUEUE);
        let period = Duration::from_millis((1000 / u64::from(self.fps)).max(1));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(frame) = canvas.current() else { continue };
                match tx.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::debug!("Frame-sequence encoder behind, sample dropped")
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        });
        FrameFeed::new(rx, task)
    }
}
