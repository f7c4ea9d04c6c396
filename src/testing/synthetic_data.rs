//! Synthetic capture devices
//!
//! Stand-ins for real cameras so the whole session flow can run offline.
//! Frames are moving gradients, so consecutive frames differ and encoders
//! see real temporal change.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::capture::{CaptureConstraints, CaptureStream, MediaDevices};
use crate::errors::RelayError;

/// Gradient test frame; the pattern shifts with `frame_number`
pub fn synthetic_video_frame(frame_number: u64, width: u32, height: u32) -> RgbImage {
    let base = (frame_number % 256) as u8;
    RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            base.wrapping_add((x % 256) as u8),
            base.wrapping_add((y % 256) as u8),
            base.wrapping_add(((x + y) % 256) as u8),
        ])
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Default)]
struct DeviceScript {
    failures: VecDeque<RelayError>,
    attempts: Vec<CaptureConstraints>,
    opened: Vec<Arc<SyntheticCaptureStream>>,
}

/// `MediaDevices` whose failures can be scripted per attempt
#[derive(Clone)]
pub struct SyntheticDevices {
    width: u32,
    height: u32,
    fps: u32,
    script: Arc<Mutex<DeviceScript>>,
}

impl SyntheticDevices {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fps: 30,
            script: Arc::new(Mutex::new(DeviceScript::default())),
        }
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps.max(1);
        self
    }

    /// Make the next open attempt fail with `error`; calls queue up
    pub fn fail_next(&self, error: RelayError) {
        lock(&self.script).failures.push_back(error);
    }

    /// Constraints of every open attempt, in order
    pub fn attempts(&self) -> Vec<CaptureConstraints> {
        lock(&self.script).attempts.clone()
    }

    /// Streams handed out so far
    pub fn opened(&self) -> Vec<Arc<SyntheticCaptureStream>> {
        lock(&self.script).opened.clone()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Arc<dyn CaptureStream>, RelayError> {
        let mut script = lock(&self.script);
        script.attempts.push(constraints.clone());
        if let Some(error) = script.failures.pop_front() {
            return Err(error);
        }

        let (width, height) = constraints
            .ideal_resolution
            .map(|(w, h)| (w.min(self.width), h.min(self.height)))
            .unwrap_or((self.width, self.height));
        let label = constraints
            .device_id
            .clone()
            .unwrap_or_else(|| "synthetic camera".to_string());
        let stream = SyntheticCaptureStream::start(label, width, height, self.fps, constraints.audio);
        script.opened.push(Arc::clone(&stream));
        Ok(stream as Arc<dyn CaptureStream>)
    }
}

/// Gradient stream produced by a ticker task
pub struct SyntheticCaptureStream {
    label: String,
    width: u32,
    height: u32,
    fps: u32,
    audio: bool,
    frame_count: AtomicU64,
    latest: Mutex<Option<Arc<RgbImage>>>,
    frames: broadcast::Sender<Arc<RgbImage>>,
    stopped: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticCaptureStream {
    pub fn start(label: String, width: u32, height: u32, fps: u32, audio: bool) -> Arc<Self> {
        let (frames, _) = broadcast::channel(8);
        let stream = Arc::new(Self {
            label,
            width,
            height,
            fps: fps.max(1),
            audio,
            frame_count: AtomicU64::new(0),
            latest: Mutex::new(None),
            frames,
            stopped: AtomicBool::new(false),
            ticker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&stream);
        // interval() panics on a zero period
        let period = Duration::from_millis((1000 / u64::from(stream.fps)).max(1));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(stream) = weak.upgrade() else { return };
                stream.produce_frame();
            }
        });
        *lock(&stream.ticker) = Some(task);
        stream
    }

    fn produce_frame(&self) {
        let n = self.frame_count.fetch_add(1, Ordering::SeqCst);
        let frame = Arc::new(synthetic_video_frame(n, self.width, self.height));
        *lock(&self.latest) = Some(Arc::clone(&frame));
        let _ = self.frames.send(frame);
    }

    pub fn frames_produced(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl CaptureStream for SyntheticCaptureStream {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        lock(&self.latest)
            .as_ref()
            .map(|frame| frame.dimensions())
    }

    fn snapshot(&self) -> Option<RgbImage> {
        lock(&self.latest).as_deref().cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<RgbImage>> {
        self.frames.subscribe()
    }

    fn frame_rate(&self) -> u32 {
        self.fps
    }

    fn has_audio(&self) -> bool {
        self.audio
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = lock(&self.ticker).take() {
            task.abort();
        }
        *lock(&self.latest) = None;
        log::debug!("Synthetic camera {} stopped", self.label);
    }
}

impl Drop for SyntheticCaptureStream {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.ticker).take() {
            task.abort();
        }
    }
}
