//! Recording pipeline
//!
//! Two recorder variants share one contract: pick the first encodable
//! format from the preference list, accumulate chunks while recording,
//! finalize into one artifact whose MIME type is the one actually used, and
//! upload it tagged with device and session.
//!
//! - [`LiveStreamRecorder`] encodes a live camera stream (camera role).
//! - [`FrameSequenceRecorder`] samples a [`FrameCanvas`] the viewer paints
//!   received stills onto, at a fixed low rate.
//!
//! The built-in Motion-JPEG backend is always available. The `recording`
//! feature adds H.264 in MP4 via openh264 and muxide.
//!
//! # Example
//! ```rust,ignore
//! use camrelay::recording::{BackendRegistry, FrameCanvas, FrameSequenceRecorder};
//!
//! let canvas = FrameCanvas::new(5);
//! let recorder = FrameSequenceRecorder::new(canvas.clone(), Arc::new(BackendRegistry::default()), &config);
//! canvas.draw(&first_frame);
//! recorder.start().await?;
//! // ...
//! let media = recorder.stop().await?;
//! ```

mod backend;
#[cfg(feature = "recording")]
mod encoder;
pub mod mime;
mod recorder;
pub mod screenshot;

pub use backend::{BackendRegistry, ChunkEncoder, EncoderBackend, MotionJpegBackend, VideoFormat};
#[cfg(feature = "recording")]
pub use encoder::{H264Encoder, Mp4H264Backend};
pub use recorder::{
    finalize_and_upload, upload_media, FrameCanvas, FrameFeed, FrameSequenceRecorder,
    LiveStreamRecorder, LiveStreamSource, RecordedMedia, Recorder, RecordingPhase,
    RecordingSource,
};
