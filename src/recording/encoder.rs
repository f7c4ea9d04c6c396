//! H.264 in MP4, via openh264 and muxide

use std::fs::File;
use std::io::BufWriter;

use bytes::Bytes;
use image::RgbImage;
use muxide::api::{Metadata, Muxer, MuxerBuilder, VideoCodec};
use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;
use tempfile::NamedTempFile;

use super::backend::{ChunkEncoder, EncoderBackend, VideoFormat};
use super::mime;
use crate::errors::RelayError;

/// H.264 encoder over RGB frames
pub struct H264Encoder {
    encoder: Encoder,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl H264Encoder {
    /// Dimensions must be even; the encoder infers them from each frame
    pub fn new(width: u32, height: u32) -> Result<Self, RelayError> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(RelayError::Encoding(format!(
                "H.264 needs even, non-zero dimensions, got {}x{}",
                width, height
            )));
        }
        let encoder = Encoder::new()
            .map_err(|e| RelayError::Encoding(format!("Failed to create encoder: {}", e)))?;

        Ok(Self {
            encoder,
            width,
            height,
            frame_count: 0,
        })
    }

    /// Annex B NAL units for one frame, plus whether it is a keyframe
    pub fn encode_rgb(&mut self, rgb_data: &[u8]) -> Result<(Vec<u8>, bool), RelayError> {
        let expected_size = (self.width * self.height * 3) as usize;
        if rgb_data.len() != expected_size {
            return Err(RelayError::Encoding(format!(
                "Invalid frame size: expected {} bytes, got {}",
                expected_size,
                rgb_data.len()
            )));
        }

        let yuv = rgb_to_yuv420(rgb_data, self.width, self.height);
        let yuv_buffer = YUVBuffer::from_vec(yuv, self.width as usize, self.height as usize);

        let bitstream = self
            .encoder
            .encode(&yuv_buffer)
            .map_err(|e| RelayError::Encoding(format!("Encoding failed: {}", e)))?;

        self.frame_count += 1;
        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        Ok((bitstream.to_vec(), is_keyframe))
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

/// BT.601 RGB24 to planar YUV420
fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;

    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        for x in 0..w {
            let rgb_idx = (y * w + x) * 3;
            let r = rgb[rgb_idx] as i32;
            let g = rgb[rgb_idx + 1] as i32;
            let b = rgb[rgb_idx + 2] as i32;

            let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[y * w + x] = y_val.clamp(0, 255) as u8;

            if y % 2 == 0 && x % 2 == 0 {
                let uv_idx = (y / 2) * (w / 2) + (x / 2);
                let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv_idx] = u_val.clamp(0, 255) as u8;
                v_plane[uv_idx] = v_val.clamp(0, 255) as u8;
            }
        }
    }

    yuv
}

/// `video/mp4` (`avc1`) backend
#[derive(Debug, Default)]
pub struct Mp4H264Backend;

impl Mp4H264Backend {
    pub fn new() -> Self {
        Self
    }
}

impl EncoderBackend for Mp4H264Backend {
    fn name(&self) -> &str {
        "mp4-h264"
    }

    fn is_supported(&self, mime_type: &str) -> bool {
        mime::base_type(mime_type) == mime::MP4
            && mime::codecs(mime_type).map_or(true, |c| c.starts_with("avc1"))
    }

    fn create(&self, mime_type: &str, format: VideoFormat) -> Result<Box<dyn ChunkEncoder>, RelayError> {
        if !self.is_supported(mime_type) {
            return Err(RelayError::Recording(format!(
                "{} cannot encode {}",
                self.name(),
                mime_type
            )));
        }
        Ok(Box::new(Mp4Encoder::new(format)?))
    }
}

/// Muxes into a scratch file; the whole file is the single final chunk
struct Mp4Encoder {
    encoder: H264Encoder,
    muxer: Muxer<BufWriter<File>>,
    scratch: NamedTempFile,
    width: u32,
    height: u32,
}

impl Mp4Encoder {
    fn new(format: VideoFormat) -> Result<Self, RelayError> {
        let width = format.width & !1;
        let height = format.height & !1;
        let encoder = H264Encoder::new(width, height)?;

        let scratch = tempfile::Builder::new()
            .prefix("camrelay-")
            .suffix(".mp4")
            .tempfile()
            .map_err(|e| RelayError::Io(format!("Failed to create scratch file: {}", e)))?;
        let file = scratch
            .reopen()
            .map_err(|e| RelayError::Io(format!("Failed to open scratch file: {}", e)))?;

        let muxer = MuxerBuilder::new(BufWriter::new(file))
            .video(VideoCodec::H264, width, height, f64::from(format.fps.max(1)))
            .with_fast_start(true)
            .with_metadata(Metadata::new().with_current_time())
            .build()
            .map_err(|e| RelayError::Encoding(format!("Failed to create muxer: {}", e)))?;

        Ok(Self {
            encoder,
            muxer,
            scratch,
            width,
            height,
        })
    }
}

impl ChunkEncoder for Mp4Encoder {
    fn push_frame(&mut self, frame: &RgbImage, pts_secs: f64) -> Result<Vec<Bytes>, RelayError> {
        let fitted;
        let frame = if frame.dimensions() != (self.width, self.height) {
            fitted = image::imageops::resize(
                frame,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            );
            &fitted
        } else {
            frame
        };

        let (data, is_keyframe) = self.encoder.encode_rgb(frame.as_raw())?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        self.muxer
            .write_video(pts_secs, &data, is_keyframe)
            .map_err(|e| RelayError::Encoding(format!("Failed to write frame: {}", e)))?;
        Ok(Vec::new())
    }

    fn finish(self: Box<Self>) -> Result<Vec<Bytes>, RelayError> {
        let Mp4Encoder {
            muxer,
            scratch,
            encoder,
            ..
        } = *self;

        let result = muxer
            .finish_with_stats()
            .map_err(|e| RelayError::Encoding(format!("Failed to finalize recording: {}", e)))
            .and_then(|stats| {
                log::debug!(
                    "MP4 finalized: {} frames, {:.1}s, {} bytes",
                    stats.video_frames,
                    stats.duration_secs,
                    stats.bytes_written
                );
                std::fs::read(scratch.path()).map_err(RelayError::from)
            });
        // Deletes the scratch file
        drop(scratch);

        let bytes = result?;
        if encoder.frame_count() == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![Bytes::from(bytes)])
    }
}
