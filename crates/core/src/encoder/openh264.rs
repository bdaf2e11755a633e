//! In-process H.264 via Cisco's OpenH264.

use openh264::OpenH264API;
use openh264::encoder::{
    BitRate, Encoder, EncoderConfig, FrameRate, IntraFramePeriod, UsageType,
};
use openh264::formats::{RgbSliceU8, YUVBuffer};

use super::EncoderBackend;
use crate::config::StreamSettings;
use crate::error::{CameraError, Result};
use crate::frame::Frame;

/// OpenH264 configured for camera real-time use: baseline-style output
/// without B-frames and an IDR every two seconds.
pub struct OpenH264Backend {
    encoder: Encoder,
    width: u32,
    height: u32,
}

impl OpenH264Backend {
    pub fn new(settings: &StreamSettings) -> Result<Self> {
        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(settings.bitrate_bps))
            .max_frame_rate(FrameRate::from_hz(settings.fps as f32))
            .usage_type(UsageType::CameraVideoRealTime)
            .intra_frame_period(IntraFramePeriod::from_num_frames(settings.fps * 2));

        let encoder = Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| CameraError::Encoder(format!("openh264 init: {e}")))?;

        Ok(Self {
            encoder,
            width: settings.width,
            height: settings.height,
        })
    }
}

impl EncoderBackend for OpenH264Backend {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(CameraError::Encoder(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        let rgb = RgbSliceU8::new(frame.data(), (frame.width() as usize, frame.height() as usize));
        let yuv = YUVBuffer::from_rgb_source(rgb);
        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| CameraError::Encoder(format!("openh264 encode: {e}")))?;
        Ok(bitstream.to_vec())
    }

    fn force_keyframe(&mut self) {
        self.encoder.force_intra_frame();
    }
}
