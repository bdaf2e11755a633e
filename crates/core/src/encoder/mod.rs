//! Per-stream H.264 encoding.
//!
//! [`H264Encoder`] wraps a pluggable [`EncoderBackend`]. The backend is
//! created lazily through an [`EncoderFactory`] on the first
//! [`encode`](H264Encoder::encode) call, so a stream nobody watches never
//! allocates codec state.
//!
//! After each encode the output is split into NAL units and the first SPS
//! and PPS seen are cached for SDP generation and periodic re-injection.

#[cfg(feature = "openh264")]
pub mod openh264;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use fast_image_resize::Resizer;
use parking_lot::{Mutex, RwLock};

use crate::config::StreamSettings;
use crate::error::{CameraError, Result};
use crate::frame::{self, Frame, Region};
use crate::media::h264::{self, H264Packetizer};

/// A raw codec producing H.264 Annex B output.
///
/// Implementations should favour latency: no B-frames, a fixed GOP of about
/// two seconds, real-time rate control.
pub trait EncoderBackend: Send {
    /// Encode one RGB24 frame of the configured size.
    ///
    /// Returns the Annex B bitstream for the frame, which may be empty when
    /// the codec skips it.
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>>;

    /// Make the next encoded frame an IDR picture.
    fn force_keyframe(&mut self) {}
}

/// Creates an [`EncoderBackend`] for a stream. An `Err` means the codec is
/// unavailable.
pub type EncoderFactory =
    Arc<dyn Fn(&StreamSettings) -> Result<Box<dyn EncoderBackend>> + Send + Sync>;

/// The factory used when none is injected: OpenH264 when compiled in.
pub fn default_encoder_factory() -> EncoderFactory {
    #[cfg(feature = "openh264")]
    {
        Arc::new(|settings: &StreamSettings| {
            let backend = openh264::OpenH264Backend::new(settings)?;
            Ok(Box::new(backend) as Box<dyn EncoderBackend>)
        })
    }
    #[cfg(not(feature = "openh264"))]
    {
        Arc::new(|_: &StreamSettings| {
            Err(CameraError::Encoder(
                "built without an H.264 encoder (enable the `openh264` feature)".into(),
            ))
        })
    }
}

/// Cached SPS and PPS NAL units, without start codes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
}

impl ParameterSets {
    /// Both sets, once both have been seen.
    pub fn both(&self) -> Option<(&[u8], &[u8])> {
        match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) => Some((sps, pps)),
            _ => None,
        }
    }
}

struct EncoderInner {
    backend: Option<Box<dyn EncoderBackend>>,
    resizer: Resizer,
}

/// Stateful encoder for one output stream.
///
/// `encode` is serialized by an internal lock; `parameter_sets` may be read
/// concurrently from other threads.
pub struct H264Encoder {
    settings: StreamSettings,
    factory: EncoderFactory,
    inner: Mutex<EncoderInner>,
    parameter_sets: RwLock<ParameterSets>,
    keyframe_requested: AtomicBool,
    frames_encoded: AtomicU64,
}

impl H264Encoder {
    pub fn new(settings: StreamSettings, factory: EncoderFactory) -> Self {
        Self {
            settings,
            factory,
            inner: Mutex::new(EncoderInner {
                backend: None,
                resizer: Resizer::new(),
            }),
            parameter_sets: RwLock::new(ParameterSets::default()),
            keyframe_requested: AtomicBool::new(false),
            frames_encoded: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().backend.is_some()
    }

    /// Number of frames passed to the backend since creation.
    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
    }

    /// Encode `frame` into NAL units (no start codes), in decode order.
    ///
    /// Frames that do not match the stream resolution are scaled first.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<Vec<u8>>> {
        let mut inner = self.inner.lock();

        if inner.backend.is_none() {
            let backend = (self.factory)(&self.settings).map_err(|e| {
                tracing::error!(stream = %self.settings.name, error = %e, "encoder initialization failed");
                e
            })?;
            tracing::info!(
                stream = %self.settings.name,
                width = self.settings.width,
                height = self.settings.height,
                fps = self.settings.fps,
                bitrate = self.settings.bitrate_bps,
                "H.264 encoder initialized"
            );
            inner.backend = Some(backend);
        }

        let scaled;
        let input = if frame.width() != self.settings.width || frame.height() != self.settings.height
        {
            scaled = frame::resize_region(
                &mut inner.resizer,
                frame,
                Region::full(frame),
                self.settings.width,
                self.settings.height,
            )?;
            &scaled
        } else {
            frame
        };

        let Some(backend) = inner.backend.as_mut() else {
            return Err(CameraError::Encoder("encoder closed".into()));
        };
        if self.keyframe_requested.swap(false, Ordering::AcqRel) {
            backend.force_keyframe();
        }
        let bitstream = backend.encode(input)?;
        drop(inner);

        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
        let nal_units = H264Packetizer::extract_nal_units(&bitstream);
        self.capture_parameter_sets(&nal_units);
        Ok(nal_units)
    }

    fn capture_parameter_sets(&self, nal_units: &[Vec<u8>]) {
        if self.parameter_sets.read().both().is_some() {
            return;
        }
        let mut sets = self.parameter_sets.write();
        for nal in nal_units {
            match h264::nal_type(nal) {
                Some(h264::NAL_SPS) if sets.sps.is_none() => {
                    tracing::debug!(stream = %self.settings.name, bytes = nal.len(), "SPS captured");
                    sets.sps = Some(nal.clone());
                }
                Some(h264::NAL_PPS) if sets.pps.is_none() => {
                    tracing::debug!(stream = %self.settings.name, bytes = nal.len(), "PPS captured");
                    sets.pps = Some(nal.clone());
                }
                _ => {}
            }
        }
    }

    pub fn parameter_sets(&self) -> ParameterSets {
        self.parameter_sets.read().clone()
    }

    /// Ask for an IDR picture on the next encode.
    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::Release);
    }

    /// Release the backend. Safe to call repeatedly; a later `encode`
    /// initializes a fresh backend.
    pub fn close(&self) {
        if self.inner.lock().backend.take().is_some() {
            tracing::debug!(stream = %self.settings.name, "H.264 encoder closed");
        }
    }
}
