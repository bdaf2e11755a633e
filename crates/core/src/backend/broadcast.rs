//! Low-fidelity JPEG preview.
//!
//! Frames are JPEG-encoded only while someone is subscribed and handed to
//! every subscriber over a bounded channel. A subscriber that falls behind
//! loses frames; it never slows down the others or the caller.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use parking_lot::Mutex;

use super::FrameSink;
use crate::error::{CameraError, Result};
use crate::frame::Frame;

/// Frames buffered per subscriber.
pub const SUBSCRIBER_QUEUE: usize = 2;

/// Boundary of the `multipart/x-mixed-replace` stream.
pub const MULTIPART_BOUNDARY: &str = "frame";

pub type JpegFrame = Arc<Vec<u8>>;

/// `Content-Type` of an MJPEG-over-HTTP response.
pub fn multipart_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={MULTIPART_BOUNDARY}")
}

/// One part of the multipart stream: boundary, part headers, JPEG bytes.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--{MULTIPART_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    )
    .into_bytes();
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Encode an RGB24 frame as baseline JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .write_image(
            frame.data(),
            frame.width(),
            frame.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| CameraError::Encoder(format!("JPEG: {e}")))?;
    Ok(out)
}

/// Receiving end of a broadcast subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: Receiver<JpegFrame>,
    _alive: Arc<()>,
}

impl Deref for Subscription {
    type Target = Receiver<JpegFrame>;

    fn deref(&self) -> &Self::Target {
        &self.rx
    }
}

struct Subscriber {
    tx: Sender<JpegFrame>,
    alive: Weak<()>,
}

/// Fan-out hub for the JPEG preview.
pub struct BroadcastHub {
    quality: u8,
    subscribers: Mutex<Vec<Subscriber>>,
    frames_encoded: AtomicU64,
}

impl BroadcastHub {
    pub fn new(quality: u8) -> Self {
        Self {
            quality,
            subscribers: Mutex::new(Vec::new()),
            frames_encoded: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = crossbeam_channel::bounded(SUBSCRIBER_QUEUE);
        let alive = Arc::new(());
        let mut subscribers = self.subscribers.lock();
        subscribers.push(Subscriber {
            tx,
            alive: Arc::downgrade(&alive),
        });
        tracing::debug!(subscribers = subscribers.len(), "broadcast subscriber added");
        Subscription { rx, _alive: alive }
    }

    /// Live subscribers. Forgets the ones that were dropped.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.alive.strong_count() > 0);
        subscribers.len()
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
    }

    /// Encode `frame` once and offer it to every subscriber. Returns how
    /// many subscribers received it.
    pub fn publish(&self, frame: &Frame) -> Result<usize> {
        if self.subscriber_count() == 0 {
            return Ok(0);
        }
        let jpeg: JpegFrame = Arc::new(encode_jpeg(frame, self.quality)?);
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        self.subscribers.lock().retain(|s| match s.tx.try_send(jpeg.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::trace!("broadcast subscriber behind, frame dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        Ok(delivered)
    }
}

impl FrameSink for BroadcastHub {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn has_consumers(&self) -> bool {
        self.subscriber_count() > 0
    }

    fn send_frame(&self, frame: &Arc<Frame>) -> Result<bool> {
        Ok(self.publish(frame)? > 0)
    }

    fn stop(&self) {
        // Dropping the senders disconnects every receiver.
        self.subscribers.lock().clear();
    }
}
