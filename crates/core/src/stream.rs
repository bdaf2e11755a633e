use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::StreamSettings;
use crate::encoder::{EncoderFactory, H264Encoder, ParameterSets};
use crate::error::Result;
use crate::frame::Frame;
use crate::media::{self, EncodedFrame};

/// Encoded frames kept for sessions that are slightly behind.
const RING_CAPACITY: usize = 16;

/// Bounded history of the most recent encoded frames of one stream.
///
/// Publishing swaps in a complete `Arc<EncodedFrame>` under the lock, so a
/// reader sees either the previous frame or the new one, never a partial
/// frame.
pub struct FrameRing {
    frames: Mutex<VecDeque<Arc<EncodedFrame>>>,
    ready: Condvar,
}

impl FrameRing {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            ready: Condvar::new(),
        }
    }

    pub fn push(&self, frame: Arc<EncodedFrame>) {
        let mut frames = self.frames.lock();
        if frames.len() == RING_CAPACITY {
            frames.pop_front();
        }
        frames.push_back(frame);
        drop(frames);
        self.ready.notify_all();
    }

    /// Sequence of the newest frame, or 0 before the first publish.
    pub fn latest_sequence(&self) -> u64 {
        self.frames.lock().back().map_or(0, |f| f.sequence)
    }

    /// The oldest retained frame newer than `after`, waiting up to `timeout`
    /// for one to be published.
    pub fn next_after(&self, after: u64, timeout: Duration) -> Option<Arc<EncodedFrame>> {
        let mut frames = self.frames.lock();
        loop {
            if let Some(frame) = frames.iter().find(|f| f.sequence > after) {
                return Some(frame.clone());
            }
            if self.ready.wait_for(&mut frames, timeout).timed_out() {
                return frames.iter().find(|f| f.sequence > after).cloned();
            }
        }
    }

    /// Wake every waiting reader without publishing.
    pub fn wake_all(&self) {
        self.ready.notify_all();
    }
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

/// A named output stream (e.g. `main`, `sub`).
///
/// Owns the stream's encoder and frame history and tracks which sessions are
/// playing it. Frames are encoded only while at least one session plays,
/// and at most once per submitted frame no matter how many sessions there
/// are.
pub struct Stream {
    settings: StreamSettings,
    encoder: H264Encoder,
    frames: FrameRing,
    viewers: RwLock<HashSet<String>>,
    /// Serializes encode+publish; holds the number of published frames.
    published: Mutex<u64>,
}

impl Stream {
    pub fn new(settings: StreamSettings, factory: EncoderFactory) -> Self {
        Self {
            encoder: H264Encoder::new(settings.clone(), factory),
            settings,
            frames: FrameRing::new(),
            viewers: RwLock::new(HashSet::new()),
            published: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn encoder(&self) -> &H264Encoder {
        &self.encoder
    }

    pub fn frames(&self) -> &FrameRing {
        &self.frames
    }

    pub fn parameter_sets(&self) -> ParameterSets {
        self.encoder.parameter_sets()
    }

    /// Mark a session as playing this stream.
    pub fn add_viewer(&self, session_id: &str) {
        if self.viewers.write().insert(session_id.to_string()) {
            tracing::debug!(stream = %self.settings.name, session_id, "viewer added");
        }
    }

    pub fn remove_viewer(&self, session_id: &str) {
        if self.viewers.write().remove(session_id) {
            tracing::debug!(stream = %self.settings.name, session_id, "viewer removed");
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.read().len()
    }

    pub fn has_viewers(&self) -> bool {
        !self.viewers.read().is_empty()
    }

    /// Encode and publish `frame` if anyone is watching.
    ///
    /// Returns `Ok(false)` when there are no viewers (the encoder is not
    /// touched) or the codec produced no output for this frame.
    pub fn publish(&self, frame: &Frame) -> Result<bool> {
        if !self.has_viewers() {
            return Ok(false);
        }

        let mut published = self.published.lock();
        let nal_units = self.encoder.encode(frame)?;
        if nal_units.is_empty() {
            tracing::trace!(stream = %self.settings.name, "encoder produced no output");
            return Ok(false);
        }

        let pts = media::frame_timestamp(*published, self.settings.fps);
        *published += 1;
        let encoded = Arc::new(EncodedFrame {
            sequence: *published,
            nal_units,
            pts,
        });
        tracing::trace!(
            stream = %self.settings.name,
            sequence = encoded.sequence,
            pts,
            nals = encoded.nal_units.len(),
            bytes = encoded.byte_len(),
            "frame published"
        );
        self.frames.push(encoded);
        Ok(true)
    }

    /// RTP timestamp the next published frame will carry.
    pub fn next_pts(&self) -> u32 {
        media::frame_timestamp(*self.published.lock(), self.settings.fps)
    }

    /// Frames published so far.
    pub fn frames_published(&self) -> u64 {
        *self.published.lock()
    }

    pub fn request_keyframe(&self) {
        self.encoder.request_keyframe();
    }

    pub fn close(&self) {
        self.encoder.close();
        self.frames.wake_all();
    }
}

/// Registry of output streams, keyed by name.
#[derive(Clone)]
pub struct StreamRegistry {
    streams: Arc<RwLock<HashMap<String, Arc<Stream>>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a stream. Replaces any existing stream with the same name.
    pub fn add(&self, settings: StreamSettings, factory: EncoderFactory) -> Arc<Stream> {
        let name = settings.name.clone();
        let stream = Arc::new(Stream::new(settings, factory));
        self.streams.write().insert(name.clone(), stream.clone());
        tracing::info!(stream = %name, "stream registered");
        stream
    }

    pub fn get(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.read().get(name).cloned()
    }

    /// Resolve the stream addressed by an RTSP URI.
    pub fn resolve_from_uri(&self, uri: &str) -> Option<Arc<Stream>> {
        self.get(extract_stream_name(uri)?)
    }

    pub fn all(&self) -> Vec<Arc<Stream>> {
        self.streams.read().values().cloned().collect()
    }

    /// Remove a session from every stream's viewer set.
    pub fn remove_viewer_all(&self, session_id: &str) {
        for stream in self.streams.read().values() {
            stream.remove_viewer(session_id);
        }
    }

    pub fn close_all(&self) {
        for stream in self.streams.read().values() {
            stream.close();
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the stream name from an RTSP URI.
///
/// `rtsp://host:8554/main/track1` → `main`
/// `rtsp://host:8554/main/`       → `main`
/// `/sub`                         → `sub`
/// `rtsp://host:8554`, `*`        → `None`
pub fn extract_stream_name(uri: &str) -> Option<&str> {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        &after[after.find('/')?..]
    } else if uri.starts_with('/') {
        uri
    } else {
        return None;
    };

    let path = path.split(['?', '#']).next().unwrap_or(path);
    let path = match path.rfind("/track") {
        Some(pos) => &path[..pos],
        None => path,
    };
    let name = path.trim_matches('/');
    (!name.is_empty()).then_some(name)
}
