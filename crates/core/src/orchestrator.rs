//! Backend selection and per-frame fan-out.
//!
//! On [`start`](Orchestrator::start) the orchestrator picks the best
//! delivery it can get:
//!
//! 1. An external relay daemon, when both its control and RTSP ports answer
//!    on localhost. Frames are pushed to it through ffmpeg.
//! 2. Otherwise the native RTSP server and, if a factory was injected, a
//!    WebRTC sink. Either, both or neither may come up.
//! 3. Otherwise broadcast only.
//!
//! The JPEG broadcast hub is available in every mode. The mode only changes
//! on `start`/`restart`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::backend::FrameSink;
use crate::backend::broadcast::BroadcastHub;
use crate::backend::native::NativeRtspBackend;
use crate::backend::relay::{self, RelayBackend};
use crate::config::CameraConfig;
use crate::encoder::{EncoderFactory, default_encoder_factory};
use crate::error::{CameraError, Result};
use crate::frame::Frame;
use crate::ptz::{JsonPresetStore, MemoryPresetStore, PresetStore, PtzController};
use crate::server::{ServerConfig, Viewer};
use crate::stats::StreamStats;

/// Delivery mode chosen at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    /// ffmpeg pushes to an external relay daemon.
    Relay,
    NativeRtsp,
    NativeRtspWebrtc,
    NativeWebrtc,
    /// Only the JPEG preview is available.
    BroadcastOnly,
}

impl fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Relay => "relay",
            Self::NativeRtsp => "native-rtsp",
            Self::NativeRtspWebrtc => "native-rtsp+webrtc",
            Self::NativeWebrtc => "native-webrtc",
            Self::BroadcastOnly => "broadcast-only",
        };
        f.write_str(s)
    }
}

/// Builds an extra sink (WebRTC) from the camera configuration.
pub type SinkFactory = Arc<dyn Fn(&CameraConfig) -> Result<Box<dyn FrameSink>> + Send + Sync>;

#[derive(Default)]
struct Backends {
    relay: Option<RelayBackend>,
    rtsp: Option<NativeRtspBackend>,
    webrtc: Option<Box<dyn FrameSink>>,
}

impl Backends {
    fn sinks(&self) -> impl Iterator<Item = &dyn FrameSink> {
        let relay: Option<&dyn FrameSink> = self.relay.as_ref().map(|b| b as &dyn FrameSink);
        let rtsp: Option<&dyn FrameSink> = self.rtsp.as_ref().map(|b| b as &dyn FrameSink);
        let webrtc: Option<&dyn FrameSink> = self.webrtc.as_deref();
        relay.into_iter().chain(rtsp).chain(webrtc)
    }

    fn stop_all(&mut self) {
        for sink in self.sinks() {
            tracing::debug!(backend = sink.name(), "stopping backend");
            sink.stop();
        }
        *self = Self::default();
    }
}

/// Sleeps the ingestion path to hold a frame rate.
#[derive(Debug, Default)]
struct Pacer {
    fps: u32,
    start: Option<Instant>,
    frames: u64,
}

impl Pacer {
    /// Time to wait after a frame submitted at `now`, never more than one
    /// frame interval. The schedule restarts when `fps` changes or the
    /// caller falls more than a frame behind.
    fn delay(&mut self, fps: u32, now: Instant) -> Duration {
        let fps = fps.max(1);
        let start = match self.start {
            Some(start) if self.fps == fps => start,
            _ => {
                self.fps = fps;
                self.frames = 0;
                *self.start.insert(now)
            }
        };
        self.frames += 1;

        let interval = Duration::from_secs_f64(1.0 / fps as f64);
        let target = start + Duration::from_secs_f64(self.frames as f64 / fps as f64);
        if target <= now {
            if now - target > interval {
                self.start = Some(now);
                self.frames = 0;
            }
            return Duration::ZERO;
        }
        (target - now).min(interval)
    }
}

/// Owns the PTZ engine, the delivery backends and the broadcast hub.
pub struct Orchestrator {
    config: CameraConfig,
    server_config: ServerConfig,
    ptz: Arc<PtzController>,
    encoder_factory: EncoderFactory,
    webrtc_factory: Option<SinkFactory>,
    probe_relay: bool,
    broadcast: Arc<BroadcastHub>,
    mode: RwLock<Option<StreamingMode>>,
    backends: Mutex<Backends>,
    stats: Mutex<StreamStats>,
    pacer: Mutex<Pacer>,
}

impl Orchestrator {
    /// Build the camera from its configuration. Presets persist to
    /// `ptz.preset_file` when set.
    pub fn new(config: CameraConfig) -> Result<Self> {
        config.validate()?;
        let store: Box<dyn PresetStore> = match &config.ptz.preset_file {
            Some(path) => Box::new(JsonPresetStore::new(path)),
            None => Box::new(MemoryPresetStore::default()),
        };
        let ptz = Arc::new(PtzController::new(config.ptz_settings(), store)?);
        Ok(Self::with_ptz(config, ptz))
    }

    /// Build around an existing PTZ controller.
    pub fn with_ptz(config: CameraConfig, ptz: Arc<PtzController>) -> Self {
        let server_config = ServerConfig {
            sdp_session_name: config.name.clone(),
            ..ServerConfig::default()
        };
        Self {
            broadcast: Arc::new(BroadcastHub::new(config.broadcast_quality)),
            config,
            server_config,
            ptz,
            encoder_factory: default_encoder_factory(),
            webrtc_factory: None,
            probe_relay: true,
            mode: RwLock::new(None),
            backends: Mutex::new(Backends::default()),
            stats: Mutex::new(StreamStats::new()),
            pacer: Mutex::new(Pacer::default()),
        }
    }

    pub fn with_encoder_factory(mut self, factory: EncoderFactory) -> Self {
        self.encoder_factory = factory;
        self
    }

    pub fn with_server_config(mut self, config: ServerConfig) -> Self {
        self.server_config = config;
        self
    }

    /// Also start a WebRTC sink alongside the native RTSP server.
    pub fn with_webrtc(mut self, factory: SinkFactory) -> Self {
        self.webrtc_factory = Some(factory);
        self
    }

    /// Skip the relay probe and go straight to the native backends.
    pub fn without_relay(mut self) -> Self {
        self.probe_relay = false;
        self
    }

    /// Select and start backends. Backend failures fall through the
    /// cascade; only a failure to bind the RTSP port is returned.
    pub fn start(&self) -> Result<StreamingMode> {
        let mut mode_slot = self.mode.write();
        if mode_slot.is_some() {
            return Err(CameraError::AlreadyRunning);
        }
        let mut backends = self.backends.lock();

        let mode = match self.start_relay() {
            Some(relay) => {
                backends.relay = Some(relay);
                StreamingMode::Relay
            }
            None => {
                backends.rtsp = self.start_native()?;
                backends.webrtc = self.start_webrtc();
                match (backends.rtsp.is_some(), backends.webrtc.is_some()) {
                    (true, true) => StreamingMode::NativeRtspWebrtc,
                    (true, false) => StreamingMode::NativeRtsp,
                    (false, true) => StreamingMode::NativeWebrtc,
                    (false, false) => StreamingMode::BroadcastOnly,
                }
            }
        };

        *self.pacer.lock() = Pacer::default();
        *mode_slot = Some(mode);
        tracing::info!(%mode, camera = %self.config.name, "streaming started");
        Ok(mode)
    }

    fn start_relay(&self) -> Option<RelayBackend> {
        if !self.probe_relay {
            return None;
        }
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        if !relay::relay_available(host, self.config.relay_api_port, self.config.relay_rtsp_port) {
            tracing::debug!(
                api_port = self.config.relay_api_port,
                rtsp_port = self.config.relay_rtsp_port,
                "relay daemon not reachable"
            );
            return None;
        }
        match RelayBackend::start(&self.config) {
            Ok(relay) => Some(relay),
            Err(e) => {
                tracing::warn!(error = %e, "relay daemon reachable but pipeline failed");
                None
            }
        }
    }

    fn start_native(&self) -> Result<Option<NativeRtspBackend>> {
        let started = NativeRtspBackend::start(
            &self.config,
            self.server_config.clone(),
            self.encoder_factory.clone(),
        );
        match started {
            Ok(rtsp) => Ok(Some(rtsp)),
            Err(CameraError::Io(e)) => {
                tracing::error!(port = self.config.rtsp_port, error = %e, "cannot bind RTSP port");
                Err(CameraError::Io(e))
            }
            Err(e) => {
                tracing::warn!(error = %e, "native RTSP unavailable");
                Ok(None)
            }
        }
    }

    fn start_webrtc(&self) -> Option<Box<dyn FrameSink>> {
        let factory = self.webrtc_factory.as_ref()?;
        match factory(&self.config) {
            Ok(sink) => Some(sink),
            Err(e) => {
                tracing::warn!(error = %e, "native WebRTC unavailable");
                None
            }
        }
    }

    /// Stop every backend and release its sockets and processes.
    /// Broadcast subscribers stay connected.
    pub fn stop(&self) {
        let mut mode = self.mode.write();
        if mode.take().is_none() {
            return;
        }
        self.backends.lock().stop_all();
        tracing::info!(camera = %self.config.name, "streaming stopped");
    }

    /// Stop the current backends completely, then select again.
    pub fn restart(&self) -> Result<StreamingMode> {
        self.stop();
        self.start()
    }

    pub fn mode(&self) -> Option<StreamingMode> {
        *self.mode.read()
    }

    /// Distribute one raw frame.
    ///
    /// The PTZ transform runs once; the result goes only to backends that
    /// have consumers. Per-backend failures are logged and contained.
    /// Returns whether the frame was accepted.
    pub fn submit_frame(&self, frame: Arc<Frame>) -> Result<bool> {
        if self.mode().is_none() {
            return Err(CameraError::NotStarted);
        }

        let transformed = match self.ptz.apply_transform(&frame) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "PTZ transform failed, frame dropped");
                self.stats.lock().record_drop();
                return Ok(false);
            }
        };

        {
            let backends = self.backends.lock();
            for sink in backends.sinks() {
                if !sink.has_consumers() {
                    continue;
                }
                if let Err(e) = sink.send_frame(&transformed) {
                    tracing::warn!(backend = sink.name(), error = %e, "frame delivery failed");
                }
            }
        }
        if self.broadcast.has_consumers()
            && let Err(e) = self.broadcast.send_frame(&transformed)
        {
            tracing::warn!(backend = "broadcast", error = %e, "frame delivery failed");
        }

        self.stats
            .lock()
            .record_frame(Instant::now(), frame.data().len());

        if self.config.pace_frames {
            let delay = self
                .pacer
                .lock()
                .delay(self.config.main_stream.fps, Instant::now());
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
        Ok(true)
    }

    pub fn ptz(&self) -> &Arc<PtzController> {
        &self.ptz
    }

    pub fn broadcast(&self) -> &Arc<BroadcastHub> {
        &self.broadcast
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn stats(&self) -> StreamStats {
        self.stats.lock().clone()
    }

    /// Address of the native RTSP listener, when it is running.
    pub fn rtsp_addr(&self) -> Option<SocketAddr> {
        self.backends.lock().rtsp.as_ref()?.local_addr()
    }

    /// Clients playing from the native RTSP server.
    pub fn viewers(&self) -> Vec<Viewer> {
        self.backends
            .lock()
            .rtsp
            .as_ref()
            .map(|rtsp| rtsp.viewers())
            .unwrap_or_default()
    }

    /// URLs clients should open for the main and sub streams.
    pub fn stream_urls(&self) -> Vec<String> {
        let streams = [&self.config.main_stream.name, &self.config.sub_stream.name];
        match self.mode() {
            Some(StreamingMode::Relay) => {
                let ip = self.config.advertised_ip();
                streams
                    .iter()
                    .map(|s| format!("rtsp://{}:{}/{}", ip, self.config.relay_rtsp_port, s))
                    .collect()
            }
            Some(StreamingMode::NativeRtsp | StreamingMode::NativeRtspWebrtc) => {
                streams.iter().map(|s| self.config.rtsp_url(s)).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}
