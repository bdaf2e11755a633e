use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::StreamSettings;
use crate::encoder::{EncoderFactory, default_encoder_factory};
use crate::error::{CameraError, Result};
use crate::frame::Frame;
use crate::session::{DEFAULT_SESSION_TIMEOUT, SessionManager};
use crate::stream::{Stream, StreamRegistry};
use crate::transport::tcp;

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from the request URI or local address.
    pub public_host: Option<String>,
    /// Public RTSP port, when it differs from the bound one (NAT).
    pub public_port: Option<u16>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// Idle time after which a session is torn down.
    pub session_timeout: Duration,
    /// How often SPS/PPS are re-sent in-band to each playing session.
    pub parameter_set_interval: Duration,
    /// Write timeout on client sockets; a client that stops reading is
    /// dropped instead of stalling its delivery thread forever.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            public_port: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "PTZ Camera".to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            parameter_set_interval: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Native RTSP server.
///
/// Owns the session table, the registered streams and the accept thread.
/// TCP connection handling lives in [`transport::tcp`](crate::transport::tcp);
/// each playing session runs its own delivery thread.
pub struct Server {
    session_manager: SessionManager,
    streams: StreamRegistry,
    running: Arc<AtomicBool>,
    bind_addr: String,
    local_addr: Option<SocketAddr>,
    accept_thread: Option<JoinHandle<()>>,
    encoder_factory: EncoderFactory,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(bind_addr, ServerConfig::default())
    }

    /// Create a server with custom protocol/SDP configuration.
    pub fn with_config(bind_addr: &str, config: ServerConfig) -> Self {
        Self {
            session_manager: SessionManager::new(),
            streams: StreamRegistry::new(),
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            local_addr: None,
            accept_thread: None,
            encoder_factory: default_encoder_factory(),
            config: Arc::new(config),
        }
    }

    /// Use `factory` for the encoders of streams added afterwards.
    pub fn with_encoder_factory(mut self, factory: EncoderFactory) -> Self {
        self.encoder_factory = factory;
        self
    }

    /// Register an output stream served at `rtsp://host:port/<name>`.
    pub fn add_stream(&self, settings: StreamSettings) -> Arc<Stream> {
        self.streams.add(settings, self.encoder_factory.clone())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CameraError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let session_manager = self.session_manager.clone();
        let streams = self.streams.clone();
        let config = self.config.clone();

        let handle = thread::Builder::new()
            .name("rtsp-accept".into())
            .spawn(move || {
                tcp::accept_loop(listener, session_manager, streams, config, running);
            });
        match handle {
            Ok(handle) => self.accept_thread = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }
        self.local_addr = Some(local_addr);

        tracing::info!(addr = %local_addr, "RTSP server listening");
        Ok(())
    }

    /// Stop accepting, tear down every session and release the encoders.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");
        if let Some(handle) = self.accept_thread.take()
            && handle.join().is_err()
        {
            tracing::error!("accept thread panicked");
        }
        self.session_manager.close_all();
        self.streams.close_all();
        self.local_addr = None;
        tracing::info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Feed one frame to the named stream. Returns whether it was encoded
    /// and published (`false` when nobody is watching).
    pub fn submit_frame(&self, stream: &str, frame: &Frame) -> Result<bool> {
        if !self.is_running() {
            return Err(CameraError::NotStarted);
        }
        let stream = self
            .streams
            .get(stream)
            .ok_or_else(|| CameraError::StreamNotFound(stream.to_string()))?;
        stream.publish(frame)
    }

    pub fn viewers(&self) -> Vec<Viewer> {
        self.session_manager
            .playing_sessions()
            .iter()
            .filter_map(|session| {
                session.transport().map(|transport| Viewer {
                    session_id: session.id.clone(),
                    stream: session.stream_name().to_string(),
                    peer: session.peer,
                    transport: transport.kind(),
                })
            })
            .collect()
    }

    /// Number of playing sessions on `stream`.
    pub fn viewer_count(&self, stream: &str) -> usize {
        self.streams.get(stream).map_or(0, |s| s.viewer_count())
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// Returns the server's protocol configuration.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A client in PLAY state.
#[derive(Debug, Clone)]
pub struct Viewer {
    pub session_id: String,
    pub stream: String,
    pub peer: SocketAddr,
    /// `"tcp"` (interleaved) or `"udp"`.
    pub transport: &'static str,
}
