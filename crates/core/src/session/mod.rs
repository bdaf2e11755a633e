//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! A session is created by the first SETUP and destroyed by TEARDOWN,
//! connection loss, a fatal send error, or idle timeout. It tracks:
//!
//! - A random session ID (hex string, returned in the `Session` header).
//! - The lifecycle state.
//! - The negotiated [`MediaTransport`] and a per-session RTP packetizer.
//! - The delivery thread while PLAYING.
//! - The last time the client showed signs of life.
//!
//! ## Session lifecycle
//!
//! ```text
//! SETUP          -> Ready
//! PLAY           -> Playing
//! PAUSE          -> Ready      (from Playing)
//! TEARDOWN       -> Teardown   (removed from the table)
//! disconnect / timeout / send error -> Teardown (removed)
//! ```

pub mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::delivery::{DeliveryHandle, DeliveryParams};
use crate::error::{CameraError, Result};
use crate::media::Packetizer;
use crate::media::h264::H264Packetizer;
use crate::stream::Stream;
pub use transport::{MediaTransport, TransportRequest};

/// Default session timeout (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// RTSP session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, transport not yet negotiated.
    Init,
    /// Transport negotiated; no media flowing.
    Ready,
    /// Media is being delivered.
    Playing,
    /// Terminal; resources released.
    Teardown,
}

pub type SharedPacketizer = Arc<Mutex<Box<dyn Packetizer>>>;

/// A single RTSP session.
pub struct Session {
    pub id: String,
    /// URI of the SETUP request.
    pub uri: String,
    /// Address of the RTSP client.
    pub peer: SocketAddr,
    stream: Arc<Stream>,
    timeout: Duration,
    state: RwLock<SessionState>,
    transport: RwLock<Option<Arc<MediaTransport>>>,
    packetizer: SharedPacketizer,
    last_activity: Mutex<Instant>,
    delivery: Mutex<Option<DeliveryHandle>>,
    defunct: Arc<AtomicBool>,
}

impl Session {
    pub fn new(stream: Arc<Stream>, uri: &str, peer: SocketAddr, timeout: Duration) -> Self {
        Self {
            id: format!("{:016X}", rand::random::<u64>()),
            uri: uri.to_string(),
            peer,
            stream,
            timeout,
            state: RwLock::new(SessionState::Init),
            transport: RwLock::new(None),
            packetizer: Arc::new(Mutex::new(Box::new(H264Packetizer::with_random_ssrc()))),
            last_activity: Mutex::new(Instant::now()),
            delivery: Mutex::new(None),
            defunct: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    pub fn stream_name(&self) -> &str {
        self.stream.name()
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?state, "state transition");
        *current = state;
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    pub fn transport(&self) -> Option<Arc<MediaTransport>> {
        self.transport.read().clone()
    }

    /// Install the negotiated transport and move to READY.
    pub fn configure(&self, transport: MediaTransport) {
        tracing::debug!(session_id = %self.id, kind = transport.kind(), "transport configured");
        *self.transport.write() = Some(Arc::new(transport));
        self.set_state(SessionState::Ready);
        self.touch();
    }

    pub fn packetizer(&self) -> &SharedPacketizer {
        &self.packetizer
    }

    pub fn ssrc(&self) -> u32 {
        self.packetizer.lock().ssrc()
    }

    /// Record client activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.idle_for() > self.timeout
    }

    /// Set by the delivery thread when the transport failed.
    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Acquire)
    }

    /// `Session` header value, e.g. `"4F1A09C2D37E55B0;timeout=60"`.
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout.as_secs())
    }

    /// Start delivering the stream to this session and move to PLAYING.
    ///
    /// Calling it while already playing only refreshes activity.
    pub fn play(&self, parameter_set_interval: Duration) -> Result<()> {
        self.touch();
        let mut delivery = self.delivery.lock();
        if delivery.is_some() {
            return Ok(());
        }
        let transport = self
            .transport()
            .ok_or_else(|| CameraError::TransportNotConfigured(self.id.clone()))?;

        self.stream.add_viewer(&self.id);
        self.stream.request_keyframe();

        let params = DeliveryParams {
            session_id: self.id.clone(),
            stream: self.stream.clone(),
            transport,
            packetizer: self.packetizer.clone(),
            defunct: self.defunct.clone(),
            parameter_set_interval,
            // Start with the next frame published after PLAY.
            start_after: self.stream.frames().latest_sequence(),
        };
        match DeliveryHandle::spawn(params) {
            Ok(handle) => *delivery = Some(handle),
            Err(e) => {
                self.stream.remove_viewer(&self.id);
                return Err(e.into());
            }
        }
        drop(delivery);

        self.set_state(SessionState::Playing);
        Ok(())
    }

    /// Stop delivery and move back to READY.
    pub fn pause(&self) {
        self.touch();
        self.stop_delivery();
        if self.state() == SessionState::Playing {
            self.set_state(SessionState::Ready);
        }
    }

    fn stop_delivery(&self) {
        let handle = self.delivery.lock().take();
        if let Some(mut handle) = handle {
            handle.stop();
        }
        self.stream.remove_viewer(&self.id);
    }

    /// Release every resource held by the session. Idempotent.
    ///
    /// With `shutdown_connection`, an interleaved session also closes the
    /// TCP connection it shares with RTSP signaling.
    pub fn close(&self, shutdown_connection: bool) {
        self.stop_delivery();
        let transport = self.transport.write().take();
        if let Some(transport) = transport
            && shutdown_connection
        {
            transport.shutdown();
        }
        if self.state() != SessionState::Teardown {
            self.set_state(SessionState::Teardown);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("stream", &self.stream.name())
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Thread-safe table of active sessions.
///
/// Backed by `parking_lot::RwLock`; cloning shares the same table.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new session for `stream`.
    pub fn create_session(
        &self,
        stream: Arc<Stream>,
        uri: &str,
        peer: SocketAddr,
        timeout: Duration,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(stream, uri, peer, timeout));
        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(session.id.clone(), session.clone());
            sessions.len()
        };
        tracing::debug!(session_id = %session.id, uri, %peer, total_sessions = total, "session created");
        session
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove a session from the table and release its resources.
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if let Some(session) = &removed {
            session.close(false);
            tracing::debug!(session_id = %id, total_sessions = self.len(), "session removed");
        }
        removed
    }

    /// Remove several sessions at once (used during disconnect cleanup).
    pub fn remove_sessions(&self, ids: &[String]) -> usize {
        let removed: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &removed {
            session.close(false);
        }
        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), remaining = self.len(), "batch session cleanup");
        }
        removed.len()
    }

    /// Tear down sessions that timed out or whose transport failed.
    /// Returns the removed session IDs.
    pub fn reap(&self) -> Vec<String> {
        let stale: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.is_expired() || s.is_defunct())
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &stale {
            let reason = if session.is_defunct() {
                "transport failed"
            } else {
                "idle timeout"
            };
            tracing::info!(session_id = %session.id, stream = %session.stream_name(), reason, "session reaped");
            session.close(true);
        }
        stale.iter().map(|s| s.id.clone()).collect()
    }

    pub fn playing_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Remove and close every session.
    pub fn close_all(&self) {
        let all: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &all {
            session.close(true);
        }
        if !all.is_empty() {
            tracing::debug!(closed = all.len(), "all sessions closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamSettings;
    use crate::encoder::EncoderFactory;
    use crate::transport::UdpPair;
    use std::net::{IpAddr, Ipv4Addr};

    fn stream() -> Arc<Stream> {
        let factory: EncoderFactory =
            Arc::new(|_: &StreamSettings| Err(CameraError::Encoder("unused".into())));
        Arc::new(Stream::new(StreamSettings::main(), factory))
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn udp_transport() -> MediaTransport {
        MediaTransport::Udp {
            client_rtp: "127.0.0.1:9".parse().unwrap(),
            client_rtcp: "127.0.0.1:10".parse().unwrap(),
            sockets: UdpPair::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap(),
        }
    }

    #[test]
    fn ids_are_unique_and_header_carries_timeout() {
        let manager = SessionManager::new();
        let a = manager.create_session(stream(), "rtsp://h/main", peer(), DEFAULT_SESSION_TIMEOUT);
        let b = manager.create_session(stream(), "rtsp://h/main", peer(), DEFAULT_SESSION_TIMEOUT);
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
        assert_eq!(a.session_header_value(), format!("{};timeout=60", a.id));
        assert_eq!(a.state(), SessionState::Init);
    }

    #[test]
    fn lifecycle_through_play_pause_teardown() {
        let s = stream();
        let manager = SessionManager::new();
        let session = manager.create_session(s.clone(), "rtsp://h/main", peer(), DEFAULT_SESSION_TIMEOUT);

        session.configure(udp_transport());
        assert_eq!(session.state(), SessionState::Ready);

        session.play(Duration::from_secs(2)).unwrap();
        assert_eq!(session.state(), SessionState::Playing);
        assert_eq!(s.viewer_count(), 1);

        session.pause();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(s.viewer_count(), 0);

        session.play(Duration::from_secs(2)).unwrap();
        let removed = manager.remove_session(&session.id).unwrap();
        assert_eq!(removed.state(), SessionState::Teardown);
        assert!(manager.get_session(&session.id).is_none());
        assert_eq!(s.viewer_count(), 0);
        assert!(removed.transport().is_none());
    }

    #[test]
    fn play_without_transport_fails() {
        let session = Session::new(stream(), "rtsp://h/main", peer(), DEFAULT_SESSION_TIMEOUT);
        assert!(matches!(
            session.play(Duration::from_secs(2)),
            Err(CameraError::TransportNotConfigured(_))
        ));
        assert_eq!(session.state(), SessionState::Init);
    }

    #[test]
    fn reap_removes_expired_sessions() {
        let manager = SessionManager::new();
        let short = manager.create_session(stream(), "rtsp://h/main", peer(), Duration::from_millis(10));
        let long = manager.create_session(stream(), "rtsp://h/main", peer(), DEFAULT_SESSION_TIMEOUT);

        std::thread::sleep(Duration::from_millis(30));
        let reaped = manager.reap();
        assert_eq!(reaped, vec![short.id.clone()]);
        assert!(manager.get_session(&long.id).is_some());
        assert_eq!(short.state(), SessionState::Teardown);
    }

    #[test]
    fn touch_keeps_session_alive() {
        let manager = SessionManager::new();
        let session = manager.create_session(stream(), "rtsp://h/main", peer(), Duration::from_millis(80));
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(30));
            session.touch();
        }
        assert!(manager.reap().is_empty());
    }

    #[test]
    fn batch_removal_counts_known_ids() {
        let manager = SessionManager::new();
        let a = manager.create_session(stream(), "rtsp://h/main", peer(), DEFAULT_SESSION_TIMEOUT);
        let removed = manager.remove_sessions(&[a.id.clone(), "missing".into()]);
        assert_eq!(removed, 1);
        assert!(manager.is_empty());
    }
}
