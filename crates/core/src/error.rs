//! Error types for the virtual camera library.

use std::fmt;

/// Errors that can occur across the camera stack.
///
/// Variants map to specific failure modes:
///
/// - **Protocol**: [`Parse`](Self::Parse) for malformed RTSP messages.
/// - **Transport**: [`Io`](Self::Io), [`PortPairUnavailable`](Self::PortPairUnavailable).
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`TransportNotConfigured`](Self::TransportNotConfigured).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning),
///   [`StreamNotFound`](Self::StreamNotFound).
/// - **Media**: [`Encoder`](Self::Encoder), [`Transform`](Self::Transform).
/// - **Orchestration**: [`Relay`](Self::Relay).
/// - **PTZ / config**: [`ReservedPreset`](Self::ReservedPreset),
///   [`Config`](Self::Config).
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No session with the given ID exists in the [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// SETUP has not been completed for this session.
    #[error("transport not configured for session: {0}")]
    TransportNotConfigured(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Could not bind an even/odd UDP port pair for RTP/RTCP.
    #[error("no free RTP/RTCP port pair")]
    PortPairUnavailable,

    /// No stream registered under the requested name.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// H.264 encoder failed to initialize or encode.
    #[error("encoder error: {0}")]
    Encoder(String),

    /// Crop/resize of a frame failed.
    #[error("frame transform error: {0}")]
    Transform(String),

    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The preset token is reserved and cannot be changed or removed.
    #[error("preset {0:?} is reserved")]
    ReservedPreset(String),

    /// External relay pipeline failed.
    #[error("relay error: {0}")]
    Relay(String),
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, CameraError>`.
pub type Result<T> = std::result::Result<T, CameraError>;
