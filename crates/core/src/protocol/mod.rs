//! RTSP signaling for the camera's output streams (RFC 2326).
//!
//! Each stream is served under its own path, `rtsp://<host>:<port>/<stream>`,
//! with a single video track addressed as `<stream>/track1`. A typical
//! viewer (VLC, ffplay, an NVR) walks through:
//!
//! ```text
//! OPTIONS  rtsp://cam:8554/main          -> Public: OPTIONS, DESCRIBE, ...
//! DESCRIBE rtsp://cam:8554/main          -> SDP with H.264 fmtp
//! SETUP    rtsp://cam:8554/main/track1   -> Session: <id>;timeout=60
//! PLAY     rtsp://cam:8554/main          -> RTP-Info, media starts
//! GET_PARAMETER (periodically)           -> keeps the session alive
//! TEARDOWN rtsp://cam:8554/main          -> session released
//! ```
//!
//! Every response echoes the request's `CSeq`. Session errors map to
//! 454 (unknown session) and 455 (method not valid in the session state);
//! unknown paths are 404 and unknown methods 501.
//!
//! | Method | RFC section | Effect |
//! |--------|-------------|--------|
//! | OPTIONS | §10.1 | Lists supported methods |
//! | DESCRIBE | §10.2 | SDP for the stream |
//! | SETUP | §10.4 | Interleaved TCP or UDP transport |
//! | PLAY | §10.5 | Starts delivery from the next frame |
//! | PAUSE | §10.6 | Stops delivery, keeps the session |
//! | TEARDOWN | §10.7 | Destroys the session |
//! | GET_PARAMETER, SET_PARAMETER | §10.8, §10.9 | Keepalive |

pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use request::RtspRequest;
pub use response::RtspResponse;
