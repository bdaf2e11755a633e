//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses. The format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                             ← session name
//! c=IN IP4 <addr>                              ← connection address
//! t=0 0                                        ← timing (live stream)
//! a=tool:ptzcam-rs                             ← server software (§6)
//! a=sendonly                                   ← direction (§6)
//! m=video 0 RTP/AVP 96                         ← media description
//! a=rtpmap:96 H264/90000                       ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;...           ← codec parameters
//! a=framerate:30                               ← nominal frame rate
//! a=control:track1                             ← track control URL
//! ```
//!
//! Session and origin fields come from [`ServerConfig`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::config::StreamSettings;
use crate::encoder::ParameterSets;
use crate::media::{H264_PAYLOAD_TYPE, VIDEO_CLOCK_RATE};
use crate::server::ServerConfig;

/// Track control attribute; SETUP URIs end with this suffix.
pub const TRACK_CONTROL: &str = "track1";

/// RFC 6184 §8.1 `fmtp` parameters for an H.264 stream.
///
/// With both parameter sets cached this carries `profile-level-id` and
/// `sprop-parameter-sets`; without them the client waits for in-band SPS/PPS.
pub fn h264_fmtp(parameter_sets: &ParameterSets) -> String {
    match parameter_sets.both() {
        Some((sps, pps)) if sps.len() >= 4 => format!(
            "packetization-mode=1;profile-level-id={:02X}{:02X}{:02X};sprop-parameter-sets={},{}",
            sps[1],
            sps[2],
            sps[3],
            STANDARD.encode(sps),
            STANDARD.encode(pps)
        ),
        _ => "packetization-mode=1".to_string(),
    }
}

/// Generate the SDP session description for one stream.
pub fn generate_sdp(
    settings: &StreamSettings,
    parameter_sets: &ParameterSets,
    host: &str,
    config: &ServerConfig,
) -> String {
    let addr_type = if host.contains(':') { "IP6" } else { "IP4" };
    let sdp = [
        "v=0".to_string(),
        format!(
            "o={} {} {} IN {} {}",
            config.sdp_username, config.sdp_session_id, config.sdp_session_version, addr_type, host
        ),
        format!("s={}", config.sdp_session_name),
        format!("c=IN {} {}", addr_type, host),
        "t=0 0".to_string(),
        "a=tool:ptzcam-rs".to_string(),
        "a=sendonly".to_string(),
        format!("m=video 0 RTP/AVP {}", H264_PAYLOAD_TYPE),
        format!("a=rtpmap:{} H264/{}", H264_PAYLOAD_TYPE, VIDEO_CLOCK_RATE),
        format!("a=fmtp:{} {}", H264_PAYLOAD_TYPE, h264_fmtp(parameter_sets)),
        format!("a=framerate:{}", settings.fps),
        format!("a=control:{}", TRACK_CONTROL),
    ];

    tracing::trace!(stream = %settings.name, "SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}
