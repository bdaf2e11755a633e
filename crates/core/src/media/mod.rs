//! Encoded media units and RTP packetization.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded video frame is split into one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpHeader`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping), for reordering and loss detection.
//! - **Timestamp** (32-bit), the 90 kHz media clock for video.
//! - **SSRC** (32-bit), randomly chosen to identify the sender.
//! - **Marker bit**, set on the last packet of an access unit (frame).
//!
//! Every RTSP session owns its own packetizer, so sequence numbers and SSRC
//! are per session while the [`EncodedFrame`] they packetize is shared.

pub mod h264;
pub mod rtp;

/// RTP clock rate for video (RFC 3551 §5).
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Dynamic payload type used for H.264.
pub const H264_PAYLOAD_TYPE: u8 = 96;

/// One encoded access unit, shared read-only by every session of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Position in the stream's submission order, starting at 1.
    pub sequence: u64,
    /// NAL units in decode order, without start codes.
    pub nal_units: Vec<Vec<u8>>,
    /// Presentation time in 90 kHz units.
    pub pts: u32,
}

impl EncodedFrame {
    /// Whether the frame carries an IDR slice.
    pub fn is_keyframe(&self) -> bool {
        self.nal_units
            .iter()
            .any(|nal| h264::nal_type(nal) == Some(h264::NAL_IDR_SLICE))
    }

    /// Total NAL payload bytes.
    pub fn byte_len(&self) -> usize {
        self.nal_units.iter().map(Vec::len).sum()
    }
}

/// Compute the 90 kHz timestamp of frame number `frame_index` at `fps`.
///
/// Wraps modulo 2^32 like the RTP timestamp field.
pub fn frame_timestamp(frame_index: u64, fps: u32) -> u32 {
    let step = (VIDEO_CLOCK_RATE / fps.max(1)) as u64;
    frame_index.wrapping_mul(step) as u32
}

/// Codec-specific RTP packetizer.
///
/// The generic RTP header is handled by [`rtp::RtpHeader`]; packetizers
/// compose it rather than reimplementing header serialization.
pub trait Packetizer: Send {
    /// Packetize one NAL unit into complete RTP packets.
    ///
    /// `marker` marks `nal` as the last unit of its access unit. All packets
    /// carry `timestamp`.
    fn packetize(&mut self, nal: &[u8], timestamp: u32, marker: bool) -> Vec<Vec<u8>>;

    /// Codec name for the SDP `a=rtpmap` attribute.
    fn codec_name(&self) -> &'static str;

    fn clock_rate(&self) -> u32;

    fn payload_type(&self) -> u8;

    /// Sequence number the next packet will carry (for `RTP-Info`).
    fn next_sequence(&self) -> u16;

    /// Timestamp of the most recent packet (for `RTP-Info`).
    fn rtp_timestamp(&self) -> u32;

    fn ssrc(&self) -> u32;
}
