//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling, one thread
//!   per connection. When a client negotiates interleaved transport
//!   (RFC 2326 §10.12) RTP is multiplexed onto the same connection with `$`
//!   framing.
//!
//! - **UDP** ([`udp`]): each UDP session binds its own RTP/RTCP port pair.

pub mod tcp;
pub mod udp;

pub use tcp::InterleavedWriter;
pub use udp::UdpPair;
