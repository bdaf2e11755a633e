use std::io;
use std::net::SocketAddr;

use crate::transport::tcp::InterleavedWriter;
use crate::transport::udp::UdpPair;

/// Channels used when a client asks for TCP without naming them.
pub const DEFAULT_INTERLEAVED_CHANNELS: (u8, u8) = (0, 1);

/// Client transport request from the RTSP `Transport` header (RFC 2326 §12.39).
///
/// ```text
/// Transport: RTP/AVP;unicast;client_port=8000-8001
/// Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
///
/// When a client lists several alternatives separated by commas, only the
/// first is considered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportRequest {
    /// `RTP/AVP/TCP` was requested.
    pub tcp: bool,
    /// `interleaved=RTP-RTCP` channel pair.
    pub interleaved: Option<(u8, u8)>,
    /// `client_port=RTP-RTCP` pair.
    pub client_port: Option<(u16, u16)>,
}

impl TransportRequest {
    /// Parse a `Transport` header value. Unknown parameters are ignored.
    ///
    /// ```
    /// use ptzcam::session::transport::TransportRequest;
    ///
    /// let udp = TransportRequest::parse("RTP/AVP;unicast;client_port=8000-8001");
    /// assert_eq!(udp.client_port, Some((8000, 8001)));
    /// assert!(udp.wants_udp());
    ///
    /// let tcp = TransportRequest::parse("RTP/AVP/TCP;unicast;interleaved=2-3");
    /// assert_eq!(tcp.interleaved_channels(), (2, 3));
    /// assert!(!tcp.wants_udp());
    /// ```
    pub fn parse(header: &str) -> Self {
        let first = header.split(',').next().unwrap_or(header);
        let mut request = Self::default();

        for part in first.split(';').map(str::trim) {
            if part.eq_ignore_ascii_case("RTP/AVP/TCP") {
                request.tcp = true;
            } else if let Some(channels) = part.strip_prefix("interleaved=") {
                request.interleaved = parse_pair::<u8>(channels);
            } else if let Some(ports) = part.strip_prefix("client_port=") {
                request.client_port = parse_pair::<u16>(ports);
            }
        }
        request
    }

    /// UDP is used only when the client announced its ports and did not ask
    /// for TCP.
    pub fn wants_udp(&self) -> bool {
        self.client_port.is_some() && !self.tcp && self.interleaved.is_none()
    }

    pub fn interleaved_channels(&self) -> (u8, u8) {
        self.interleaved.unwrap_or(DEFAULT_INTERLEAVED_CHANNELS)
    }
}

/// `a-b` or a lone `a` (meaning `a-(a+1)`).
fn parse_pair<T>(value: &str) -> Option<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    let mut parts = value.split('-');
    let first: T = parts.next()?.trim().parse().ok()?;
    let second = match parts.next() {
        Some(s) => s.trim().parse().ok()?,
        None => T::try_from(u32::from(first) + 1).ok()?,
    };
    Some((first, second))
}

/// Negotiated media path of one session.
///
/// Each session owns its transport exclusively: UDP sessions own their
/// bound socket pair; interleaved sessions share only the TCP connection
/// they were set up on.
#[derive(Debug)]
pub enum MediaTransport {
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
        writer: InterleavedWriter,
    },
    Udp {
        client_rtp: SocketAddr,
        client_rtcp: SocketAddr,
        sockets: UdpPair,
    },
}

impl MediaTransport {
    /// Send one RTP packet to the client.
    pub fn send_rtp(&self, packet: &[u8]) -> io::Result<()> {
        match self {
            Self::Interleaved {
                rtp_channel,
                writer,
                ..
            } => writer.write_frame(*rtp_channel, packet),
            Self::Udp {
                client_rtp,
                sockets,
                ..
            } => sockets.send_rtp(packet, *client_rtp),
        }
    }

    /// `Transport` header value for the SETUP response.
    pub fn response_header(&self, ssrc: u32) -> String {
        match self {
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
                ..
            } => format!("RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel};ssrc={ssrc:08X}"),
            Self::Udp {
                client_rtp,
                client_rtcp,
                sockets,
            } => format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{};ssrc={ssrc:08X}",
                client_rtp.port(),
                client_rtcp.port(),
                sockets.rtp_port(),
                sockets.rtcp_port()
            ),
        }
    }

    pub fn is_interleaved(&self) -> bool {
        matches!(self, Self::Interleaved { .. })
    }

    /// Short label for viewer listings.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Interleaved { .. } => "tcp",
            Self::Udp { .. } => "udp",
        }
    }

    /// Close the underlying connection of an interleaved transport so its
    /// connection thread exits. UDP sockets close when dropped.
    pub fn shutdown(&self) {
        if let Self::Interleaved { writer, .. } = self {
            writer.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_udp_request() {
        let t = TransportRequest::parse("RTP/AVP;unicast;client_port=5000-5001");
        assert_eq!(t.client_port, Some((5000, 5001)));
        assert!(!t.tcp);
        assert!(t.wants_udp());
    }

    #[test]
    fn parse_interleaved_request() {
        let t = TransportRequest::parse("RTP/AVP/TCP;unicast;interleaved=4-5");
        assert!(t.tcp);
        assert_eq!(t.interleaved, Some((4, 5)));
        assert!(!t.wants_udp());
    }

    #[test]
    fn tcp_without_channels_uses_defaults() {
        let t = TransportRequest::parse("RTP/AVP/TCP;unicast");
        assert_eq!(t.interleaved_channels(), (0, 1));
        assert!(!t.wants_udp());
    }

    #[test]
    fn missing_mode_falls_back_to_interleaved() {
        let t = TransportRequest::parse("RTP/AVP;unicast");
        assert!(!t.wants_udp());
        assert_eq!(t.interleaved_channels(), DEFAULT_INTERLEAVED_CHANNELS);
    }

    #[test]
    fn single_port_and_channel_imply_pair() {
        let t = TransportRequest::parse("RTP/AVP;unicast;client_port=6970");
        assert_eq!(t.client_port, Some((6970, 6971)));
        let t = TransportRequest::parse("RTP/AVP/TCP;interleaved=2");
        assert_eq!(t.interleaved, Some((2, 3)));
    }

    #[test]
    fn only_first_alternative_counts() {
        let t = TransportRequest::parse(
            "RTP/AVP/TCP;unicast;interleaved=0-1,RTP/AVP;unicast;client_port=7000-7001",
        );
        assert!(t.tcp);
        assert_eq!(t.client_port, None);
    }

    #[test]
    fn malformed_ports_are_ignored() {
        let t = TransportRequest::parse("RTP/AVP;unicast;client_port=abc-def");
        assert_eq!(t.client_port, None);
        assert!(!t.wants_udp());
    }
}
