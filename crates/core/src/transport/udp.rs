use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::error::{CameraError, Result};

/// Attempts at finding an even port whose odd neighbour is also free.
const PAIR_ATTEMPTS: usize = 16;

/// Server-side RTP/RTCP socket pair of one UDP session.
///
/// Per RFC 3550 §11 the RTP port is even and RTCP uses the next port.
/// Both sockets are bound for the lifetime of the session and closed when
/// the pair is dropped.
#[derive(Debug)]
pub struct UdpPair {
    rtp: UdpSocket,
    rtcp: UdpSocket,
}

impl UdpPair {
    /// Bind an ephemeral even/odd port pair on `ip`.
    pub fn bind(ip: IpAddr) -> Result<Self> {
        for _ in 0..PAIR_ATTEMPTS {
            let rtp = UdpSocket::bind(SocketAddr::new(ip, 0))?;
            let port = rtp.local_addr()?.port();
            if port % 2 != 0 || port == u16::MAX {
                continue;
            }
            match UdpSocket::bind(SocketAddr::new(ip, port + 1)) {
                Ok(rtcp) => {
                    tracing::trace!(rtp_port = port, rtcp_port = port + 1, "UDP port pair bound");
                    return Ok(Self { rtp, rtcp });
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(CameraError::PortPairUnavailable)
    }

    pub fn rtp_port(&self) -> u16 {
        self.rtp.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn rtcp_port(&self) -> u16 {
        self.rtcp.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn send_rtp(&self, packet: &[u8], to: SocketAddr) -> io::Result<()> {
        self.rtp.send_to(packet, to)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[test]
    fn binds_even_odd_pair() {
        let pair = UdpPair::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert_eq!(pair.rtp_port() % 2, 0);
        assert_eq!(pair.rtcp_port(), pair.rtp_port() + 1);
    }

    #[test]
    fn sends_to_client() {
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let pair = UdpPair::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();

        pair.send_rtp(b"rtp", client.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"rtp");
        assert_eq!(from.port(), pair.rtp_port());
    }
}
