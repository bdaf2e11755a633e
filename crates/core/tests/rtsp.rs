//! End-to-end tests against a running server on an ephemeral port.

mod common;

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use common::{EncodeLog, RtspClient, eventually, fake_factory, small_stream};
use ptzcam::media::h264::{self, MTU_SAFE, NAL_IDR_SLICE, NAL_PPS, NAL_SPS};
use ptzcam::media::rtp::RtpPacketInfo;
use ptzcam::{Frame, Server};

fn start_server(log: Arc<EncodeLog>, slice_len: usize) -> Server {
    let mut server = Server::new("127.0.0.1:0").with_encoder_factory(fake_factory(log, slice_len));
    server.add_stream(small_stream("main"));
    server.add_stream(small_stream("sub"));
    server.start().expect("server should start");
    server
}

fn frame() -> Frame {
    Frame::filled(64, 36, [40, 80, 120])
}

/// NAL types of an access unit, reassembling FU-A fragments.
fn nal_types(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut types = Vec::new();
    for packet in packets {
        let payload = RtpPacketInfo::payload(packet);
        match h264::nal_type(payload) {
            Some(28) => {
                if payload[1] & 0x80 != 0 {
                    types.push(payload[1] & 0x1f);
                }
            }
            Some(t) => types.push(t),
            None => {}
        }
    }
    types
}

#[test]
fn interleaved_play_delivers_rtp() {
    let log = Arc::new(EncodeLog::default());
    let server = start_server(log.clone(), 64);
    let addr = server.local_addr().unwrap();
    let mut client = RtspClient::connect(addr, "main");

    let base = client.base.clone();
    let options = client.request("OPTIONS", &base, &[]);
    assert_eq!(options.status, 200);
    assert!(options.header("Public").unwrap().contains("SETUP"));

    let describe = client.request("DESCRIBE", &base, &[("Accept", "application/sdp")]);
    assert_eq!(describe.status, 200);
    assert_eq!(describe.header("Content-Type"), Some("application/sdp"));
    assert!(describe.header("Content-Base").unwrap().ends_with("/main/"));
    assert!(describe.body.starts_with("v=0\r\n"));
    assert!(describe.body.contains("m=video 0 RTP/AVP 96\r\n"));
    assert!(describe.body.contains("a=rtpmap:96 H264/90000\r\n"));
    assert!(describe.body.contains("a=control:track1\r\n"));

    let track = client.track();
    let setup = client.request(
        "SETUP",
        &track,
        &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
    );
    assert_eq!(setup.status, 200);
    assert!(setup.header("Session").unwrap().ends_with(";timeout=60"));
    assert!(setup
        .header("Transport")
        .unwrap()
        .starts_with("RTP/AVP/TCP;unicast;interleaved=0-1"));
    let session = setup.session_id().unwrap();

    let play = client.request("PLAY", &base, &[("Session", &session)]);
    assert_eq!(play.status, 200);
    assert_eq!(play.header("Range"), Some("npt=0.000-"));
    let rtp_info = play.header("RTP-Info").unwrap();
    assert!(rtp_info.contains("seq=") && rtp_info.contains("rtptime="));

    assert!(server.submit_frame("main", &frame()).unwrap());
    let packets = client.read_access_unit(0);

    for packet in &packets {
        let info = RtpPacketInfo::parse(packet).unwrap();
        assert_eq!(info.version, 2);
        assert_eq!(info.payload_type, 96);
    }
    let markers: Vec<bool> = packets
        .iter()
        .map(|p| RtpPacketInfo::parse(p).unwrap().marker)
        .collect();
    assert_eq!(markers.iter().filter(|m| **m).count(), 1);
    assert!(markers.last().copied().unwrap());
    assert_eq!(nal_types(&packets), vec![NAL_SPS, NAL_PPS, NAL_IDR_SLICE]);

    let sequences: Vec<u16> = packets
        .iter()
        .map(|p| RtpPacketInfo::parse(p).unwrap().sequence)
        .collect();
    for pair in sequences.windows(2) {
        assert_eq!(pair[1], pair[0].wrapping_add(1));
    }

    // Parameter sets from the first keyframe now appear in the SDP.
    let describe = client.request("DESCRIBE", &base, &[]);
    assert!(describe
        .body
        .contains("profile-level-id=42C01F;sprop-parameter-sets=Z0LAH9oB,aM48gA=="));

    let teardown = client.request("TEARDOWN", &base, &[("Session", &session)]);
    assert_eq!(teardown.status, 200);
    assert!(eventually(|| server.session_manager().is_empty()));
    assert_eq!(server.viewer_count("main"), 0);
}

#[test]
fn udp_play_delivers_to_client_port() {
    let log = Arc::new(EncodeLog::default());
    let server = start_server(log, 64);
    let addr = server.local_addr().unwrap();

    let rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
    rtp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let rtp_port = rtp.local_addr().unwrap().port();

    let mut client = RtspClient::connect(addr, "sub");
    let track = client.track();
    let transport = format!("RTP/AVP;unicast;client_port={}-{}", rtp_port, rtp_port + 1);
    let setup = client.request("SETUP", &track, &[("Transport", &transport)]);
    assert_eq!(setup.status, 200);
    let reply = setup.header("Transport").unwrap();
    assert!(reply.contains(&format!("client_port={}-{}", rtp_port, rtp_port + 1)));
    assert!(reply.contains("server_port="));

    let session = setup.session_id().unwrap();
    let base = client.base.clone();
    assert_eq!(client.request("PLAY", &base, &[("Session", &session)]).status, 200);
    assert_eq!(server.viewers()[0].transport, "udp");

    assert!(server.submit_frame("sub", &frame()).unwrap());
    let mut buf = [0u8; 2048];
    let mut types = Vec::new();
    loop {
        let n = rtp.recv(&mut buf).unwrap();
        let info = RtpPacketInfo::parse(&buf[..n]).unwrap();
        assert_eq!(info.payload_type, 96);
        types.extend(h264::nal_type(RtpPacketInfo::payload(&buf[..n])));
        if info.marker {
            break;
        }
    }
    assert_eq!(types, vec![NAL_SPS, NAL_PPS, NAL_IDR_SLICE]);
}

#[test]
fn play_without_setup_is_rejected() {
    let server = start_server(Arc::new(EncodeLog::default()), 64);
    let mut client = RtspClient::connect(server.local_addr().unwrap(), "main");
    let base = client.base.clone();

    let play = client.request("PLAY", &base, &[]);
    assert_eq!(play.status, 454);
    let play = client.request("PLAY", &base, &[("Session", "DEADBEEF")]);
    assert_eq!(play.status, 454);
    assert!(server.session_manager().is_empty());
}

#[test]
fn unknown_stream_is_not_found() {
    let server = start_server(Arc::new(EncodeLog::default()), 64);
    let mut client = RtspClient::connect(server.local_addr().unwrap(), "nope");
    let base = client.base.clone();
    assert_eq!(client.request("DESCRIBE", &base, &[]).status, 404);
    let track = client.track();
    assert_eq!(client.request("SETUP", &track, &[]).status, 404);
}

#[test]
fn frames_are_not_encoded_without_viewers() {
    let log = Arc::new(EncodeLog::default());
    let server = start_server(log.clone(), 64);

    for _ in 0..5 {
        assert!(!server.submit_frame("main", &frame()).unwrap());
    }
    assert_eq!(log.calls(), 0);
}

#[test]
fn one_encode_per_frame_for_many_viewers() {
    let log = Arc::new(EncodeLog::default());
    let server = start_server(log.clone(), 64);
    let addr = server.local_addr().unwrap();

    let mut a = RtspClient::connect(addr, "main");
    let mut b = RtspClient::connect(addr, "main");
    a.play_interleaved();
    b.play_interleaved();
    assert_eq!(server.viewer_count("main"), 2);

    for _ in 0..3 {
        assert!(server.submit_frame("main", &frame()).unwrap());
        let from_a = a.read_access_unit(0);
        let from_b = b.read_access_unit(0);
        let ts_a = RtpPacketInfo::parse(from_a.last().unwrap()).unwrap().timestamp;
        let ts_b = RtpPacketInfo::parse(from_b.last().unwrap()).unwrap().timestamp;
        assert_eq!(ts_a, ts_b);
    }
    assert_eq!(log.calls(), 3);
}

#[test]
fn large_slices_are_fragmented() {
    let log = Arc::new(EncodeLog::default());
    let server = start_server(log, 3000);
    let mut client = RtspClient::connect(server.local_addr().unwrap(), "main");
    client.play_interleaved();

    assert!(server.submit_frame("main", &frame()).unwrap());
    let packets = client.read_access_unit(0);

    let mut idr = Vec::new();
    let mut fragments = 0;
    for packet in &packets {
        assert!(packet.len() <= 12 + MTU_SAFE);
        let payload = RtpPacketInfo::payload(packet);
        if payload[0] & 0x1f != 28 {
            continue;
        }
        fragments += 1;
        let fu_header = payload[1];
        assert_eq!(fu_header & 0x1f, NAL_IDR_SLICE);
        if fu_header & 0x80 != 0 {
            idr.push((payload[0] & 0xe0) | (fu_header & 0x1f));
        }
        idr.extend_from_slice(&payload[2..]);
    }
    assert!(fragments >= 3);
    assert_eq!(idr.len(), 3001);
    assert_eq!(idr[0], 0x65);
    assert!(idr[1..].iter().enumerate().all(|(i, b)| *b == (i % 251 + 1) as u8));
}

#[test]
fn keepalives_and_malformed_requests() {
    let server = start_server(Arc::new(EncodeLog::default()), 64);
    let mut client = RtspClient::connect(server.local_addr().unwrap(), "main");
    let session = client.play_interleaved();
    let base = client.base.clone();

    let get = client.request("GET_PARAMETER", &base, &[("Session", &session)]);
    assert_eq!(get.status, 200);
    assert_eq!(get.session_id().as_deref(), Some(session.as_str()));
    let set = client.request("SET_PARAMETER", &base, &[("Session", &session)]);
    assert_eq!(set.status, 200);

    let unknown = client.request("RECORD", &base, &[]);
    assert_eq!(unknown.status, 501);

    // RTCP receiver reports on the odd channel are accepted and ignored.
    client.send_interleaved(1, &[0x81, 0xc9, 0x00, 0x01, 0, 0, 0, 1]);

    let bad = client.send_raw("GARBAGE\r\nCSeq: 42\r\n\r\n");
    assert_eq!(bad.status, 400);
    assert_eq!(bad.header("CSeq"), Some("42"));

    // The connection survives a bad request.
    let options = client.request("OPTIONS", &base, &[]);
    assert_eq!(options.status, 200);
}

#[test]
fn setup_while_playing_is_refused() {
    let server = start_server(Arc::new(EncodeLog::default()), 64);
    let mut client = RtspClient::connect(server.local_addr().unwrap(), "main");
    let session = client.play_interleaved();
    let track = client.track();

    let again = client.request(
        "SETUP",
        &track,
        &[
            ("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1"),
            ("Session", &session),
        ],
    );
    assert_eq!(again.status, 455);
}

#[test]
fn pause_stops_delivery() {
    let log = Arc::new(EncodeLog::default());
    let server = start_server(log.clone(), 64);
    let mut client = RtspClient::connect(server.local_addr().unwrap(), "main");
    let session = client.play_interleaved();
    let base = client.base.clone();

    let pause = client.request("PAUSE", &base, &[("Session", &session)]);
    assert_eq!(pause.status, 200);
    assert_eq!(server.viewer_count("main"), 0);
    assert!(!server.submit_frame("main", &frame()).unwrap());
    assert_eq!(log.calls(), 0);

    let play = client.request("PLAY", &base, &[("Session", &session)]);
    assert_eq!(play.status, 200);
    assert!(server.submit_frame("main", &frame()).unwrap());
    let packets = client.read_access_unit(0);
    assert!(!packets.is_empty());
}

#[test]
fn disconnect_removes_sessions() {
    let server = start_server(Arc::new(EncodeLog::default()), 64);
    let addr = server.local_addr().unwrap();
    {
        let mut client = RtspClient::connect(addr, "main");
        client.play_interleaved();
        assert_eq!(server.session_manager().len(), 1);
    }
    assert!(eventually(|| server.session_manager().is_empty()));
    assert!(eventually(|| server.viewer_count("main") == 0));
}

#[test]
fn stop_closes_everything() {
    let mut server = start_server(Arc::new(EncodeLog::default()), 64);
    let mut client = RtspClient::connect(server.local_addr().unwrap(), "main");
    client.play_interleaved();

    server.stop();
    assert!(!server.is_running());
    assert!(server.session_manager().is_empty());
    assert!(server.submit_frame("main", &frame()).is_err());
}
