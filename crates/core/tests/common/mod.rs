//! Test helpers: a scripted H.264 encoder and a minimal RTSP client.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use ptzcam::media::rtp::RtpPacketInfo;
use ptzcam::{EncoderBackend, EncoderFactory, Frame, Result, StreamSettings};

pub const SPS: [u8; 6] = [0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x01];
pub const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

/// What the fake encoder saw.
#[derive(Default)]
pub struct EncodeLog {
    pub calls: AtomicUsize,
    pub sizes: Mutex<Vec<(u32, u32)>>,
}

impl EncodeLog {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Emits SPS + PPS + IDR on the first frame and on request, a P slice
/// otherwise. Slice bodies contain no zero bytes, so no false start codes.
pub struct FakeH264 {
    log: Arc<EncodeLog>,
    slice_len: usize,
    frames: u64,
    keyframe: bool,
}

impl EncoderBackend for FakeH264 {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        self.log.calls.fetch_add(1, Ordering::SeqCst);
        self.log.sizes.lock().push((frame.width(), frame.height()));

        let idr = self.frames == 0 || self.keyframe;
        self.frames += 1;
        self.keyframe = false;

        let mut out = Vec::new();
        if idr {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(&SPS);
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(&PPS);
            out.extend_from_slice(&[0, 0, 0, 1, 0x65]);
        } else {
            out.extend_from_slice(&[0, 0, 0, 1, 0x41]);
        }
        out.extend((0..self.slice_len).map(|i| (i % 251 + 1) as u8));
        Ok(out)
    }

    fn force_keyframe(&mut self) {
        self.keyframe = true;
    }
}

/// Factory handing out [`FakeH264`] encoders that share `log`.
pub fn fake_factory(log: Arc<EncodeLog>, slice_len: usize) -> EncoderFactory {
    Arc::new(move |_: &StreamSettings| -> Result<Box<dyn EncoderBackend>> {
        Ok(Box::new(FakeH264 {
            log: log.clone(),
            slice_len,
            frames: 0,
            keyframe: false,
        }))
    })
}

/// Small stream settings so frames are cheap to build.
pub fn small_stream(name: &str) -> StreamSettings {
    StreamSettings {
        name: name.to_string(),
        width: 64,
        height: 36,
        fps: 30,
        bitrate_bps: 500_000,
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Session ID without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<String> {
        self.header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
    }
}

/// Blocking RTSP client that tolerates interleaved data between responses.
pub struct RtspClient {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    cseq: u32,
    pub base: String,
}

impl RtspClient {
    pub fn connect(addr: SocketAddr, path: &str) -> Self {
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self {
            writer: stream,
            reader,
            cseq: 0,
            base: format!("rtsp://{addr}/{path}"),
        }
    }

    pub fn track(&self) -> String {
        format!("{}/track1", self.base)
    }

    pub fn request(&mut self, method: &str, uri: &str, headers: &[(&str, &str)]) -> Response {
        self.cseq += 1;
        let mut raw = format!("{method} {uri} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str("\r\n");
        let response = self.send_raw(&raw);
        assert_eq!(
            response.header("CSeq"),
            Some(self.cseq.to_string().as_str()),
            "CSeq must be echoed"
        );
        response
    }

    pub fn send_raw(&mut self, raw: &str) -> Response {
        self.writer.write_all(raw.as_bytes()).unwrap();
        self.writer.flush().unwrap();
        self.read_response()
    }

    /// SETUP over interleaved TCP then PLAY. Returns the session ID.
    pub fn play_interleaved(&mut self) -> String {
        let track = self.track();
        let setup = self.request(
            "SETUP",
            &track,
            &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
        );
        assert_eq!(setup.status, 200, "SETUP failed: {setup:?}");
        let session = setup.session_id().unwrap();
        let base = self.base.clone();
        let play = self.request("PLAY", &base, &[("Session", &session)]);
        assert_eq!(play.status, 200, "PLAY failed: {play:?}");
        session
    }

    fn read_response(&mut self) -> Response {
        loop {
            let first = self.reader.fill_buf().unwrap()[0];
            if first == b'$' {
                self.read_frame();
                continue;
            }
            if first == b'\r' || first == b'\n' {
                self.reader.consume(1);
                continue;
            }
            break;
        }

        let mut head = String::new();
        loop {
            let mut line = String::new();
            assert!(self.reader.read_line(&mut line).unwrap() > 0, "connection closed");
            if line == "\r\n" {
                break;
            }
            head.push_str(&line);
        }

        let mut lines = head.lines();
        let status_line = lines.next().unwrap();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap();
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        let len = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).unwrap();

        Response {
            status,
            headers,
            body: String::from_utf8(body).unwrap(),
        }
    }

    fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header).unwrap();
        assert_eq!(header[0], b'$');
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut packet = vec![0u8; len];
        self.reader.read_exact(&mut packet).unwrap();
        (header[1], packet)
    }

    /// Next interleaved RTP packet on `channel`.
    pub fn read_rtp(&mut self, channel: u8) -> Vec<u8> {
        loop {
            let (ch, packet) = self.read_frame();
            if ch == channel {
                return packet;
            }
        }
    }

    /// Packets of one access unit, up to and including the marker packet.
    pub fn read_access_unit(&mut self, channel: u8) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        loop {
            let packet = self.read_rtp(channel);
            let marker = RtpPacketInfo::parse(&packet).unwrap().marker;
            packets.push(packet);
            if marker {
                return packets;
            }
        }
    }

    /// Send an interleaved frame to the server (e.g. an RTCP report).
    pub fn send_interleaved(&mut self, channel: u8, data: &[u8]) {
        let mut frame = vec![b'$', channel];
        frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
        frame.extend_from_slice(data);
        self.writer.write_all(&frame).unwrap();
    }
}

/// Poll `cond` for up to two seconds.
pub fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}
