use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol::{MethodHandler, RtspRequest, RtspResponse};
use crate::server::ServerConfig;
use crate::session::SessionManager;
use crate::stream::StreamRegistry;

/// Poll interval of the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// How often the accept loop reaps idle and failed sessions.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Read timeout on client sockets, so connection threads notice shutdown.
const READ_POLL: Duration = Duration::from_millis(200);

/// Largest request head (request line + headers) or body accepted.
const MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// Write half of an RTSP connection, shared between the connection thread
/// (responses) and delivery threads of interleaved sessions (RTP).
///
/// Every write holds the lock for a whole message, so a response never
/// lands inside an RTP frame.
#[derive(Debug, Clone)]
pub struct InterleavedWriter {
    stream: Arc<Mutex<TcpStream>>,
}

impl InterleavedWriter {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.stream.lock().write_all(data)
    }

    /// Write one interleaved data frame (RFC 2326 §10.12):
    ///
    /// ```text
    /// '$' | channel (1 byte) | length (2 bytes, big-endian) | data
    /// ```
    pub fn write_frame(&self, channel: u8, packet: &[u8]) -> io::Result<()> {
        let len = u16::try_from(packet.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "RTP packet exceeds 65535 bytes"))?;
        let mut frame = Vec::with_capacity(4 + packet.len());
        frame.push(b'$');
        frame.push(channel);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(packet);
        self.write_all(&frame)
    }

    /// Shut down both directions of the connection.
    pub fn shutdown(&self) {
        let _ = self.stream.lock().shutdown(Shutdown::Both);
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`Server::stop`](crate::Server::stop) can terminate it promptly,
/// and reaps expired sessions about once a second.
pub fn accept_loop(
    listener: TcpListener,
    sessions: SessionManager,
    streams: StreamRegistry,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
) {
    let mut last_reap = Instant::now();

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let sm = sessions.clone();
                let st = streams.clone();
                let c = config.clone();
                let r = running.clone();
                thread::spawn(move || {
                    Connection::handle(stream, sm, st, c, r);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }

        if last_reap.elapsed() >= REAP_INTERVAL {
            sessions.reap();
            last_reap = Instant::now();
        }
    }
    tracing::debug!("accept loop exited");
}

/// What arrived on the connection.
enum Incoming {
    Request(String, Option<String>),
    /// A `$`-framed packet from the client (usually RTCP receiver reports).
    Interleaved { channel: u8, len: usize },
    /// The request head could not be read as a well-formed message.
    Malformed(String),
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: InterleavedWriter,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(
        stream: TcpStream,
        sessions: SessionManager,
        streams: StreamRegistry,
        config: Arc<ServerConfig>,
        running: Arc<AtomicBool>,
    ) {
        let (peer_addr, local_addr) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(peer), Ok(local)) => (peer, local),
            _ => return,
        };

        tracing::info!(%peer_addr, "client connected");

        if let Err(e) = stream
            .set_read_timeout(Some(READ_POLL))
            .and_then(|_| stream.set_write_timeout(Some(config.write_timeout)))
            .and_then(|_| stream.set_nodelay(true))
        {
            tracing::warn!(%peer_addr, error = %e, "failed to configure client socket");
            return;
        }

        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        let writer = InterleavedWriter::new(stream);

        let handler = MethodHandler::new(
            sessions.clone(),
            streams,
            peer_addr,
            local_addr.ip(),
            writer.clone(),
            config,
        );

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer,
            handler,
            peer_addr,
        };

        let reason = conn.run(&running);
        conn.cleanup(&sessions);

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let incoming = match self.read_incoming(running) {
                Ok(Some(incoming)) => incoming,
                Ok(None) => return "connection closed by client",
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return "server shutting down",
                Err(_) => return "read error",
            };

            let response = match incoming {
                Incoming::Interleaved { channel, len } => {
                    tracing::trace!(peer = %self.peer_addr, channel, len, "client interleaved data");
                    self.handler.touch_sessions();
                    continue;
                }
                Incoming::Malformed(head) => {
                    tracing::warn!(peer = %self.peer_addr, "malformed request");
                    bad_request(&head)
                }
                Incoming::Request(head, body) => match RtspRequest::parse(&head) {
                    Ok(request) => {
                        let request = request.with_body(body);
                        tracing::debug!(
                            peer = %self.peer_addr,
                            method = %request.method,
                            uri = %request.uri,
                            "request"
                        );
                        self.handler.handle(&request)
                    }
                    Err(e) => {
                        tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                        bad_request(&head)
                    }
                },
            };

            tracing::debug!(peer = %self.peer_addr, status = response.status_code, "response");

            if self.writer.write_all(response.serialize().as_bytes()).is_err() {
                return "write error";
            }
        }

        "server shutting down"
    }

    /// Read the next message. `Ok(None)` means the client closed the
    /// connection.
    fn read_incoming(&mut self, running: &AtomicBool) -> io::Result<Option<Incoming>> {
        // Skip stray line breaks between messages and detect `$` framing.
        loop {
            let first = match self.reader.fill_buf() {
                Ok([]) => return Ok(None),
                Ok(buf) => buf[0],
                Err(e) if is_timeout(&e) => {
                    if !running.load(Ordering::SeqCst) {
                        return Err(io::ErrorKind::Interrupted.into());
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            match first {
                b'\r' | b'\n' => self.reader.consume(1),
                b'$' => {
                    let mut header = [0u8; 4];
                    self.read_exact_polling(&mut header, running)?;
                    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
                    let mut payload = vec![0u8; len];
                    self.read_exact_polling(&mut payload, running)?;
                    return Ok(Some(Incoming::Interleaved {
                        channel: header[1],
                        len,
                    }));
                }
                _ => break,
            }
        }

        // A read timeout can split a line; `read_line` keeps the partial
        // text, so completeness is judged on the whole head.
        let mut head = String::new();
        loop {
            match self.reader.read_line(&mut head) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    if head.ends_with("\r\n\r\n") || head.ends_with("\n\n") {
                        break;
                    }
                }
                Err(e) if is_timeout(&e) => {
                    if !running.load(Ordering::SeqCst) {
                        return Err(io::ErrorKind::Interrupted.into());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return Ok(Some(Incoming::Malformed(head)));
                }
                Err(e) => return Err(e),
            }
            if head.len() > MAX_MESSAGE_BYTES {
                return Ok(Some(Incoming::Malformed(head)));
            }
        }

        let body = match content_length(&head) {
            Some(0) | None => None,
            Some(len) if len > MAX_MESSAGE_BYTES => return Ok(Some(Incoming::Malformed(head))),
            Some(len) => {
                let mut body = vec![0u8; len];
                self.read_exact_polling(&mut body, running)?;
                Some(String::from_utf8_lossy(&body).into_owned())
            }
        };

        Ok(Some(Incoming::Request(head, body)))
    }

    /// `read_exact` that keeps waiting through read timeouts.
    fn read_exact_polling(&mut self, mut buf: &mut [u8], running: &AtomicBool) -> io::Result<()> {
        while !buf.is_empty() {
            match self.reader.read(buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => buf = &mut buf[n..],
                Err(e) if is_timeout(&e) => {
                    if !running.load(Ordering::SeqCst) {
                        return Err(io::ErrorKind::Interrupted.into());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Tear down every session created on this connection.
    fn cleanup(&self, sessions: &SessionManager) {
        let orphaned = self.handler.session_ids().to_vec();
        if !orphaned.is_empty() {
            let removed = sessions.remove_sessions(&orphaned);
            tracing::info!(peer = %self.peer_addr, removed, "cleaned up sessions on disconnect");
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn content_length(head: &str) -> Option<usize> {
    head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("Content-Length")
            .then(|| value.trim().parse().ok())
            .flatten()
    })
}

/// 400 response echoing the CSeq when one can be found.
fn bad_request(head: &str) -> RtspResponse {
    let cseq = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("CSeq")
            .then(|| value.trim().to_string())
    });
    let response = RtspResponse::bad_request();
    match cseq {
        Some(cseq) => response.add_header("CSeq", &cseq),
        None => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_frame_layout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let writer = InterleavedWriter::new(server_side);
        writer.write_frame(2, &[0xAA; 300]).unwrap();

        let mut buf = vec![0u8; 304];
        (&client).read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[b'$', 2, 0x01, 0x2C]);
        assert!(buf[4..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn content_length_lookup() {
        let head = "SET_PARAMETER rtsp://h/main RTSP/1.0\r\nCSeq: 9\r\ncontent-length: 12\r\n\r\n";
        assert_eq!(content_length(head), Some(12));
        assert_eq!(content_length("OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n"), None);
    }

    #[test]
    fn bad_request_echoes_cseq() {
        let resp = bad_request("GARBAGE\r\nCSeq: 7\r\n\r\n");
        assert_eq!(resp.status_code, 400);
        assert!(resp.serialize().contains("CSeq: 7\r\n"));
    }
}
