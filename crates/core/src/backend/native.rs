use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::FrameSink;
use crate::config::CameraConfig;
use crate::encoder::EncoderFactory;
use crate::error::Result;
use crate::frame::Frame;
use crate::server::{Server, ServerConfig, Viewer};

/// The in-process RTSP server serving the main and sub streams.
pub struct NativeRtspBackend {
    server: Mutex<Server>,
    main: String,
    sub: String,
}

impl NativeRtspBackend {
    /// Verify an encoder can be created, then bind and start the server.
    ///
    /// Encoder construction is probed up front so that a missing codec
    /// fails here, at start, rather than on the first viewer.
    pub fn start(
        config: &CameraConfig,
        server_config: ServerConfig,
        factory: EncoderFactory,
    ) -> Result<Self> {
        drop(factory(&config.main_stream)?);

        let bind_addr = format!("0.0.0.0:{}", config.rtsp_port);
        let mut server = Server::with_config(&bind_addr, server_config).with_encoder_factory(factory);
        server.add_stream(config.main_stream.clone());
        server.add_stream(config.sub_stream.clone());
        server.start()?;

        Ok(Self {
            server: Mutex::new(server),
            main: config.main_stream.name.clone(),
            sub: config.sub_stream.name.clone(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().local_addr()
    }

    pub fn viewers(&self) -> Vec<Viewer> {
        self.server.lock().viewers()
    }

    pub fn viewer_count(&self, stream: &str) -> usize {
        self.server.lock().viewer_count(stream)
    }
}

impl FrameSink for NativeRtspBackend {
    fn name(&self) -> &str {
        "rtsp"
    }

    fn has_consumers(&self) -> bool {
        let server = self.server.lock();
        server.viewer_count(&self.main) + server.viewer_count(&self.sub) > 0
    }

    /// Publish to each stream that has viewers. The sub stream's encoder
    /// scales the frame down to its own resolution.
    fn send_frame(&self, frame: &Arc<Frame>) -> Result<bool> {
        let server = self.server.lock();
        let mut sent = false;
        for stream in [&self.main, &self.sub] {
            if server.viewer_count(stream) == 0 {
                continue;
            }
            match server.submit_frame(stream, frame) {
                Ok(published) => sent |= published,
                Err(e) => {
                    tracing::warn!(stream = %stream, error = %e, "encode failed, frame dropped");
                }
            }
        }
        Ok(sent)
    }

    fn stop(&self) {
        self.server.lock().stop();
    }
}
