//! Camera configuration.
//!
//! Loaded from a JSON file; every field has a default, so a partial file
//! (or no file at all) is valid.
//!
//! ```json
//! {
//!   "name": "Virtual PTZ Camera",
//!   "rtsp_port": 8554,
//!   "main_stream": { "name": "main", "width": 1920, "height": 1080, "fps": 30, "bitrate_bps": 4000000 },
//!   "ptz": { "digital_ptz": true, "max_zoom": 4.0, "preset_file": "presets.json" }
//! }
//! ```

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CameraError, Result};
use crate::media::VIDEO_CLOCK_RATE;
use crate::ptz::PtzSettings;

/// Resolution, rate and bitrate of one RTSP output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Path component of the stream URL (`rtsp://host:port/<name>`).
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_bps: u32,
}

impl StreamSettings {
    pub fn main() -> Self {
        Self {
            name: "main".to_string(),
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate_bps: 4_000_000,
        }
    }

    pub fn sub() -> Self {
        Self {
            name: "sub".to_string(),
            width: 640,
            height: 360,
            fps: 30,
            bitrate_bps: 1_000_000,
        }
    }

    /// Wall-clock time between frames.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    /// RTP timestamp increment per frame (`90000 / fps`).
    pub fn timestamp_step(&self) -> u32 {
        VIDEO_CLOCK_RATE / self.fps.max(1)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(CameraError::Config(format!(
                "invalid stream name {:?}",
                self.name
            )));
        }
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(CameraError::Config(format!(
                "stream {}: resolution {}x{} must be non-zero and even",
                self.name, self.width, self.height
            )));
        }
        if self.fps == 0 || self.fps > 240 {
            return Err(CameraError::Config(format!(
                "stream {}: fps {} out of range",
                self.name, self.fps
            )));
        }
        Ok(())
    }
}

/// Encoder selection for the external relay pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    /// Try NVENC, then QSV, then CPU.
    #[default]
    Auto,
    Nvenc,
    Qsv,
    Cpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtzConfig {
    pub digital_ptz: bool,
    pub max_zoom: f64,
    /// JSON file for presets. Presets are kept in memory when unset.
    pub preset_file: Option<PathBuf>,
}

impl Default for PtzConfig {
    fn default() -> Self {
        Self {
            digital_ptz: true,
            max_zoom: 4.0,
            preset_file: None,
        }
    }
}

/// Top-level camera configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub name: String,
    /// Address advertised in URLs. Detected at runtime, never saved.
    #[serde(skip_serializing)]
    pub local_ip: Option<IpAddr>,
    /// Port of the native RTSP server.
    pub rtsp_port: u16,
    /// Control port of the external relay daemon.
    pub relay_api_port: u16,
    /// RTSP port of the external relay daemon.
    pub relay_rtsp_port: u16,
    /// Where the relay pipeline pushes video. `{port}` and `{name}` are
    /// replaced with the relay RTSP port and main stream name.
    pub push_url: String,
    pub main_stream: StreamSettings,
    pub sub_stream: StreamSettings,
    pub ptz: PtzConfig,
    pub hw_accel: HwAccel,
    /// JPEG quality (1-100) of the broadcast preview.
    pub broadcast_quality: u8,
    /// Sleep in the ingestion path to hold the main stream frame rate.
    pub pace_frames: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: "Virtual PTZ Camera".to_string(),
            local_ip: None,
            rtsp_port: 8554,
            relay_api_port: 1984,
            relay_rtsp_port: 8554,
            push_url: "rtsp://127.0.0.1:{port}/{name}".to_string(),
            main_stream: StreamSettings::main(),
            sub_stream: StreamSettings::sub(),
            ptz: PtzConfig::default(),
            hw_accel: HwAccel::Auto,
            broadcast_quality: 80,
            pace_frames: false,
        }
    }
}

impl CameraConfig {
    /// Read a configuration file.
    ///
    /// A missing file yields the defaults. A file that exists but cannot be
    /// parsed or fails validation is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| CameraError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Write the configuration as pretty JSON. `local_ip` is not written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| CameraError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.main_stream.validate()?;
        self.sub_stream.validate()?;
        if self.main_stream.name == self.sub_stream.name {
            return Err(CameraError::Config(
                "main and sub streams must have different names".into(),
            ));
        }
        if self.ptz.max_zoom.is_nan() || self.ptz.max_zoom < 1.0 {
            return Err(CameraError::Config(format!(
                "max_zoom {} must be at least 1.0",
                self.ptz.max_zoom
            )));
        }
        if !(1..=100).contains(&self.broadcast_quality) {
            return Err(CameraError::Config(format!(
                "broadcast_quality {} out of range 1-100",
                self.broadcast_quality
            )));
        }
        Ok(())
    }

    /// `local_ip` if set, otherwise the detected outbound address.
    pub fn advertised_ip(&self) -> IpAddr {
        self.local_ip.unwrap_or_else(detect_local_ip)
    }

    /// `rtsp://<ip>:<rtsp_port>/<stream>`.
    pub fn rtsp_url(&self, stream: &str) -> String {
        format!("rtsp://{}:{}/{}", self.advertised_ip(), self.rtsp_port, stream)
    }

    /// The relay push URL of the main stream.
    pub fn relay_push_url(&self) -> String {
        self.relay_push_url_for(&self.main_stream.name)
    }

    /// The relay push URL with placeholders filled in for `stream`.
    pub fn relay_push_url_for(&self, stream: &str) -> String {
        self.push_url
            .replace("{port}", &self.relay_rtsp_port.to_string())
            .replace("{name}", stream)
    }

    pub fn ptz_settings(&self) -> PtzSettings {
        PtzSettings {
            digital_ptz: self.ptz.digital_ptz,
            max_zoom: self.ptz.max_zoom,
            output_width: self.main_stream.width,
            output_height: self.main_stream.height,
        }
    }
}

/// Address of the interface that routes to the outside world.
///
/// Connecting a UDP socket sends no packets; it only selects a route.
/// Falls back to loopback when there is no route.
pub fn detect_local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
