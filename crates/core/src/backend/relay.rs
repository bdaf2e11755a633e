//! Push to an external media relay through an `ffmpeg` subprocess.
//!
//! Raw RGB24 frames are written to ffmpeg's stdin; ffmpeg encodes the main
//! and sub streams and publishes them to the relay, which serves RTSP and
//! WebRTC to clients on its own.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fast_image_resize::Resizer;
use parking_lot::Mutex;

use super::FrameSink;
use crate::config::{CameraConfig, HwAccel, StreamSettings};
use crate::error::{CameraError, Result};
use crate::frame::{Frame, Region, resize_region};

/// Connect timeout of each relay port probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Black frames written to verify a freshly launched encoder.
const WARM_UP_FRAMES: usize = 3;
const WARM_UP_PAUSE: Duration = Duration::from_millis(50);

/// How long ffmpeg gets to exit after stdin is closed.
const EXIT_GRACE: Duration = Duration::from_secs(3);

/// ffmpeg stderr lines kept for diagnostics.
const STDERR_TAIL: usize = 32;

/// stderr fragments that mean the selected encoder cannot run.
const ENCODER_FAILURES: &[&str] = &[
    "no nvenc capable devices found",
    "driver does not support",
    "could not open encoder",
    "error while opening encoder",
    "cannot load",
    "unknown encoder",
    "encoder not found",
    "init failed",
    "initialization failed",
    "conversion failed",
];

/// Whether both the relay's control port and its RTSP port accept TCP
/// connections on `host`.
pub fn relay_available(host: std::net::IpAddr, api_port: u16, rtsp_port: u16) -> bool {
    [api_port, rtsp_port].iter().all(|&port| {
        TcpStream::connect_timeout(&SocketAddr::new(host, port), PROBE_TIMEOUT).is_ok()
    })
}

/// Encoders to try, in order.
pub fn accel_cascade(requested: HwAccel) -> Vec<HwAccel> {
    match requested {
        HwAccel::Auto => vec![HwAccel::Nvenc, HwAccel::Qsv, HwAccel::Cpu],
        HwAccel::Cpu => vec![HwAccel::Cpu],
        other => vec![other, HwAccel::Cpu],
    }
}

fn codec_args(accel: HwAccel) -> &'static [&'static str] {
    match accel {
        HwAccel::Nvenc => &["-c:v", "h264_nvenc", "-gpu", "0", "-preset", "p1", "-rc", "cbr", "-bf", "0"],
        HwAccel::Qsv => &["-c:v", "h264_qsv", "-preset", "faster", "-global_quality", "20", "-look_ahead", "0", "-bf", "0"],
        HwAccel::Cpu | HwAccel::Auto => &["-c:v", "libx264", "-preset", "faster", "-tune", "zerolatency", "-bf", "0"],
    }
}

/// Container flags for a push URL: RTSP over TCP, otherwise FLV (RTMP).
fn output_args(url: &str) -> Vec<String> {
    let mut args: Vec<String> = if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        vec!["-f".into(), "rtsp".into(), "-rtsp_transport".into(), "tcp".into()]
    } else {
        vec!["-flags".into(), "+global_header".into(), "-f".into(), "flv".into()]
    };
    args.push(url.to_string());
    args
}

fn encode_args(settings: &StreamSettings, accel: HwAccel, scale: bool) -> Vec<String> {
    let mut args: Vec<String> = vec!["-map".into(), "0:v".into()];
    args.extend(codec_args(accel).iter().map(|s| s.to_string()));
    args.extend(["-pix_fmt".into(), "yuv420p".into()]);
    if scale {
        args.extend(["-s".into(), format!("{}x{}", settings.width, settings.height)]);
    }
    let bitrate = settings.bitrate_bps.to_string();
    args.extend([
        "-g".into(),
        (settings.fps * 2).to_string(),
        "-b:v".into(),
        bitrate.clone(),
        "-maxrate".into(),
        bitrate,
        "-bufsize".into(),
        (settings.bitrate_bps * 2).to_string(),
    ]);
    args
}

/// Full ffmpeg argument list for pushing both streams with `accel`.
pub fn ffmpeg_args(config: &CameraConfig, accel: HwAccel) -> Vec<String> {
    let main = &config.main_stream;
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgb24",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.extend([
        "-s".into(),
        format!("{}x{}", main.width, main.height),
        "-r".into(),
        main.fps.to_string(),
        "-i".into(),
        "-".into(),
    ]);
    args.extend(["-fflags".into(), "+genpts+flush_packets".into()]);

    args.extend(encode_args(main, accel, false));
    args.extend(output_args(&config.relay_push_url_for(&main.name)));

    let sub = &config.sub_stream;
    args.extend(encode_args(sub, accel, true));
    args.extend(output_args(&config.relay_push_url_for(&sub.name)));
    args
}

struct Pipeline {
    child: Child,
    stdin: Option<ChildStdin>,
}

/// Running ffmpeg push pipeline.
pub struct RelayBackend {
    accel: HwAccel,
    width: u32,
    height: u32,
    pipeline: Mutex<Option<Pipeline>>,
    resizer: Mutex<Resizer>,
    stderr: Arc<Mutex<VecDeque<String>>>,
}

impl RelayBackend {
    /// Launch ffmpeg, walking the hardware acceleration cascade until an
    /// encoder survives warm-up.
    pub fn start(config: &CameraConfig) -> Result<Self> {
        let mut last_error = None;
        for accel in accel_cascade(config.hw_accel) {
            match Self::launch(config, accel) {
                Ok(backend) => {
                    tracing::info!(?accel, url = %config.relay_push_url(), "relay pipeline started");
                    return Ok(backend);
                }
                Err(e) => {
                    tracing::warn!(?accel, error = %e, "relay encoder unavailable");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CameraError::Relay("no encoder to try".into())))
    }

    fn launch(config: &CameraConfig, accel: HwAccel) -> Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args(ffmpeg_args(config, accel))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CameraError::Relay(format!("failed to spawn ffmpeg: {e}")))?;

        let stdin = child.stdin.take();
        let stderr = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));
        if let Some(pipe) = child.stderr.take() {
            let tail = stderr.clone();
            let spawned = thread::Builder::new()
                .name("ffmpeg-stderr".into())
                .spawn(move || {
                    for line in BufReader::new(pipe).lines().map_while(std::result::Result::ok) {
                        tracing::debug!(target: "ffmpeg", "{line}");
                        let mut tail = tail.lock();
                        if tail.len() == STDERR_TAIL {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                });
            if let Err(e) = spawned {
                tracing::warn!(error = %e, "ffmpeg stderr reader not started");
            }
        }

        let backend = Self {
            accel,
            width: config.main_stream.width,
            height: config.main_stream.height,
            pipeline: Mutex::new(Some(Pipeline { child, stdin })),
            resizer: Mutex::new(Resizer::new()),
            stderr,
        };

        if let Err(e) = backend.warm_up() {
            backend.stop();
            return Err(e);
        }
        Ok(backend)
    }

    /// Write black frames and make sure ffmpeg is still running afterwards.
    fn warm_up(&self) -> Result<()> {
        let black = Frame::filled(self.width, self.height, [0, 0, 0]);
        for _ in 0..WARM_UP_FRAMES {
            self.write_raw(black.data())?;
            thread::sleep(WARM_UP_PAUSE);
            self.check_alive()?;
        }
        Ok(())
    }

    fn check_alive(&self) -> Result<()> {
        let mut pipeline = self.pipeline.lock();
        let Some(p) = pipeline.as_mut() else {
            return Err(CameraError::Relay("pipeline stopped".into()));
        };
        if let Ok(Some(status)) = p.child.try_wait() {
            return Err(CameraError::Relay(format!(
                "ffmpeg exited with {status}: {}",
                self.stderr_tail()
            )));
        }
        let failed = {
            let tail = self.stderr.lock();
            tail.iter().any(|line| {
                let line = line.to_ascii_lowercase();
                ENCODER_FAILURES.iter().any(|pattern| line.contains(pattern))
            })
        };
        if failed {
            return Err(CameraError::Relay(format!(
                "encoder failed: {}",
                self.stderr_tail()
            )));
        }
        Ok(())
    }

    fn write_raw(&self, data: &[u8]) -> Result<()> {
        let mut pipeline = self.pipeline.lock();
        let stdin = pipeline
            .as_mut()
            .and_then(|p| p.stdin.as_mut())
            .ok_or_else(|| CameraError::Relay("pipeline stopped".into()))?;
        stdin
            .write_all(data)
            .map_err(|e| CameraError::Relay(format!("write to ffmpeg failed: {e}")))
    }

    pub fn accel(&self) -> HwAccel {
        self.accel
    }

    /// Recent ffmpeg stderr, newest last.
    pub fn stderr_tail(&self) -> String {
        self.stderr
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

impl FrameSink for RelayBackend {
    fn name(&self) -> &str {
        "relay"
    }

    /// The relay serves its own clients; it is always fed.
    fn has_consumers(&self) -> bool {
        self.pipeline.lock().is_some()
    }

    fn send_frame(&self, frame: &Arc<Frame>) -> Result<bool> {
        if frame.width() == self.width && frame.height() == self.height {
            self.write_raw(frame.data())?;
        } else {
            let resized = resize_region(
                &mut self.resizer.lock(),
                frame,
                Region::full(frame),
                self.width,
                self.height,
            )?;
            self.write_raw(resized.data())?;
        }
        Ok(true)
    }

    /// Close stdin so ffmpeg flushes and exits, then kill it if it lingers.
    fn stop(&self) {
        let Some(mut pipeline) = self.pipeline.lock().take() else {
            return;
        };
        drop(pipeline.stdin.take());

        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match pipeline.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(%status, "relay pipeline exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
                _ => break,
            }
        }
        tracing::warn!("ffmpeg did not exit, killing it");
        let _ = pipeline.child.kill();
        let _ = pipeline.child.wait();
    }
}

impl Drop for RelayBackend {
    fn drop(&mut self) {
        self.stop();
    }
}
