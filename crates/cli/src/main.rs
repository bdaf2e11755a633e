use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::Context;
use clap::Parser;
use ptzcam::{CameraConfig, Frame, Orchestrator};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "ptzcam-server",
    about = "Virtual PTZ camera serving RTSP/H.264"
)]
struct Args {
    /// JSON configuration file (defaults are used if it does not exist)
    #[arg(long, short, default_value = "ptzcam.json")]
    config: PathBuf,

    /// Override the native RTSP port
    #[arg(long, short)]
    port: Option<u16>,

    /// Skip probing for an external relay daemon
    #[arg(long)]
    no_relay: bool,

    /// Feed a moving color-bar test pattern
    #[arg(long)]
    test_pattern: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = CameraConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.rtsp_port = port;
    }

    let mut camera = Orchestrator::new(config).context("building camera")?;
    if args.no_relay {
        camera = camera.without_relay();
    }
    let camera = Arc::new(camera);
    let mode = camera.start().context("starting camera")?;

    println!("Streaming mode: {mode}");
    for url in camera.stream_urls() {
        println!("  {url}");
    }

    let running = Arc::new(AtomicBool::new(true));
    let feeder = args.test_pattern.then(|| {
        let camera = camera.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("test-pattern".into())
            .spawn(move || feed_test_pattern(&camera, &running))
    });
    let feeder = feeder.transpose().context("spawning test pattern thread")?;

    println!("Press Enter to stop");
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    running.store(false, Ordering::SeqCst);
    if let Some(handle) = feeder
        && handle.join().is_err()
    {
        tracing::error!("test pattern thread panicked");
    }
    camera.stop();
    Ok(())
}

const BARS: [[u8; 3]; 7] = [
    [192, 192, 192],
    [192, 192, 0],
    [0, 192, 192],
    [0, 192, 0],
    [192, 0, 192],
    [192, 0, 0],
    [0, 0, 192],
];

/// Scrolling color bars at the main stream size and rate.
fn feed_test_pattern(camera: &Orchestrator, running: &AtomicBool) {
    let settings = camera.config().main_stream.clone();
    let (width, height) = (settings.width, settings.height);
    let interval = settings.frame_interval();
    let bar_width = (width / BARS.len() as u32).max(1);

    let mut offset = 0u32;
    while running.load(Ordering::SeqCst) {
        let started = std::time::Instant::now();
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..height {
            for x in 0..width {
                let bar = ((x + offset) / bar_width) as usize % BARS.len();
                data.extend_from_slice(&BARS[bar]);
            }
        }
        offset = (offset + 4) % width.max(1);

        match Frame::new(width, height, data) {
            Ok(frame) => {
                if let Err(e) = camera.submit_frame(Arc::new(frame)) {
                    tracing::warn!(error = %e, "test pattern frame rejected");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "test pattern frame invalid");
                return;
            }
        }

        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }
}
