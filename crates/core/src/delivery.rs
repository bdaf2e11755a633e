//! Per-session media delivery.
//!
//! Every PLAYING session runs one delivery thread. It waits on its stream's
//! [`FrameRing`](crate::stream::FrameRing) for frames newer than the last
//! one it sent, packetizes them with the session's own packetizer and
//! writes them to the session's transport. Sessions share nothing but the
//! read-only encoded frames, so a slow or broken client only stalls itself.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::media::EncodedFrame;
use crate::media::h264::{self, NAL_PPS, NAL_SPS};
use crate::session::{MediaTransport, SharedPacketizer};
use crate::stream::Stream;

/// Upper bound on one wait for a new frame, so a stop request is noticed.
const FRAME_WAIT: Duration = Duration::from_millis(100);

/// Everything a delivery thread needs. Holds no reference to the session
/// itself so dropping the session is never blocked by its own thread.
pub(crate) struct DeliveryParams {
    pub session_id: String,
    pub stream: Arc<Stream>,
    pub transport: Arc<MediaTransport>,
    pub packetizer: SharedPacketizer,
    pub defunct: Arc<AtomicBool>,
    pub parameter_set_interval: Duration,
    /// Deliver frames published after this sequence number.
    pub start_after: u64,
}

/// Running delivery thread. Dropping the handle stops and joins it.
pub(crate) struct DeliveryHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeliveryHandle {
    pub(crate) fn spawn(params: DeliveryParams) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let name = format!("rtp-{}", params.session_id);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(params, flag))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("delivery thread panicked");
        }
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(params: DeliveryParams, stop: Arc<AtomicBool>) {
    let DeliveryParams {
        session_id,
        stream,
        transport,
        packetizer,
        defunct,
        parameter_set_interval,
        start_after,
    } = params;

    let mut last_sequence = start_after;
    let mut last_parameter_sets: Option<Instant> = None;
    let mut frames_sent: u64 = 0;

    tracing::debug!(session_id, stream = %stream.name(), kind = transport.kind(), "delivery started");

    while !stop.load(Ordering::SeqCst) {
        let Some(frame) = stream.frames().next_after(last_sequence, FRAME_WAIT) else {
            continue;
        };
        if stop.load(Ordering::SeqCst) {
            break;
        }
        last_sequence = frame.sequence;

        let resend = last_parameter_sets.is_none_or(|t| t.elapsed() >= parameter_set_interval);
        let parameter_sets = if resend && !carries_parameter_sets(&frame) {
            stream.parameter_sets()
        } else {
            Default::default()
        };

        let packets = {
            let mut packetizer = packetizer.lock();
            let mut packets = Vec::new();
            if let Some((sps, pps)) = parameter_sets.both() {
                packets.extend(packetizer.packetize(sps, frame.pts, false));
                packets.extend(packetizer.packetize(pps, frame.pts, false));
            }
            let last = frame.nal_units.len().saturating_sub(1);
            for (i, nal) in frame.nal_units.iter().enumerate() {
                packets.extend(packetizer.packetize(nal, frame.pts, i == last));
            }
            packets
        };
        if resend && (parameter_sets.both().is_some() || carries_parameter_sets(&frame)) {
            last_parameter_sets = Some(Instant::now());
        }

        for packet in &packets {
            if let Err(e) = transport.send_rtp(packet) {
                tracing::warn!(session_id, stream = %stream.name(), error = %e, "RTP send failed, ending delivery");
                defunct.store(true, Ordering::Release);
                return;
            }
        }

        frames_sent += 1;
        tracing::trace!(
            session_id,
            sequence = frame.sequence,
            pts = frame.pts,
            packets = packets.len(),
            "frame delivered"
        );
    }

    tracing::debug!(session_id, frames_sent, "delivery stopped");
}

fn carries_parameter_sets(frame: &EncodedFrame) -> bool {
    let has = |kind| frame.nal_units.iter().any(|n| h264::nal_type(n) == Some(kind));
    has(NAL_SPS) && has(NAL_PPS)
}
