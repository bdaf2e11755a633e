//! Ingestion statistics.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Window over which the actual frame rate is measured.
pub const FPS_WINDOW: Duration = Duration::from_secs(5);

/// Frame timestamps kept for the frame-rate window.
pub const FPS_SAMPLES: usize = 150;

/// Counters for frames handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub frames_submitted: u64,
    pub frames_dropped: u64,
    /// Raw frame bytes accepted for distribution.
    pub bytes: u64,
    started: Instant,
    timestamps: VecDeque<Instant>,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            frames_submitted: 0,
            frames_dropped: 0,
            bytes: 0,
            started: Instant::now(),
            timestamps: VecDeque::with_capacity(FPS_SAMPLES),
        }
    }

    pub fn record_frame(&mut self, at: Instant, bytes: usize) {
        self.frames_submitted += 1;
        self.bytes += bytes as u64;
        if self.timestamps.len() == FPS_SAMPLES {
            self.timestamps.pop_front();
        }
        self.timestamps.push_back(at);
    }

    pub fn record_drop(&mut self) {
        self.frames_dropped += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Frames per second over the last [`FPS_WINDOW`], measured at `now`.
    /// Zero until two frames fall inside the window.
    pub fn actual_fps_at(&self, now: Instant) -> f64 {
        let cutoff = now.checked_sub(FPS_WINDOW);
        let recent: Vec<&Instant> = self
            .timestamps
            .iter()
            .filter(|t| cutoff.is_none_or(|c| **t >= c))
            .collect();
        if recent.len() < 2 {
            return 0.0;
        }
        let span = now.saturating_duration_since(*recent[0]).as_secs_f64();
        if span > 0.0 {
            recent.len() as f64 / span
        } else {
            0.0
        }
    }

    pub fn actual_fps(&self) -> f64 {
        self.actual_fps_at(Instant::now())
    }

    /// Average ingest rate in megabits per second since start.
    pub fn bitrate_mbps(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            (self.bytes * 8) as f64 / (secs * 1_000_000.0)
        } else {
            0.0
        }
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_needs_two_frames() {
        let mut stats = StreamStats::new();
        let t0 = Instant::now();
        assert_eq!(stats.actual_fps_at(t0), 0.0);
        stats.record_frame(t0, 10);
        assert_eq!(stats.actual_fps_at(t0), 0.0);
    }

    #[test]
    fn fps_over_window() {
        let mut stats = StreamStats::new();
        let t0 = Instant::now();
        for i in 0..30 {
            stats.record_frame(t0 + Duration::from_millis(i * 100), 1);
        }
        // 30 frames spanning 3 s measured at t0 + 3 s.
        let fps = stats.actual_fps_at(t0 + Duration::from_secs(3));
        assert!((fps - 10.0).abs() < 0.01, "fps = {fps}");
        assert_eq!(stats.frames_submitted, 30);
        assert_eq!(stats.bytes, 30);
    }

    #[test]
    fn old_frames_leave_the_window() {
        let mut stats = StreamStats::new();
        let t0 = Instant::now();
        stats.record_frame(t0, 1);
        stats.record_frame(t0 + Duration::from_millis(10), 1);
        assert_eq!(stats.actual_fps_at(t0 + Duration::from_secs(10)), 0.0);
    }

    #[test]
    fn samples_are_bounded() {
        let mut stats = StreamStats::new();
        let t0 = Instant::now();
        for i in 0..(FPS_SAMPLES as u64 + 50) {
            stats.record_frame(t0 + Duration::from_millis(i), 1);
        }
        assert_eq!(stats.timestamps.len(), FPS_SAMPLES);
        stats.record_drop();
        assert_eq!(stats.frames_dropped, 1);
    }
}
