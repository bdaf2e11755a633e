use std::collections::BTreeMap;

use super::presets::PtzPreset;

/// Values within this distance of zero count as zero for motion and
/// home-position checks.
pub const EPSILON: f64 = 1e-3;

/// Viewport position: pan and tilt in `[-1, 1]`, zoom in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PtzPosition {
    pub pan: f64,
    pub tilt: f64,
    pub zoom: f64,
}

impl PtzPosition {
    pub fn new(pan: f64, tilt: f64, zoom: f64) -> Self {
        Self { pan, tilt, zoom }.clamped()
    }

    /// Copy of `self` with every axis clamped to its range.
    pub fn clamped(self) -> Self {
        Self {
            pan: self.pan.clamp(-1.0, 1.0),
            tilt: self.tilt.clamp(-1.0, 1.0),
            zoom: self.zoom.clamp(0.0, 1.0),
        }
    }

    /// Whether the viewport is (within [`EPSILON`]) the full, centered frame.
    pub fn is_default(&self) -> bool {
        self.pan.abs() < EPSILON && self.tilt.abs() < EPSILON && self.zoom.abs() < EPSILON
    }
}

/// Commanded rate of a continuous move, each axis in `[-1, 1]` per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PtzVelocity {
    pub pan_speed: f64,
    pub tilt_speed: f64,
    pub zoom_speed: f64,
}

impl PtzVelocity {
    pub fn clamped(self) -> Self {
        Self {
            pan_speed: self.pan_speed.clamp(-1.0, 1.0),
            tilt_speed: self.tilt_speed.clamp(-1.0, 1.0),
            zoom_speed: self.zoom_speed.clamp(-1.0, 1.0),
        }
    }

    pub fn is_moving(&self) -> bool {
        self.pan_speed.abs() > EPSILON
            || self.tilt_speed.abs() > EPSILON
            || self.zoom_speed.abs() > EPSILON
    }
}

/// Snapshot returned by [`PtzController::status`](super::PtzController::status).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PtzStatus {
    pub pan: f64,
    pub tilt: f64,
    pub zoom: f64,
    pub moving: bool,
}

/// Everything guarded by the controller's single lock.
#[derive(Debug, Default)]
pub(crate) struct PtzState {
    pub position: PtzPosition,
    pub velocity: PtzVelocity,
    pub presets: BTreeMap<String, PtzPreset>,
}
