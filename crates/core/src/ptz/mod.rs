//! Digital pan/tilt/zoom engine.
//!
//! [`PtzController`] owns the viewport state behind a single lock. Three
//! parties touch it:
//!
//! - the control API (absolute/relative/preset moves, continuous velocity),
//! - the motion thread, which integrates velocity into position,
//! - the frame path, which reads the position once per frame in
//!   [`PtzController::apply_transform`].
//!
//! Position is always clamped before it is stored. An `at_default` flag is
//! republished after every mutation so the frame path can return the input
//! frame untouched without taking the lock.

pub mod hardware;
pub mod motion;
pub mod presets;
mod state;
pub mod transform;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::{CameraError, Result};
use crate::frame::Frame;
pub use hardware::{HandlerError, PtzHardwareHandler};
use motion::MotionLoop;
pub use presets::{HOME_PRESET_TOKEN, JsonPresetStore, MemoryPresetStore, PresetStore, PtzPreset};
pub use state::{EPSILON, PtzPosition, PtzStatus, PtzVelocity};
use state::PtzState;
pub use transform::FrameTransform;

/// Static PTZ options.
#[derive(Debug, Clone)]
pub struct PtzSettings {
    /// When false, frames pass through untouched regardless of position.
    pub digital_ptz: bool,
    /// Magnification at `zoom = 1.0`.
    pub max_zoom: f64,
    pub output_width: u32,
    pub output_height: u32,
}

impl Default for PtzSettings {
    fn default() -> Self {
        Self {
            digital_ptz: true,
            max_zoom: 4.0,
            output_width: 1920,
            output_height: 1080,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<PtzState>,
    at_default: AtomicBool,
}

impl Shared {
    /// Recompute the fast-path flag. Call with the state lock held.
    pub(crate) fn publish_default_flag(&self, state: &PtzState) {
        self.at_default
            .store(state.position.is_default(), Ordering::Release);
    }
}

/// The PTZ control surface and per-frame transform.
pub struct PtzController {
    shared: Arc<Shared>,
    digital_ptz: bool,
    transform: FrameTransform,
    handlers: RwLock<Vec<Arc<dyn PtzHardwareHandler>>>,
    store: Box<dyn PresetStore>,
    _motion: MotionLoop,
}

impl PtzController {
    /// Create a controller, load presets from `store` and start the motion
    /// thread.
    ///
    /// A store that fails to load is logged and treated as empty. The
    /// `home` preset is always present afterwards.
    pub fn new(settings: PtzSettings, store: Box<dyn PresetStore>) -> Result<Self> {
        let mut state = PtzState::default();
        match store.load() {
            Ok(presets) => {
                for preset in presets {
                    state.presets.insert(preset.token.clone(), preset);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load PTZ presets, starting empty"),
        }
        state
            .presets
            .entry(HOME_PRESET_TOKEN.to_string())
            .or_insert_with(PtzPreset::home);
        tracing::debug!(presets = state.presets.len(), "PTZ presets loaded");

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            at_default: AtomicBool::new(true),
        });
        let motion = MotionLoop::spawn(shared.clone())?;

        Ok(Self {
            shared,
            digital_ptz: settings.digital_ptz,
            transform: FrameTransform::new(
                settings.output_width,
                settings.output_height,
                settings.max_zoom,
            ),
            handlers: RwLock::new(Vec::new()),
            store,
            _motion: motion,
        })
    }

    /// Controller with default settings and in-memory presets.
    pub fn in_memory() -> Result<Self> {
        Self::new(PtzSettings::default(), Box::<MemoryPresetStore>::default())
    }

    // --- Hardware handlers ---

    pub fn add_hardware_handler(&self, handler: Arc<dyn PtzHardwareHandler>) {
        self.handlers.write().push(handler);
    }

    /// Unregister `handler` (compared by pointer). Returns whether it was registered.
    pub fn remove_hardware_handler(&self, handler: &Arc<dyn PtzHardwareHandler>) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        handlers.len() != before
    }

    fn notify<F>(&self, event: &str, callback: F)
    where
        F: Fn(&dyn PtzHardwareHandler) -> std::result::Result<(), HandlerError>,
    {
        let handlers = self.handlers.read().clone();
        if !handlers.is_empty() {
            hardware::notify_all(&handlers, event, callback);
        }
    }

    // --- Moves ---

    /// Start moving at the given speeds. Position is left to the motion thread.
    pub fn continuous_move(&self, pan_speed: f64, tilt_speed: f64, zoom_speed: f64) {
        let velocity = PtzVelocity {
            pan_speed,
            tilt_speed,
            zoom_speed,
        }
        .clamped();
        self.shared.state.lock().velocity = velocity;
        tracing::debug!(?velocity, "continuous move");

        self.notify("continuous_move", |h| {
            h.on_continuous_move(pan_speed, tilt_speed, zoom_speed)
        });
    }

    /// Zero the pan/tilt and/or zoom velocity.
    pub fn stop_movement(&self, pan_tilt: bool, zoom: bool) {
        {
            let mut state = self.shared.state.lock();
            if pan_tilt {
                state.velocity.pan_speed = 0.0;
                state.velocity.tilt_speed = 0.0;
            }
            if zoom {
                state.velocity.zoom_speed = 0.0;
            }
        }
        tracing::debug!(pan_tilt, zoom, "stop movement");

        self.notify("stop", |h| h.on_stop());
    }

    /// Jump to an absolute position; `None` leaves that axis unchanged.
    pub fn absolute_move(&self, pan: Option<f64>, tilt: Option<f64>, zoom: Option<f64>) {
        let position = self.jump(|current| PtzPosition {
            pan: pan.unwrap_or(current.pan),
            tilt: tilt.unwrap_or(current.tilt),
            zoom: zoom.unwrap_or(current.zoom),
        });
        tracing::debug!(?position, "absolute move");

        self.notify("absolute_move", |h| h.on_absolute_move(pan, tilt, zoom));
    }

    /// Offset the current position.
    pub fn relative_move(&self, pan_delta: f64, tilt_delta: f64, zoom_delta: f64) {
        let position = self.jump(|current| PtzPosition {
            pan: current.pan + pan_delta,
            tilt: current.tilt + tilt_delta,
            zoom: current.zoom + zoom_delta,
        });
        tracing::debug!(?position, "relative move");

        self.notify("relative_move", |h| {
            h.on_relative_move(pan_delta, tilt_delta, zoom_delta)
        });
    }

    pub fn goto_home(&self) {
        self.absolute_move(Some(0.0), Some(0.0), Some(0.0));
        self.notify("goto_home", |h| h.on_goto_home());
    }

    /// Clamp-then-publish an instantaneous move and cancel any velocity.
    fn jump<F>(&self, target: F) -> PtzPosition
    where
        F: FnOnce(PtzPosition) -> PtzPosition,
    {
        let mut state = self.shared.state.lock();
        state.position = target(state.position).clamped();
        state.velocity = PtzVelocity::default();
        self.shared.publish_default_flag(&state);
        state.position
    }

    // --- Presets ---

    /// Save the current position under `token`, or under a generated
    /// `preset_<n>` token when `None`. An existing token is overwritten.
    ///
    /// The `home` token is reserved.
    pub fn set_preset(&self, token: Option<&str>, name: &str) -> Result<String> {
        if token == Some(HOME_PRESET_TOKEN) {
            return Err(CameraError::ReservedPreset(HOME_PRESET_TOKEN.to_string()));
        }

        let (token, snapshot) = {
            let mut state = self.shared.state.lock();
            let token = match token {
                Some(t) => t.to_string(),
                None => next_preset_token(&state),
            };
            let position = state.position;
            state.presets.insert(
                token.clone(),
                PtzPreset {
                    token: token.clone(),
                    name: name.to_string(),
                    pan: position.pan,
                    tilt: position.tilt,
                    zoom: position.zoom,
                },
            );
            (token, state.presets.values().cloned().collect::<Vec<_>>())
        };
        tracing::info!(token, name, "preset saved");

        self.persist(&snapshot);
        Ok(token)
    }

    /// Move to a stored preset. Returns false for an unknown token.
    pub fn goto_preset(&self, token: &str) -> bool {
        let preset = {
            let mut state = self.shared.state.lock();
            let Some(preset) = state.presets.get(token).cloned() else {
                return false;
            };
            state.position = PtzPosition::new(preset.pan, preset.tilt, preset.zoom);
            state.velocity = PtzVelocity::default();
            self.shared.publish_default_flag(&state);
            preset
        };
        tracing::debug!(token, "goto preset");

        self.notify("goto_preset", |h| {
            h.on_goto_preset(token, preset.pan, preset.tilt, preset.zoom)
        });
        true
    }

    /// Delete a preset. Returns false for an unknown token or for `home`.
    pub fn remove_preset(&self, token: &str) -> bool {
        if token == HOME_PRESET_TOKEN {
            return false;
        }
        let snapshot = {
            let mut state = self.shared.state.lock();
            if state.presets.remove(token).is_none() {
                return false;
            }
            state.presets.values().cloned().collect::<Vec<_>>()
        };
        tracing::info!(token, "preset removed");

        self.persist(&snapshot);
        true
    }

    pub fn get_presets(&self) -> Vec<PtzPreset> {
        self.shared.state.lock().presets.values().cloned().collect()
    }

    fn persist(&self, presets: &[PtzPreset]) {
        if let Err(e) = self.store.save(presets) {
            tracing::warn!(error = %e, "failed to persist PTZ presets");
        }
    }

    // --- Status ---

    pub fn status(&self) -> PtzStatus {
        let state = self.shared.state.lock();
        PtzStatus {
            pan: state.position.pan,
            tilt: state.position.tilt,
            zoom: state.position.zoom,
            moving: state.velocity.is_moving(),
        }
    }

    pub fn position(&self) -> PtzPosition {
        self.shared.state.lock().position
    }

    pub fn velocity(&self) -> PtzVelocity {
        self.shared.state.lock().velocity
    }

    pub fn is_at_default(&self) -> bool {
        self.shared.at_default.load(Ordering::Acquire)
    }

    // --- Frame path ---

    pub fn digital_ptz_enabled(&self) -> bool {
        self.digital_ptz
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.transform.output_size()
    }

    pub fn set_output_size(&self, width: u32, height: u32) {
        self.transform.set_output_size(width, height);
    }

    /// Crop and scale `frame` to the current viewport.
    ///
    /// Returns the same `Arc` when digital PTZ is off or the viewport is at
    /// home.
    pub fn apply_transform(&self, frame: &Arc<Frame>) -> Result<Arc<Frame>> {
        if !self.digital_ptz || self.is_at_default() {
            return Ok(Arc::clone(frame));
        }
        let position = self.position();
        self.transform.apply(frame, position)
    }
}

fn next_preset_token(state: &PtzState) -> String {
    (1..)
        .map(|n| format!("preset_{n}"))
        .find(|t| !state.presets.contains_key(t))
        .unwrap_or_else(|| format!("preset_{}", state.presets.len() + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn controller() -> PtzController {
        PtzController::in_memory().unwrap()
    }

    #[test]
    fn absolute_move_reports_clamped_position() {
        let ptz = controller();
        let inputs = [
            (0.3, -0.7, 0.5),
            (1.0, 1.0, 1.0),
            (-1.0, -1.0, 0.0),
            (2.5, -3.0, 1.7),
            (-0.01, 0.99, -0.4),
        ];
        for (pan, tilt, zoom) in inputs {
            ptz.absolute_move(Some(pan), Some(tilt), Some(zoom));
            let status = ptz.status();
            let expected = PtzPosition::new(pan, tilt, zoom);
            assert_eq!(
                (status.pan, status.tilt, status.zoom),
                (expected.pan, expected.tilt, expected.zoom),
                "input {pan} {tilt} {zoom}"
            );
            assert!(!status.moving);
        }
    }

    #[test]
    fn absolute_move_leaves_unspecified_axes() {
        let ptz = controller();
        ptz.absolute_move(Some(0.2), Some(0.4), Some(0.6));
        ptz.absolute_move(None, Some(-0.4), None);
        assert_eq!(ptz.position(), PtzPosition::new(0.2, -0.4, 0.6));
    }

    #[test]
    fn home_position_returns_same_frame() {
        let ptz = controller();
        ptz.absolute_move(Some(0.5), Some(0.5), Some(0.5));
        ptz.absolute_move(Some(0.0), Some(0.0), Some(0.0));
        assert!(ptz.is_at_default());

        let frame = Arc::new(Frame::filled(64, 36, [1, 2, 3]));
        let out = ptz.apply_transform(&frame).unwrap();
        assert!(Arc::ptr_eq(&frame, &out));
    }

    #[test]
    fn zoomed_frame_has_output_size() {
        let ptz = PtzController::new(
            PtzSettings {
                output_width: 64,
                output_height: 36,
                ..PtzSettings::default()
            },
            Box::<MemoryPresetStore>::default(),
        )
        .unwrap();
        ptz.absolute_move(Some(0.3), None, Some(0.5));

        let frame = Arc::new(Frame::filled(128, 72, [9, 9, 9]));
        let out = ptz.apply_transform(&frame).unwrap();
        assert!(!Arc::ptr_eq(&frame, &out));
        assert_eq!((out.width(), out.height()), (64, 36));
    }

    #[test]
    fn disabled_digital_ptz_passes_frames_through() {
        let ptz = PtzController::new(
            PtzSettings {
                digital_ptz: false,
                ..PtzSettings::default()
            },
            Box::<MemoryPresetStore>::default(),
        )
        .unwrap();
        ptz.absolute_move(Some(0.5), Some(0.5), Some(1.0));
        let frame = Arc::new(Frame::filled(8, 8, [0, 0, 0]));
        assert!(Arc::ptr_eq(&frame, &ptz.apply_transform(&frame).unwrap()));
    }

    #[test]
    fn preset_round_trip_is_exact() {
        let ptz = controller();
        ptz.absolute_move(Some(0.123456), Some(-0.654321), Some(0.5));
        let token = ptz.set_preset(Some("door"), "Front door").unwrap();
        assert_eq!(token, "door");

        ptz.absolute_move(Some(-1.0), Some(1.0), Some(0.0));
        assert!(ptz.goto_preset("door"));
        assert_eq!(ptz.position(), PtzPosition::new(0.123456, -0.654321, 0.5));
    }

    #[test]
    fn generated_tokens_fill_gaps() {
        let ptz = controller();
        assert_eq!(ptz.set_preset(None, "a").unwrap(), "preset_1");
        assert_eq!(ptz.set_preset(None, "b").unwrap(), "preset_2");
        assert!(ptz.remove_preset("preset_1"));
        assert_eq!(ptz.set_preset(None, "c").unwrap(), "preset_1");
    }

    #[test]
    fn home_preset_always_exists_and_is_reserved() {
        let ptz = controller();
        let home = ptz
            .get_presets()
            .into_iter()
            .find(|p| p.token == HOME_PRESET_TOKEN)
            .expect("home preset");
        assert_eq!((home.pan, home.tilt, home.zoom), (0.0, 0.0, 0.0));

        assert!(!ptz.remove_preset(HOME_PRESET_TOKEN));
        assert!(matches!(
            ptz.set_preset(Some(HOME_PRESET_TOKEN), "x"),
            Err(CameraError::ReservedPreset(_))
        ));
    }

    #[test]
    fn unknown_preset_is_false_not_error() {
        let ptz = controller();
        assert!(!ptz.goto_preset("nope"));
        assert!(!ptz.remove_preset("nope"));
    }

    #[test]
    fn presets_are_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        {
            let ptz =
                PtzController::new(PtzSettings::default(), Box::new(JsonPresetStore::new(&path)))
                    .unwrap();
            ptz.absolute_move(Some(0.25), Some(0.5), Some(0.75));
            ptz.set_preset(Some("desk"), "Desk").unwrap();
        }
        let ptz = PtzController::new(PtzSettings::default(), Box::new(JsonPresetStore::new(&path)))
            .unwrap();
        assert!(ptz.goto_preset("desk"));
        assert_eq!(ptz.position(), PtzPosition::new(0.25, 0.5, 0.75));
    }

    #[test]
    fn stop_movement_twice_is_idle() {
        let ptz = controller();
        ptz.continuous_move(0.5, -0.5, 0.5);
        assert!(ptz.status().moving);
        ptz.stop_movement(true, true);
        assert_eq!(ptz.velocity(), PtzVelocity::default());
        ptz.stop_movement(true, true);
        assert_eq!(ptz.velocity(), PtzVelocity::default());
        assert!(!ptz.status().moving);
    }

    #[test]
    fn stop_movement_can_keep_zoom() {
        let ptz = controller();
        ptz.continuous_move(0.5, 0.5, 0.5);
        ptz.stop_movement(true, false);
        let v = ptz.velocity();
        assert_eq!((v.pan_speed, v.tilt_speed, v.zoom_speed), (0.0, 0.0, 0.5));
        ptz.stop_movement(false, true);
    }

    #[test]
    fn continuous_move_clamps_speed_and_advances_position() {
        let ptz = controller();
        ptz.continuous_move(5.0, 0.0, 0.0);
        assert_eq!(ptz.velocity().pan_speed, 1.0);

        std::thread::sleep(Duration::from_millis(250));
        let pan = ptz.position().pan;
        ptz.stop_movement(true, true);
        assert!(pan > 0.0, "pan should have advanced, got {pan}");
        assert!(pan <= 1.0);
        assert!(!ptz.is_at_default());
    }

    #[test]
    fn instantaneous_moves_cancel_velocity() {
        let ptz = controller();
        ptz.continuous_move(0.5, 0.5, 0.5);
        ptz.relative_move(0.1, 0.0, 0.0);
        assert!(!ptz.status().moving);

        ptz.continuous_move(0.5, 0.5, 0.5);
        ptz.goto_home();
        assert!(!ptz.status().moving);
        assert_eq!(ptz.position(), PtzPosition::default());
    }

    #[test]
    fn relative_move_clamps() {
        let ptz = controller();
        ptz.relative_move(0.8, -0.8, 0.8);
        ptz.relative_move(0.8, -0.8, 0.8);
        assert_eq!(ptz.position(), PtzPosition::new(1.0, -1.0, 1.0));
    }

    struct Counting {
        calls: AtomicUsize,
    }

    impl PtzHardwareHandler for Counting {
        fn on_absolute_move(
            &self,
            _pan: Option<f64>,
            _tilt: Option<f64>,
            _zoom: Option<f64>,
        ) -> std::result::Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_goto_home(&self) -> std::result::Result<(), HandlerError> {
            self.calls.fetch_add(10, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl PtzHardwareHandler for Failing {
        fn on_absolute_move(
            &self,
            _pan: Option<f64>,
            _tilt: Option<f64>,
            _zoom: Option<f64>,
        ) -> std::result::Result<(), HandlerError> {
            Err("servo offline".into())
        }

        fn on_goto_home(&self) -> std::result::Result<(), HandlerError> {
            panic!("servo exploded");
        }
    }

    #[test]
    fn failing_handler_does_not_block_others() {
        let ptz = controller();
        let counting = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        ptz.add_hardware_handler(Arc::new(Failing));
        ptz.add_hardware_handler(counting.clone());

        ptz.goto_home();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 11);

        ptz.absolute_move(Some(0.4), None, None);
        assert_eq!(ptz.position().pan, 0.4);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn handlers_can_be_removed() {
        let ptz = controller();
        let counting = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let handler: Arc<dyn PtzHardwareHandler> = counting.clone();
        ptz.add_hardware_handler(handler.clone());
        assert!(ptz.remove_hardware_handler(&handler));
        assert!(!ptz.remove_hardware_handler(&handler));

        ptz.absolute_move(Some(0.1), None, None);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }
}
