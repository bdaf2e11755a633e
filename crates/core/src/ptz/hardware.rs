use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Error type returned by hardware callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// External actuator that mirrors digital PTZ commands.
///
/// Implement this to drive motors, servos or gimbals from the same control
/// surface that steers the digital viewport. Every callback receives the
/// values passed to the triggering PTZ call:
///
/// - pan: -1.0 (left) to 1.0 (right)
/// - tilt: -1.0 (down) to 1.0 (up)
/// - zoom: 0.0 (wide) to 1.0 (tele)
/// - speeds: -1.0 to 1.0
///
/// All methods default to doing nothing, so an adapter only overrides what
/// its hardware supports. Errors and panics are caught and logged by the
/// controller; they never reach the caller or other handlers.
pub trait PtzHardwareHandler: Send + Sync {
    fn on_continuous_move(
        &self,
        _pan_speed: f64,
        _tilt_speed: f64,
        _zoom_speed: f64,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_stop(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_absolute_move(
        &self,
        _pan: Option<f64>,
        _tilt: Option<f64>,
        _zoom: Option<f64>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_relative_move(
        &self,
        _pan_delta: f64,
        _tilt_delta: f64,
        _zoom_delta: f64,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_goto_preset(
        &self,
        _token: &str,
        _pan: f64,
        _tilt: f64,
        _zoom: f64,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_goto_home(&self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Invoke `callback` on every handler, containing failures per handler.
pub(crate) fn notify_all<F>(handlers: &[Arc<dyn PtzHardwareHandler>], event: &str, callback: F)
where
    F: Fn(&dyn PtzHardwareHandler) -> Result<(), HandlerError>,
{
    for (index, handler) in handlers.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| callback(handler.as_ref()))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(event, handler = index, error = %e, "hardware handler failed");
            }
            Err(_) => {
                tracing::error!(event, handler = index, "hardware handler panicked");
            }
        }
    }
}
