//! Background integration of continuous-move velocity into position.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::Shared;
use super::state::PtzState;

/// Tick interval while any axis is moving (~60 Hz).
pub const ACTIVE_TICK: Duration = Duration::from_micros(16_667);

/// Sleep interval while velocity is zero.
pub const IDLE_TICK: Duration = Duration::from_millis(50);

/// Advance `state` by `dt_secs` of motion. Returns whether any axis moved.
pub(crate) fn integrate(state: &mut PtzState, dt_secs: f64) -> bool {
    if !state.velocity.is_moving() {
        return false;
    }
    state.position.pan += state.velocity.pan_speed * dt_secs;
    state.position.tilt += state.velocity.tilt_speed * dt_secs;
    state.position.zoom += state.velocity.zoom_speed * dt_secs;
    state.position = state.position.clamped();
    true
}

/// Handle to the motion thread. Dropping it stops and joins the thread.
pub(crate) struct MotionLoop {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MotionLoop {
    pub(crate) fn spawn(shared: Arc<Shared>) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("ptz-motion".into())
            .spawn(move || run(shared, flag))?;
        tracing::debug!("PTZ motion loop started");
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("PTZ motion thread panicked");
        }
    }
}

impl Drop for MotionLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>, running: Arc<AtomicBool>) {
    let mut last = Instant::now();
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        let dt = now.duration_since(last).as_secs_f64();
        last = now;

        let moving = {
            let mut state = shared.state.lock();
            let moved = integrate(&mut state, dt);
            if moved {
                shared.publish_default_flag(&state);
            }
            moved
        };

        thread::sleep(if moving { ACTIVE_TICK } else { IDLE_TICK });
    }
    tracing::debug!("PTZ motion loop exited");
}
