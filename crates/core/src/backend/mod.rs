//! Delivery backends the orchestrator fans frames out to.
//!
//! | Backend | Delivery | Consumers known? |
//! |---------|----------|------------------|
//! | [`relay::RelayBackend`] | `ffmpeg` pushes to an external relay daemon | no, always fed |
//! | [`native::NativeRtspBackend`] | in-process RTSP server, `main` + `sub` | yes |
//! | WebRTC | injected [`FrameSink`] | yes |
//! | [`broadcast::BroadcastHub`] | JPEG preview over channels | yes |

pub mod broadcast;
pub mod native;
pub mod relay;

use std::sync::Arc;

use crate::error::Result;
use crate::frame::Frame;

/// A destination for PTZ-transformed frames.
///
/// Sinks are fed from the single ingestion thread but may be queried from
/// others (viewer counts, status), so methods take `&self`.
pub trait FrameSink: Send + Sync {
    fn name(&self) -> &str;

    /// Whether anybody would see a frame sent now. Frames are not sent to a
    /// sink without consumers.
    fn has_consumers(&self) -> bool;

    /// Deliver one frame. `Ok(false)` means the sink skipped it.
    fn send_frame(&self, frame: &Arc<Frame>) -> Result<bool>;

    /// Release every resource. Idempotent.
    fn stop(&self);
}
