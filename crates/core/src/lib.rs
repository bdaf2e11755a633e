//! Virtual PTZ network camera.
//!
//! Raw frames go in through [`Orchestrator::submit_frame`]. The
//! [`PtzController`] crops and scales them to the current digital
//! pan/tilt/zoom viewport, and the orchestrator fans the result out to
//! whichever delivery backends have consumers: the native RTSP/RTP H.264
//! [`Server`], an external relay, an injected WebRTC sink and a JPEG preview.

pub mod backend;
pub mod config;
mod delivery;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod media;
pub mod orchestrator;
pub mod protocol;
pub mod ptz;
pub mod server;
pub mod session;
pub mod stats;
pub mod stream;
pub mod transport;

pub use backend::FrameSink;
pub use config::{CameraConfig, HwAccel, StreamSettings};
pub use encoder::{EncoderBackend, EncoderFactory, H264Encoder, ParameterSets};
pub use error::{CameraError, Result};
pub use frame::Frame;
pub use media::{EncodedFrame, Packetizer};
pub use orchestrator::{Orchestrator, SinkFactory, StreamingMode};
pub use ptz::{PtzController, PtzHardwareHandler, PtzPosition, PtzPreset, PtzSettings, PtzStatus};
pub use server::{Server, ServerConfig, Viewer};
pub use stats::StreamStats;
