//! Digital PTZ: map a viewport position onto a crop of the source frame.
//!
//! ```text
//! zoom_factor = 1 + zoom * (max_zoom - 1)
//! crop        = floor(src / zoom_factor)           (per axis, <= src)
//! max_offset  = (src - crop) / 2
//! center_x    = src_w / 2 + pan  * max_offset_x
//! center_y    = src_h / 2 - tilt * max_offset_y    (positive tilt looks up)
//! ```
//!
//! The crop is then scaled to the output resolution with bilinear
//! interpolation.

use std::sync::Arc;

use fast_image_resize::Resizer;
use parking_lot::Mutex;

use super::PtzPosition;
use crate::error::Result;
use crate::frame::{self, Frame, Region};

/// Compute the crop rectangle for `position` inside a `src_w`x`src_h` frame.
pub fn crop_region(src_w: u32, src_h: u32, position: PtzPosition, max_zoom: f64) -> Region {
    let src_w_i = src_w as i64;
    let src_h_i = src_h as i64;

    let zoom_factor = (1.0 + position.zoom * (max_zoom - 1.0)).max(1.0);
    let crop_w = ((src_w as f64 / zoom_factor) as i64).clamp(1, src_w_i.max(1));
    let crop_h = ((src_h as f64 / zoom_factor) as i64).clamp(1, src_h_i.max(1));

    let max_offset_x = (src_w_i - crop_w) / 2;
    let max_offset_y = (src_h_i - crop_h) / 2;

    let center_x = src_w_i / 2 + (position.pan * max_offset_x as f64) as i64;
    let center_y = src_h_i / 2 - (position.tilt * max_offset_y as f64) as i64;

    let x1 = (center_x - crop_w / 2).max(0);
    let y1 = (center_y - crop_h / 2).max(0);
    let x2 = (x1 + crop_w).min(src_w_i);
    let y2 = (y1 + crop_h).min(src_h_i);

    Region {
        x: x1 as u32,
        y: y1 as u32,
        width: (x2 - x1) as u32,
        height: (y2 - y1) as u32,
    }
}

struct TransformState {
    resizer: Resizer,
    output_width: u32,
    output_height: u32,
}

/// Crop/resize stage applied to every submitted frame.
///
/// Holds the output resolution and a reusable resizer. The lock only
/// serializes frames of the same camera; it is never held by the PTZ
/// control path.
pub struct FrameTransform {
    max_zoom: f64,
    state: Mutex<TransformState>,
}

impl FrameTransform {
    pub fn new(output_width: u32, output_height: u32, max_zoom: f64) -> Self {
        Self {
            max_zoom,
            state: Mutex::new(TransformState {
                resizer: Resizer::new(),
                output_width,
                output_height,
            }),
        }
    }

    pub fn max_zoom(&self) -> f64 {
        self.max_zoom
    }

    pub fn output_size(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.output_width, state.output_height)
    }

    pub fn set_output_size(&self, width: u32, height: u32) {
        let mut state = self.state.lock();
        state.output_width = width;
        state.output_height = height;
    }

    /// Crop `frame` around `position` and scale it to the output size.
    pub fn apply(&self, frame: &Arc<Frame>, position: PtzPosition) -> Result<Arc<Frame>> {
        let region = crop_region(frame.width(), frame.height(), position, self.max_zoom);
        let mut state = self.state.lock();
        let (out_w, out_h) = (state.output_width, state.output_height);
        let out = frame::resize_region(&mut state.resizer, frame, region, out_w, out_h)?;
        Ok(Arc::new(out))
    }
}
