//! Raw video frames as they enter the camera.
//!
//! Frames are tightly packed RGB24 (3 bytes per pixel, no row padding).
//! They travel through the pipeline as `Arc<Frame>` so that the PTZ
//! fast path and multi-backend fan-out never copy pixel data.

use fast_image_resize as fir;
use fir::images::{Image, ImageRef};
use fir::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};

use crate::error::{CameraError, Result};

const BYTES_PER_PIXEL: usize = 3;

/// A single RGB24 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap an RGB24 buffer. Fails if `data` is not exactly `width * height * 3` bytes.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(CameraError::Transform(format!(
                "frame buffer is {} bytes, expected {expected} for {width}x{height} RGB24",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// A frame filled with one color.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * BYTES_PER_PIXEL);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Pixel at `(x, y)`; panics when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }
}

/// Axis-aligned region inside a source frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn full(frame: &Frame) -> Self {
        Self {
            x: 0,
            y: 0,
            width: frame.width,
            height: frame.height,
        }
    }
}

/// Cut `region` out of `src` and scale it to `out_w`x`out_h` with bilinear
/// interpolation.
///
/// When the region already has the output size the resizer is skipped and
/// rows are copied directly.
pub fn resize_region(
    resizer: &mut Resizer,
    src: &Frame,
    region: Region,
    out_w: u32,
    out_h: u32,
) -> Result<Frame> {
    if region.width == 0 || region.height == 0 || out_w == 0 || out_h == 0 {
        return Err(CameraError::Transform("zero-sized region".into()));
    }
    if region.x + region.width > src.width || region.y + region.height > src.height {
        return Err(CameraError::Transform(format!(
            "region {region:?} exceeds {}x{} source",
            src.width, src.height
        )));
    }

    if region.width == out_w && region.height == out_h {
        return Ok(crop_copy(src, region));
    }

    let src_view = ImageRef::new(src.width, src.height, &src.data, PixelType::U8x3)
        .map_err(|e| CameraError::Transform(e.to_string()))?;
    let mut dst = Image::new(out_w, out_h, PixelType::U8x3);

    let opts = ResizeOptions::new()
        .resize_alg(ResizeAlg::Convolution(FilterType::Bilinear))
        .crop(
            region.x as f64,
            region.y as f64,
            region.width as f64,
            region.height as f64,
        );

    resizer
        .resize(&src_view, &mut dst, &opts)
        .map_err(|e| CameraError::Transform(e.to_string()))?;

    Ok(Frame {
        width: out_w,
        height: out_h,
        data: dst.into_vec(),
    })
}

fn crop_copy(src: &Frame, region: Region) -> Frame {
    let row_bytes = region.width as usize * BYTES_PER_PIXEL;
    let src_stride = src.width as usize * BYTES_PER_PIXEL;
    let mut data = Vec::with_capacity(row_bytes * region.height as usize);
    for row in region.y..region.y + region.height {
        let start = row as usize * src_stride + region.x as usize * BYTES_PER_PIXEL;
        data.extend_from_slice(&src.data[start..start + row_bytes]);
    }
    Frame {
        width: region.width,
        height: region.height,
        data,
    }
}
