use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::ConvertError;

/// Process-wide origin of frame timestamps
static CLOCK_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic timestamp in nanoseconds
pub fn monotonic_nanos() -> u64 {
    CLOCK_ORIGIN.elapsed().as_nanos() as u64
}

/// Raw sensor layouts a camera may advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelLayout {
    /// Separate Y, U and V planes, chroma subsampled 2:1 in both axes
    Planar420,
    /// One Y plane plus interleaved chroma (NV12/NV21)
    SemiPlanar420,
    Rgb565,
    Rgba8888,
    Jpeg,
}

impl PixelLayout {
    /// Layouts the conversion pipeline accepts, in order of preference
    pub const CONVERTIBLE: [PixelLayout; 2] = [PixelLayout::Planar420, PixelLayout::SemiPlanar420];

    pub fn is_convertible(self) -> bool {
        Self::CONVERTIBLE.contains(&self)
    }
}

/// Channel order of converted output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorOrder {
    #[default]
    Rgba,
    Bgra,
}

/// Frame dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn long_side(&self) -> u32 {
        self.width.max(self.height)
    }

    pub fn short_side(&self) -> u32 {
        self.width.min(self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn rgba_len(&self) -> usize {
        self.pixel_count() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One plane of a raw frame as delivered by the platform
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    /// Bytes between the starts of consecutive rows
    pub row_stride: usize,
    /// Bytes between consecutive samples within a row
    pub pixel_stride: usize,
}

impl Plane {
    pub fn new(data: Bytes, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data,
            row_stride,
            pixel_stride,
        }
    }
}

/// Raw sensor frame, Y plane first followed by the two chroma planes
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub layout: PixelLayout,
    pub width: u32,
    pub height: u32,
    pub planes: [Plane; 3],
    pub sequence: u64,
    pub device_timestamp: Option<Duration>,
}

impl RawFrame {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Converted frame handed to the sink; immutable after construction
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: Arc<str>,
    pub color_order: ColorOrder,
    /// Capture time in monotonic nanoseconds, taken when the raw frame arrived
    pub timestamp: u64,
    pub width: u32,
    pub height: u32,
    pub rgba: Bytes,
    pub grey: Option<Bytes>,
}

impl Frame {
    /// Build a frame, rejecting output buffers of the wrong size
    pub fn new(
        camera_id: Arc<str>,
        color_order: ColorOrder,
        timestamp: u64,
        resolution: Resolution,
        rgba: Vec<u8>,
        grey: Option<Vec<u8>>,
    ) -> Result<Self, ConvertError> {
        if rgba.len() != resolution.rgba_len() {
            return Err(ConvertError::BufferSize {
                what: "rgba",
                expected: resolution.rgba_len(),
                actual: rgba.len(),
            });
        }
        if let Some(grey) = &grey {
            if grey.len() != resolution.pixel_count() {
                return Err(ConvertError::BufferSize {
                    what: "grey",
                    expected: resolution.pixel_count(),
                    actual: grey.len(),
                });
            }
        }

        Ok(Self {
            camera_id,
            color_order,
            timestamp,
            width: resolution.width,
            height: resolution.height,
            rgba: Bytes::from(rgba),
            grey: grey.map(Bytes::from),
        })
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}
