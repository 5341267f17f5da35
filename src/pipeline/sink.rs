//! Consumer side of the capture pipeline

use crate::capture::frame::{ColorOrder, Frame, Resolution};
use crate::convert::yuv;
use crate::error::ConvertError;

/// Contiguous I420 frame plus the output buffers to convert it into.
///
/// Output buffers are allocated by the converter so that an allocation
/// failure is handled before the sink is involved.
pub struct YuvFrame {
    pub camera_id: std::sync::Arc<str>,
    pub color_order: ColorOrder,
    pub timestamp: u64,
    pub resolution: Resolution,
    pub yuv: Vec<u8>,
    pub rgba: Vec<u8>,
    pub grey: Option<Vec<u8>>,
}

impl YuvFrame {
    /// BT.601 conversion into the carried buffers
    pub fn convert(mut self) -> Result<Frame, ConvertError> {
        yuv::i420_to_rgba(&self.yuv, self.resolution, self.color_order, &mut self.rgba)?;
        if let Some(grey) = self.grey.as_mut() {
            yuv::i420_to_grey(&self.yuv, self.resolution, grey)?;
        }
        Frame::new(
            self.camera_id,
            self.color_order,
            self.timestamp,
            self.resolution,
            self.rgba,
            self.grey,
        )
    }
}

/// Downstream consumer of converted frames (the vision engine).
///
/// Called concurrently from every camera worker.
pub trait FrameSink: Send + Sync + 'static {
    /// Announce a camera before its first frame
    fn register_camera(&self, camera_id: &str, capacity: usize, rear_facing: bool) -> bool;

    /// Hand over a converted frame; false if it was rejected
    fn enqueue(&self, frame: Frame) -> bool;

    /// Hand over a raw I420 frame for conversion into its output buffers
    fn enqueue_yuv(&self, frame: YuvFrame) -> bool {
        match frame.convert() {
            Ok(frame) => self.enqueue(frame),
            Err(err) => {
                tracing::warn!(%err, "Dropping frame that failed conversion");
                false
            }
        }
    }

    /// Frames accepted but not yet consumed, across all cameras
    fn in_flight(&self) -> usize;

    /// Drop everything queued for one camera
    fn clear_queue(&self, camera_id: &str) -> bool;

    fn set_preview_size(&self, _camera_id: &str, _size: Resolution) -> bool {
        true
    }
}
