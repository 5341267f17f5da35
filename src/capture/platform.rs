//! Camera platform seam
//!
//! The platform owns the hardware: it answers capability queries, opens
//! devices, negotiates capture sessions and delivers frames. Everything it
//! reports back arrives asynchronously through an [`EventSink`], which posts
//! onto the owning device's worker queue. That is what guarantees callbacks
//! for one device never run concurrently.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::camera::worker::WorkerTask;
use crate::capture::frame::{PixelLayout, RawFrame, Resolution};
use crate::error::{PlatformError, PlatformErrorCode};

/// Which way a camera points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facing {
    Rear,
    Front,
    External,
}

/// Inclusive frame-rate range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FpsRange {
    pub min: u32,
    pub max: u32,
}

impl FpsRange {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub const fn fixed(fps: u32) -> Self {
        Self { min: fps, max: fps }
    }

    /// True if the range touches `target` at either end or beyond
    pub fn reaches(&self, target: u32) -> bool {
        self.max >= target || self.min >= target
    }

    pub fn span(&self) -> u32 {
        self.min + self.max
    }
}

impl std::fmt::Display for FpsRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Immutable capability snapshot of one camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub id: String,
    pub name: String,
    pub facing: Facing,
    pub layouts: HashSet<PixelLayout>,
    pub supports_high_frame_rate: bool,
    pub standard_fps: Vec<FpsRange>,
    pub high_speed_fps: Vec<FpsRange>,
}

impl CameraDescriptor {
    pub fn is_rear_facing(&self) -> bool {
        self.facing == Facing::Rear
    }

    pub fn supports(&self, layout: PixelLayout) -> bool {
        self.layouts.contains(&layout)
    }

    /// Preferred convertible layout: planar first, semi-planar as fallback
    pub fn best_layout(&self) -> Option<PixelLayout> {
        PixelLayout::CONVERTIBLE
            .into_iter()
            .find(|layout| self.supports(*layout))
    }
}

/// Session flavour requested from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Regular,
    ConstrainedHighSpeed,
}

/// Parameters for a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub layout: PixelLayout,
    pub resolution: Resolution,
    pub kind: SessionKind,
}

/// Repeating capture request applied once a session is configured
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRequest {
    pub autofocus: bool,
    pub auto_white_balance: bool,
    /// Lens focus distance in diopters, 0 is infinity
    pub focus_distance: f32,
    pub fps_range: FpsRange,
}

impl CaptureRequest {
    /// Fixed preview configuration: no AF, no AWB, focus locked at infinity
    pub fn fixed_preview(fps_range: FpsRange) -> Self {
        Self {
            autofocus: false,
            auto_white_balance: false,
            focus_distance: 0.0,
            fps_range,
        }
    }
}

/// Asynchronous notifications from the platform to a device
pub enum PlatformEvent {
    Opened(Box<dyn PlatformDevice>),
    Disconnected,
    Error(PlatformErrorCode),
    Configured(Box<dyn CaptureSession>),
    ConfigureFailed(String),
    FrameAvailable(RawFrame),
}

impl std::fmt::Debug for PlatformEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened(_) => f.write_str("Opened"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Error(code) => write!(f, "Error({code:?})"),
            Self::Configured(_) => f.write_str("Configured"),
            Self::ConfigureFailed(reason) => write!(f, "ConfigureFailed({reason})"),
            Self::FrameAvailable(raw) => write!(f, "FrameAvailable(#{})", raw.sequence),
        }
    }
}

/// Handle the platform uses to post events onto a device's worker queue
#[derive(Clone)]
pub struct EventSink {
    camera_id: Arc<str>,
    tx: flume::Sender<WorkerTask>,
}

impl EventSink {
    pub(crate) fn new(camera_id: Arc<str>, tx: flume::Sender<WorkerTask>) -> Self {
        Self { camera_id, tx }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Post an event; false once the worker has shut down
    pub fn post(&self, event: PlatformEvent) -> bool {
        self.tx.send(WorkerTask::Platform(event)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }
}

/// Source of cameras
pub trait CameraPlatform: Send + Sync + 'static {
    fn camera_ids(&self) -> Result<Vec<String>, PlatformError>;

    /// Capability query
    fn describe(&self, id: &str) -> Result<CameraDescriptor, PlatformError>;

    /// Output sizes for `layout`, or high-speed video sizes when `high_frame_rate`
    fn output_sizes(
        &self,
        id: &str,
        layout: PixelLayout,
        high_frame_rate: bool,
    ) -> Result<Vec<Resolution>, PlatformError>;

    /// Begin opening a camera. Completion is reported through `events` as
    /// `Opened`, `Disconnected` or `Error`.
    fn open_camera(&self, id: &str, events: EventSink) -> Result<(), PlatformError>;
}

/// An opened camera
pub trait PlatformDevice: Send {
    /// Begin negotiating a session; reports `Configured` or `ConfigureFailed`.
    /// Frames of the session are later posted to `events` as `FrameAvailable`.
    fn create_session(&mut self, config: &SessionConfig, events: EventSink) -> Result<(), PlatformError>;

    fn close(&mut self);
}

/// A configured capture session
pub trait CaptureSession: Send {
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<(), PlatformError>;

    /// Stop outstanding captures, letting in-flight ones drain
    fn abort_captures(&mut self) -> Result<(), PlatformError>;

    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(layouts: &[PixelLayout]) -> CameraDescriptor {
        CameraDescriptor {
            id: "0".into(),
            name: "test".into(),
            facing: Facing::Rear,
            layouts: layouts.iter().copied().collect(),
            supports_high_frame_rate: false,
            standard_fps: vec![],
            high_speed_fps: vec![],
        }
    }

    #[test]
    fn planar_preferred() {
        let d = descriptor(&[PixelLayout::SemiPlanar420, PixelLayout::Planar420]);
        assert_eq!(d.best_layout(), Some(PixelLayout::Planar420));
    }

    #[test]
    fn semi_planar_fallback() {
        let d = descriptor(&[PixelLayout::Jpeg, PixelLayout::SemiPlanar420]);
        assert_eq!(d.best_layout(), Some(PixelLayout::SemiPlanar420));
    }

    #[test]
    fn no_convertible_layout() {
        let d = descriptor(&[PixelLayout::Jpeg, PixelLayout::Rgb565]);
        assert_eq!(d.best_layout(), None);
    }
}
