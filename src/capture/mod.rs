pub mod frame;
pub mod platform;
pub mod size;
pub mod synthetic;
pub mod v4l2;

pub use frame::{ColorOrder, Frame, PixelLayout, Plane, RawFrame, Resolution};
pub use platform::{
    CameraDescriptor, CameraPlatform, CaptureRequest, CaptureSession, EventSink, Facing, FpsRange,
    PlatformDevice, PlatformEvent, SessionConfig, SessionKind,
};
pub use synthetic::{SyntheticCamera, SyntheticPlatform};
pub use v4l2::V4l2Platform;
