//! Camera lifecycle: state machine, worker threads and capture strategies

pub mod device;
pub mod permit;
pub mod state;
pub mod strategy;
pub mod worker;

pub use device::{CameraDevice, DeviceOptions, PreviewCallback};
pub use state::{Command, Event, LifecycleState, Transition};
pub use strategy::{choose_strategy, CaptureStrategy, HighSpeedCapture, StandardCapture};
