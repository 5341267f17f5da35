//! Error types shared across the capture pipeline

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Preview(#[from] PreviewError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Fatal error codes reported by the platform for an open device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformErrorCode {
    CameraInUse,
    MaxCamerasInUse,
    CameraDisabled,
    DeviceFatal,
    ServiceFatal,
    Unknown,
}

impl PlatformErrorCode {
    /// Human-readable reason logged when the platform reports this code
    pub fn message(self) -> &'static str {
        match self {
            Self::CameraDisabled => "The camera device could not be opened due to a device policy.",
            Self::CameraInUse => "The camera device is in use already.",
            Self::ServiceFatal => "The camera service has encountered a fatal error.",
            Self::DeviceFatal => "The camera device has encountered a fatal error.",
            Self::MaxCamerasInUse => {
                "The camera device could not be opened because there are too many other open camera devices."
            }
            Self::Unknown => "Unknown error",
        }
    }
}

impl std::fmt::Display for PlatformErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Errors raised by a [`CameraPlatform`](crate::capture::CameraPlatform) implementation
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("camera {0} not found")]
    NotFound(String),

    #[error("capability query failed for camera {id}: {reason}")]
    Capability { id: String, reason: String },

    #[error("camera {id}: {code}")]
    Device { id: String, code: PlatformErrorCode },

    #[error("session negotiation failed for camera {id}: {reason}")]
    Session { id: String, reason: String },

    #[error("capture request rejected for camera {id}: {reason}")]
    Request { id: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Lifecycle errors of a single camera device
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("camera {0} does not support a YUV 4:2:0 output layout")]
    UnsupportedLayout(String),

    #[error("camera {0} has not been opened")]
    NotOpen(String),

    #[error("timed out waiting for the open/close permit of camera {0}")]
    PermitTimeout(String),

    #[error("camera {id} cannot preview at empty size {resolution}")]
    EmptyResolution {
        id: String,
        resolution: crate::capture::Resolution,
    },

    #[error("could not start worker thread for camera {id}: {source}")]
    Worker {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Frame conversion errors
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("out of memory allocating {bytes} bytes of frame output")]
    OutOfMemory { bytes: usize },

    #[error("{what} buffer is {actual} bytes, expected {expected}")]
    BufferSize {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("frame size {0} has no pixels")]
    EmptyFrame(crate::capture::Resolution),

    #[error("unsupported raw layout {0:?}")]
    UnsupportedLayout(crate::capture::PixelLayout),

    #[error("acceleration unavailable: {0}")]
    Acceleration(String),
}

/// Outcome of a failed multi-camera preview start
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("camera {0} not initialised")]
    NotInitialized(String),

    #[error("{}", failure_detail(.failed, .unresponsive))]
    Failed {
        failed: Vec<String>,
        unresponsive: Vec<String>,
    },
}

impl PreviewError {
    /// Every camera id that did not come up, in report order
    pub fn failed_ids(&self) -> Vec<&str> {
        match self {
            Self::NotInitialized(id) => vec![id.as_str()],
            Self::Failed {
                failed,
                unresponsive,
            } => failed
                .iter()
                .chain(unresponsive.iter())
                .map(String::as_str)
                .collect(),
        }
    }
}

fn failure_detail(failed: &[String], unresponsive: &[String]) -> String {
    let mut detail = String::from("Cameras that failed to preview:");
    for id in failed {
        detail.push(' ');
        detail.push_str(id);
    }
    if !unresponsive.is_empty() {
        detail.push_str(" (no response from:");
        for id in unresponsive {
            detail.push(' ');
            detail.push_str(id);
        }
        detail.push(')');
    }
    detail
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
