pub mod camera;
pub mod capture;
pub mod convert;
pub mod coordinator;
pub mod error;
pub mod pipeline;

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::frame::{ColorOrder, Frame, PixelLayout, Resolution};
pub use coordinator::{CameraCoordinator, CoordinatorOptions, NONE_ID};
pub use error::{ConfigError, Error, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// The configuration currently installed in [`CONFIG`]
pub fn config() -> Arc<Config> {
    CONFIG.load_full()
}

/// Prefix of environment overrides, e.g. `MULTICAM__PIPELINE__QUEUE_CAPACITY=8`
pub const ENV_PREFIX: &str = "MULTICAM";

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub acceleration: AccelerationConfig,
}

/// Where cameras come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// V4L2 when a capture device exists, synthetic otherwise
    Auto,
    V4l2,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub platform: PlatformKind,
    /// Camera ids to start; empty means every rear and front camera found
    pub cameras: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub color_order: ColorOrder,
    pub grey: bool,
    pub high_frame_rate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub readiness_deadline_ms: u64,
    pub poll_interval_ms: u64,
    /// Overrides the per-strategy permit wait
    pub permit_timeout_ms: Option<u64>,
    pub pin_workers: bool,
    /// Stop the demo after this long; runs until Ctrl-C when unset
    pub run_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccelerationConfig {
    pub enabled: bool,
    pub pool_size: usize,
    pub grey_separate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                platform: PlatformKind::Auto,
                cameras: Vec::new(),
                width: 640,
                height: 480,
                color_order: ColorOrder::Rgba,
                grey: true,
                high_frame_rate: false,
            },
            pipeline: PipelineConfig {
                queue_capacity: 4,
                readiness_deadline_ms: 5000,
                poll_interval_ms: 20,
                permit_timeout_ms: None,
                pin_workers: false,
                run_seconds: None,
            },
            acceleration: AccelerationConfig {
                enabled: true,
                pool_size: 2,
                grey_separate: false,
            },
        }
    }
}

impl Config {
    /// Defaults, then `path` if it exists, then `MULTICAM__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("capture.cameras"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "capture size {}x{} is empty",
                self.capture.width, self.capture.height
            )));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Invalid("pipeline.queue_capacity must be at least 1".into()));
        }
        if self.pipeline.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("pipeline.poll_interval_ms must be at least 1".into()));
        }
        Ok(())
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.capture.width, self.capture.height)
    }

    /// Make this the process-wide configuration
    pub fn install(self) -> Arc<Config> {
        let config = Arc::new(self);
        CONFIG.store(config.clone());
        config
    }
}
