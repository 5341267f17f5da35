//! Capture strategies: how a device negotiates its session

use std::time::Duration;

use crate::capture::platform::{CameraDescriptor, FpsRange, SessionKind};

/// Session negotiation details that differ between capture modes
pub trait CaptureStrategy: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn session_kind(&self) -> SessionKind;

    /// Default bound on waiting for the open/close permit
    fn permit_timeout(&self) -> Duration;

    fn target_fps(&self) -> u32;

    /// Frame-rate range for the repeating request
    fn select_fps_range(&self, descriptor: &CameraDescriptor) -> FpsRange;
}

/// Regular preview session at sensor frame rate
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCapture;

impl CaptureStrategy for StandardCapture {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn session_kind(&self) -> SessionKind {
        SessionKind::Regular
    }

    fn permit_timeout(&self) -> Duration {
        Duration::from_millis(3000)
    }

    fn target_fps(&self) -> u32 {
        30
    }

    /// Widest range reaching the target, else the widest range overall
    fn select_fps_range(&self, descriptor: &CameraDescriptor) -> FpsRange {
        let ranges = &descriptor.standard_fps;
        let target = self.target_fps();
        ranges
            .iter()
            .filter(|r| r.reaches(target))
            .max_by_key(|r| r.span())
            .or_else(|| ranges.iter().max_by_key(|r| r.span()))
            .copied()
            .unwrap_or(FpsRange::fixed(target))
    }
}

/// Constrained high-speed session.
///
/// Experimental: only chosen when explicitly requested and the camera
/// advertises high-speed capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct HighSpeedCapture;

impl HighSpeedCapture {
    pub fn is_supported(descriptor: &CameraDescriptor) -> bool {
        descriptor.supports_high_frame_rate && !descriptor.high_speed_fps.is_empty()
    }
}

impl CaptureStrategy for HighSpeedCapture {
    fn name(&self) -> &'static str {
        "high-speed"
    }

    fn session_kind(&self) -> SessionKind {
        SessionKind::ConstrainedHighSpeed
    }

    fn permit_timeout(&self) -> Duration {
        Duration::from_millis(2500)
    }

    fn target_fps(&self) -> u32 {
        60
    }

    /// First high-speed range reaching the target, else the middle entry
    fn select_fps_range(&self, descriptor: &CameraDescriptor) -> FpsRange {
        let ranges = &descriptor.high_speed_fps;
        let target = self.target_fps();
        ranges
            .iter()
            .find(|r| r.reaches(target))
            .or_else(|| ranges.get(ranges.len().saturating_sub(1) / 2))
            .copied()
            .unwrap_or(FpsRange::fixed(target))
    }
}

/// Pick the strategy for a camera: high speed only if asked for and available
pub fn choose_strategy(
    descriptor: &CameraDescriptor,
    want_high_frame_rate: bool,
) -> Box<dyn CaptureStrategy> {
    if want_high_frame_rate && HighSpeedCapture::is_supported(descriptor) {
        Box::new(HighSpeedCapture)
    } else {
        Box::new(StandardCapture)
    }
}
