//! Virtual camera platform producing moving test patterns
//!
//! Each camera can be told to misbehave (fail the open call, report an error,
//! reject the session, never answer) so the lifecycle and coordinator paths
//! can be exercised without hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::capture::frame::{PixelLayout, Plane, RawFrame, Resolution};
use crate::capture::platform::{
    CameraDescriptor, CameraPlatform, CaptureRequest, CaptureSession, EventSink, Facing, FpsRange,
    PlatformDevice, PlatformEvent, SessionConfig,
};
use crate::error::{PlatformError, PlatformErrorCode};

/// Chroma rows are padded by this many bytes to mimic real drivers
const CHROMA_PADDING: usize = 16;

/// How a synthetic camera responds to the lifecycle
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// `open_camera` itself returns an error
    pub reject_open: bool,
    /// The asynchronous open reports this error instead of opening
    pub open_error: Option<PlatformErrorCode>,
    /// Session negotiation fails with this reason
    pub session_failure: Option<String>,
    /// The open never completes
    pub stall: bool,
    /// Delay before the open completes
    pub open_delay: Duration,
}

/// Lifecycle counters of one synthetic camera
#[derive(Debug, Default)]
pub struct SyntheticStats {
    pub opens: AtomicUsize,
    pub device_closes: AtomicUsize,
    pub session_closes: AtomicUsize,
    pub aborts: AtomicUsize,
    pub frames: AtomicU64,
}

/// One virtual camera
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    pub descriptor: CameraDescriptor,
    pub sizes: Vec<Resolution>,
    pub high_speed_sizes: Vec<Resolution>,
    /// Upper bound on the generated frame rate
    pub max_fps: u32,
    pub behavior: Behavior,
}

impl SyntheticCamera {
    /// A camera offering both YUV layouts at common sizes
    pub fn new(id: &str, facing: Facing) -> Self {
        Self {
            descriptor: CameraDescriptor {
                id: id.to_owned(),
                name: format!("Synthetic camera {id}"),
                facing,
                layouts: [PixelLayout::Planar420, PixelLayout::SemiPlanar420]
                    .into_iter()
                    .collect(),
                supports_high_frame_rate: false,
                standard_fps: vec![FpsRange::new(15, 30), FpsRange::fixed(30)],
                high_speed_fps: Vec::new(),
            },
            sizes: vec![
                Resolution::new(1920, 1080),
                Resolution::new(1280, 720),
                Resolution::new(640, 480),
                Resolution::new(320, 240),
            ],
            high_speed_sizes: Vec::new(),
            max_fps: 30,
            behavior: Behavior::default(),
        }
    }

    pub fn layouts(mut self, layouts: &[PixelLayout]) -> Self {
        self.descriptor.layouts = layouts.iter().copied().collect();
        self
    }

    pub fn high_speed(mut self, ranges: Vec<FpsRange>, sizes: Vec<Resolution>) -> Self {
        self.descriptor.supports_high_frame_rate = !ranges.is_empty();
        self.descriptor.high_speed_fps = ranges;
        self.high_speed_sizes = sizes;
        self
    }

    pub fn max_fps(mut self, fps: u32) -> Self {
        self.max_fps = fps.max(1);
        self
    }

    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }
}

struct Entry {
    camera: SyntheticCamera,
    stats: Arc<SyntheticStats>,
}

/// [`CameraPlatform`] over a fixed set of virtual cameras
#[derive(Default)]
pub struct SyntheticPlatform {
    order: Vec<String>,
    cameras: HashMap<String, Entry>,
}

impl SyntheticPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(mut self, camera: SyntheticCamera) -> Self {
        let id = camera.descriptor.id.clone();
        if !self.cameras.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.cameras.insert(
            id,
            Entry {
                camera,
                stats: Arc::new(SyntheticStats::default()),
            },
        );
        self
    }

    /// Default rig: one rear and one front camera
    pub fn rear_and_front() -> Self {
        Self::new()
            .with_camera(SyntheticCamera::new("0", Facing::Rear))
            .with_camera(SyntheticCamera::new("1", Facing::Front).layouts(&[PixelLayout::SemiPlanar420]))
    }

    pub fn stats(&self, id: &str) -> Option<Arc<SyntheticStats>> {
        self.cameras.get(id).map(|entry| entry.stats.clone())
    }

    fn entry(&self, id: &str) -> Result<&Entry, PlatformError> {
        self.cameras
            .get(id)
            .ok_or_else(|| PlatformError::NotFound(id.to_owned()))
    }
}

impl CameraPlatform for SyntheticPlatform {
    fn camera_ids(&self) -> Result<Vec<String>, PlatformError> {
        Ok(self.order.clone())
    }

    fn describe(&self, id: &str) -> Result<CameraDescriptor, PlatformError> {
        Ok(self.entry(id)?.camera.descriptor.clone())
    }

    fn output_sizes(
        &self,
        id: &str,
        layout: PixelLayout,
        high_frame_rate: bool,
    ) -> Result<Vec<Resolution>, PlatformError> {
        let camera = &self.entry(id)?.camera;
        if !camera.descriptor.supports(layout) {
            return Err(PlatformError::Capability {
                id: id.to_owned(),
                reason: format!("{layout:?} not supported"),
            });
        }
        Ok(if high_frame_rate {
            camera.high_speed_sizes.clone()
        } else {
            camera.sizes.clone()
        })
    }

    fn open_camera(&self, id: &str, events: EventSink) -> Result<(), PlatformError> {
        let entry = self.entry(id)?;
        let camera = entry.camera.clone();
        let stats = entry.stats.clone();
        if camera.behavior.reject_open {
            return Err(PlatformError::Device {
                id: id.to_owned(),
                code: PlatformErrorCode::CameraDisabled,
            });
        }
        stats.opens.fetch_add(1, Ordering::Relaxed);

        thread::Builder::new()
            .name(format!("synthetic-open-{id}"))
            .spawn(move || {
                thread::sleep(camera.behavior.open_delay);
                if camera.behavior.stall {
                    debug!(camera = %camera.descriptor.id, "Synthetic open stalled");
                    return;
                }
                let event = match camera.behavior.open_error {
                    Some(code) => PlatformEvent::Error(code),
                    None => PlatformEvent::Opened(Box::new(SyntheticDevice {
                        camera,
                        stats,
                        closed: false,
                    })),
                };
                // a closed queue drops the device, which counts as closing it
                events.post(event);
            })?;
        Ok(())
    }
}

struct SyntheticDevice {
    camera: SyntheticCamera,
    stats: Arc<SyntheticStats>,
    closed: bool,
}

impl PlatformDevice for SyntheticDevice {
    fn create_session(&mut self, config: &SessionConfig, events: EventSink) -> Result<(), PlatformError> {
        let id = &self.camera.descriptor.id;
        if self.closed {
            return Err(PlatformError::Session {
                id: id.clone(),
                reason: "device closed".into(),
            });
        }
        if !self.camera.descriptor.supports(config.layout) {
            return Err(PlatformError::Session {
                id: id.clone(),
                reason: format!("{:?} not supported", config.layout),
            });
        }
        let event = match &self.camera.behavior.session_failure {
            Some(reason) => PlatformEvent::ConfigureFailed(reason.clone()),
            None => PlatformEvent::Configured(Box::new(SyntheticSession {
                config: *config,
                max_fps: self.camera.max_fps,
                stats: self.stats.clone(),
                events: events.clone(),
                running: Arc::new(AtomicBool::new(false)),
                pump: None,
                closed: false,
            })),
        };
        events.post(event);
        Ok(())
    }

    fn close(&mut self) {
        if !std::mem::replace(&mut self.closed, true) {
            self.stats.device_closes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.close();
    }
}

struct SyntheticSession {
    config: SessionConfig,
    max_fps: u32,
    stats: Arc<SyntheticStats>,
    events: EventSink,
    running: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    closed: bool,
}

impl SyntheticSession {
    fn stop_pump(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

impl CaptureSession for SyntheticSession {
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<(), PlatformError> {
        if self.closed {
            return Err(PlatformError::Request {
                id: self.events.camera_id().to_owned(),
                reason: "session closed".into(),
            });
        }
        self.stop_pump();

        let fps = request.fps_range.max.clamp(1, self.max_fps);
        let interval = Duration::from_secs(1) / fps;
        let config = self.config;
        let events = self.events.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        running.store(true, Ordering::Release);

        let pump = thread::Builder::new()
            .name(format!("synthetic-frames-{}", events.camera_id()))
            .spawn(move || {
                let mut sequence = 0u64;
                while running.load(Ordering::Acquire) {
                    let frame = test_pattern(config.layout, config.resolution, sequence);
                    if !events.post(PlatformEvent::FrameAvailable(frame)) {
                        break;
                    }
                    stats.frames.fetch_add(1, Ordering::Relaxed);
                    sequence += 1;
                    thread::sleep(interval);
                }
                trace!(camera = events.camera_id(), sequence, "Frame pump stopped");
            })?;
        self.pump = Some(pump);
        Ok(())
    }

    fn abort_captures(&mut self) -> Result<(), PlatformError> {
        self.stats.aborts.fetch_add(1, Ordering::Relaxed);
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) {
        self.stop_pump();
        if !std::mem::replace(&mut self.closed, true) {
            self.stats.session_closes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for SyntheticSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Diagonal luma ramp scrolling with `sequence`, chroma slowly cycling
pub fn test_pattern(layout: PixelLayout, resolution: Resolution, sequence: u64) -> RawFrame {
    let (w, h) = (resolution.width as usize, resolution.height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let shift = (sequence * 4) as usize;

    let mut luma = Vec::with_capacity(w * h);
    for y in 0..h {
        luma.extend((0..w).map(|x| 16 + ((x + y + shift) % 220) as u8));
    }
    let u = 128u8.wrapping_add((sequence % 64) as u8);
    let v = 128u8.wrapping_sub((sequence % 64) as u8);

    let planes = match layout {
        PixelLayout::SemiPlanar420 => {
            let stride = cw * 2;
            let mut uv = Vec::with_capacity(stride * ch);
            for _ in 0..cw * ch {
                uv.extend_from_slice(&[u, v]);
            }
            let uv = Bytes::from(uv);
            [
                Plane::new(Bytes::from(luma), w, 1),
                Plane::new(uv.clone(), stride, 2),
                Plane::new(uv.slice(1..), stride, 2),
            ]
        }
        _ => {
            let stride = cw + CHROMA_PADDING;
            [
                Plane::new(Bytes::from(luma), w, 1),
                Plane::new(Bytes::from(vec![u; stride * ch]), stride, 1),
                Plane::new(Bytes::from(vec![v; stride * ch]), stride, 1),
            ]
        }
    };

    RawFrame {
        layout,
        width: resolution.width,
        height: resolution.height,
        planes,
        sequence,
        device_timestamp: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::yuv;

    #[test]
    fn planar_pattern_has_padded_chroma() {
        let res = Resolution::new(8, 4);
        let frame = test_pattern(PixelLayout::Planar420, res, 3);
        assert_eq!(frame.planes[1].row_stride, 4 + CHROMA_PADDING);
        let mut packed = Vec::new();
        yuv::repack_planar(&frame.planes, res, &mut packed).unwrap();
        assert_eq!(packed.len(), yuv::i420_len(res));
    }

    #[test]
    fn semi_planar_pattern_interleaves() {
        let frame = test_pattern(PixelLayout::SemiPlanar420, Resolution::new(4, 2), 1);
        assert_eq!(frame.planes[1].pixel_stride, 2);
        assert_eq!(frame.planes[1].data[0], 129);
        assert_eq!(frame.planes[2].data[0], 127);
    }

    #[test]
    fn unknown_camera_is_not_found() {
        let platform = SyntheticPlatform::rear_and_front();
        assert!(matches!(platform.describe("9"), Err(PlatformError::NotFound(_))));
        assert_eq!(platform.camera_ids().unwrap(), vec!["0", "1"]);
    }

    #[test]
    fn high_speed_sizes_reported_separately() {
        let platform = SyntheticPlatform::new().with_camera(
            SyntheticCamera::new("0", Facing::Rear)
                .high_speed(vec![FpsRange::fixed(120)], vec![Resolution::new(1280, 720)]),
        );
        let sizes = platform.output_sizes("0", PixelLayout::Planar420, true).unwrap();
        assert_eq!(sizes, vec![Resolution::new(1280, 720)]);
        assert!(platform.output_sizes("0", PixelLayout::Jpeg, false).is_err());
    }
}
