//! Linux cameras through V4L2
//!
//! Camera ids are the `N` of `/dev/videoN`. Every device reports as an
//! external camera; V4L2 does not say which way a sensor faces.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC, Fraction};

use crate::capture::frame::{PixelLayout, Plane, RawFrame, Resolution};
use crate::capture::platform::{
    CameraDescriptor, CameraPlatform, CaptureRequest, CaptureSession, EventSink, Facing, FpsRange,
    PlatformDevice, PlatformEvent, SessionConfig,
};
use crate::error::{PlatformError, PlatformErrorCode};

const V4L2_CID_BASE: u32 = 0x0098_0900;
const V4L2_CID_AUTO_WHITE_BALANCE: u32 = V4L2_CID_BASE + 12;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = 0x009a_0900;
const V4L2_CID_FOCUS_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 10;
const V4L2_CID_FOCUS_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 12;

const EBUSY: i32 = 16;
const ENODEV: i32 = 19;

/// Highest `/dev/videoN` probed
const MAX_DEVICES: usize = 64;
const BUFFER_COUNT: u32 = 4;

/// Raw layout of a V4L2 pixel format
pub fn layout_for(fourcc: FourCC) -> Option<PixelLayout> {
    match &fourcc.repr {
        b"YU12" => Some(PixelLayout::Planar420),
        b"NV12" | b"NV21" => Some(PixelLayout::SemiPlanar420),
        b"RGBP" => Some(PixelLayout::Rgb565),
        b"AB24" | b"RGB4" => Some(PixelLayout::Rgba8888),
        b"MJPG" | b"JPEG" => Some(PixelLayout::Jpeg),
        _ => None,
    }
}

/// Pixel format requested for a convertible layout
pub fn fourcc_for(layout: PixelLayout) -> Option<FourCC> {
    match layout {
        PixelLayout::Planar420 => Some(FourCC::new(b"YU12")),
        PixelLayout::SemiPlanar420 => Some(FourCC::new(b"NV12")),
        _ => None,
    }
}

fn fps_of(interval: Fraction) -> u32 {
    if interval.numerator == 0 {
        0
    } else {
        interval.denominator / interval.numerator
    }
}

/// Map an open/stream failure onto a platform error code
pub fn error_code(err: &io::Error) -> PlatformErrorCode {
    match err.raw_os_error() {
        Some(EBUSY) => PlatformErrorCode::CameraInUse,
        Some(ENODEV) => PlatformErrorCode::DeviceFatal,
        _ if err.kind() == io::ErrorKind::PermissionDenied => PlatformErrorCode::CameraDisabled,
        _ => PlatformErrorCode::Unknown,
    }
}

fn device_index(id: &str) -> Result<usize, PlatformError> {
    id.parse()
        .map_err(|_| PlatformError::NotFound(id.to_owned()))
}

fn capability_error(id: &str, err: impl std::fmt::Display) -> PlatformError {
    PlatformError::Capability {
        id: id.to_owned(),
        reason: err.to_string(),
    }
}

/// Video capture devices under /dev
#[derive(Debug, Default)]
pub struct V4l2Platform;

impl V4l2Platform {
    pub fn new() -> Self {
        Self
    }

    fn open(&self, id: &str) -> Result<Device, PlatformError> {
        Device::new(device_index(id)?).map_err(|err| PlatformError::Device {
            id: id.to_owned(),
            code: error_code(&err),
        })
    }

    fn sizes_for(&self, dev: &Device, fourcc: FourCC) -> Vec<Resolution> {
        let mut sizes = Vec::new();
        for size in dev.enum_framesizes(fourcc).unwrap_or_default() {
            match size.size {
                FrameSizeEnum::Discrete(d) => sizes.push(Resolution::new(d.width, d.height)),
                FrameSizeEnum::Stepwise(step) => {
                    // stepwise ranges: offer the common sizes inside the range
                    for (w, h) in [(1920, 1080), (1280, 720), (640, 480), (320, 240)] {
                        if (step.min_width..=step.max_width).contains(&w)
                            && (step.min_height..=step.max_height).contains(&h)
                        {
                            sizes.push(Resolution::new(w, h));
                        }
                    }
                }
            }
        }
        sizes.sort_by_key(|s| std::cmp::Reverse(s.pixel_count()));
        sizes.dedup();
        sizes
    }

    fn fps_ranges(&self, dev: &Device, fourcc: FourCC, size: Resolution) -> Vec<FpsRange> {
        let mut ranges: Vec<FpsRange> = dev
            .enum_frameintervals(fourcc, size.width, size.height)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|interval| match interval.interval {
                FrameIntervalEnum::Discrete(frac) => {
                    Some(FpsRange::fixed(fps_of(frac))).filter(|r| r.max > 0)
                }
                FrameIntervalEnum::Stepwise(step) => {
                    // the longest interval is the lowest rate
                    let range = FpsRange::new(fps_of(step.max), fps_of(step.min));
                    (range.max > 0).then_some(range)
                }
            })
            .collect();
        ranges.sort_by_key(|r| (r.min, r.max));
        ranges.dedup();
        ranges
    }
}

impl CameraPlatform for V4l2Platform {
    /// Scan /dev/video* for capture devices
    fn camera_ids(&self) -> Result<Vec<String>, PlatformError> {
        let mut ids = Vec::new();
        for index in 0..MAX_DEVICES {
            let path = format!("/dev/video{index}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::new(index) else {
                continue;
            };
            if let Ok(caps) = dev.query_caps() {
                if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                    debug!("Found capture device: {} - {}", path, caps.card);
                    ids.push(index.to_string());
                }
            }
        }
        Ok(ids)
    }

    #[instrument(skip(self))]
    fn describe(&self, id: &str) -> Result<CameraDescriptor, PlatformError> {
        let dev = self.open(id)?;
        let caps = dev.query_caps().map_err(|err| capability_error(id, err))?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(capability_error(id, "device doesn't support video capture"));
        }

        let formats = dev.enum_formats().map_err(|err| capability_error(id, err))?;
        let layouts: HashSet<PixelLayout> = formats
            .iter()
            .filter_map(|desc| layout_for(desc.fourcc))
            .collect();

        // fps ranges of the largest size of the preferred layout
        let standard_fps = PixelLayout::CONVERTIBLE
            .into_iter()
            .find(|layout| layouts.contains(layout))
            .and_then(fourcc_for)
            .and_then(|fourcc| {
                let largest = self.sizes_for(&dev, fourcc).into_iter().next()?;
                Some(self.fps_ranges(&dev, fourcc, largest))
            })
            .unwrap_or_default();

        info!("Device: {} ({})", caps.card, caps.driver);
        Ok(CameraDescriptor {
            id: id.to_owned(),
            name: caps.card,
            facing: Facing::External,
            layouts,
            supports_high_frame_rate: false,
            standard_fps,
            high_speed_fps: Vec::new(),
        })
    }

    fn output_sizes(
        &self,
        id: &str,
        layout: PixelLayout,
        high_frame_rate: bool,
    ) -> Result<Vec<Resolution>, PlatformError> {
        if high_frame_rate {
            return Ok(Vec::new());
        }
        let fourcc = fourcc_for(layout)
            .ok_or_else(|| capability_error(id, format!("{layout:?} is not a capture layout")))?;
        let dev = self.open(id)?;
        Ok(self.sizes_for(&dev, fourcc))
    }

    fn open_camera(&self, id: &str, events: EventSink) -> Result<(), PlatformError> {
        let index = device_index(id)?;
        let id = id.to_owned();
        thread::Builder::new()
            .name(format!("v4l2-open-{id}"))
            .spawn(move || {
                let event = match Device::new(index) {
                    Ok(dev) => PlatformEvent::Opened(Box::new(V4l2Device {
                        id,
                        dev: Some(Arc::new(dev)),
                    })),
                    Err(err) => {
                        warn!(camera = %id, %err, "V4L2 open failed");
                        PlatformEvent::Error(error_code(&err))
                    }
                };
                events.post(event);
            })?;
        Ok(())
    }
}

struct V4l2Device {
    id: String,
    dev: Option<Arc<Device>>,
}

impl PlatformDevice for V4l2Device {
    fn create_session(&mut self, config: &SessionConfig, events: EventSink) -> Result<(), PlatformError> {
        let session_error = |reason: String| PlatformError::Session {
            id: self.id.clone(),
            reason,
        };
        let dev = self.dev.clone().ok_or_else(|| session_error("device closed".into()))?;
        let fourcc = fourcc_for(config.layout)
            .ok_or_else(|| session_error(format!("{:?} is not a capture layout", config.layout)))?;

        let mut fmt = dev.format().map_err(|err| session_error(err.to_string()))?;
        fmt.width = config.resolution.width;
        fmt.height = config.resolution.height;
        fmt.fourcc = fourcc;

        // negotiation outcome is reported asynchronously like any platform
        let event = match dev.set_format(&fmt) {
            Ok(actual)
                if actual.width == fmt.width
                    && actual.height == fmt.height
                    && layout_for(actual.fourcc) == Some(config.layout) =>
            {
                info!(
                    camera = %self.id,
                    "Format: {}x{} {} stride {}",
                    actual.width, actual.height, actual.fourcc, actual.stride
                );
                PlatformEvent::Configured(Box::new(V4l2Session {
                    id: self.id.clone(),
                    dev,
                    format: actual,
                    layout: config.layout,
                    events: events.clone(),
                    running: Arc::new(AtomicBool::new(false)),
                }))
            }
            Ok(actual) => PlatformEvent::ConfigureFailed(format!(
                "driver chose {}x{} {}",
                actual.width, actual.height, actual.fourcc
            )),
            Err(err) => PlatformEvent::ConfigureFailed(err.to_string()),
        };
        events.post(event);
        Ok(())
    }

    fn close(&mut self) {
        if self.dev.take().is_some() {
            debug!(camera = %self.id, "V4L2 device closed");
        }
    }
}

struct V4l2Session {
    id: String,
    dev: Arc<Device>,
    format: Format,
    layout: PixelLayout,
    events: EventSink,
    running: Arc<AtomicBool>,
}

impl V4l2Session {
    fn apply_controls(&self, request: &CaptureRequest) {
        let controls = [
            (V4L2_CID_FOCUS_AUTO, Value::Boolean(request.autofocus)),
            (V4L2_CID_AUTO_WHITE_BALANCE, Value::Boolean(request.auto_white_balance)),
            (V4L2_CID_FOCUS_ABSOLUTE, Value::Integer(request.focus_distance as i64)),
        ];
        for (id, value) in controls {
            if let Err(err) = self.dev.set_control(Control { id, value }) {
                // many UVC cameras lack focus or white balance controls
                debug!(camera = %self.id, control = id, %err, "Control not applied");
            }
        }
    }
}

/// Split one mapped buffer into Y, U and V views
fn planes_of(format: &Format, layout: PixelLayout, data: Bytes) -> Option<[Plane; 3]> {
    let stride = format.stride as usize;
    let luma_len = stride * format.height as usize;
    let chroma_rows = format.height.div_ceil(2) as usize;
    if data.len() < luma_len {
        return None;
    }
    let luma = Plane::new(data.slice(..luma_len), stride, 1);

    match layout {
        PixelLayout::Planar420 => {
            let chroma_stride = stride / 2;
            let chroma_len = chroma_stride * chroma_rows;
            if data.len() < luma_len + 2 * chroma_len {
                return None;
            }
            let u = data.slice(luma_len..luma_len + chroma_len);
            let v = data.slice(luma_len + chroma_len..luma_len + 2 * chroma_len);
            Some([luma, Plane::new(u, chroma_stride, 1), Plane::new(v, chroma_stride, 1)])
        }
        PixelLayout::SemiPlanar420 => {
            let uv_len = stride * chroma_rows;
            if data.len() < luma_len + uv_len {
                return None;
            }
            let uv = data.slice(luma_len..luma_len + uv_len);
            let (u, v) = if &format.fourcc.repr == b"NV21" {
                (uv.slice(1..), uv)
            } else {
                (uv.clone(), uv.slice(1..))
            };
            Some([luma, Plane::new(u, stride, 2), Plane::new(v, stride, 2)])
        }
        _ => None,
    }
}

impl CaptureSession for V4l2Session {
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<(), PlatformError> {
        let request_error = |reason: String| PlatformError::Request {
            id: self.id.clone(),
            reason,
        };
        self.apply_controls(request);
        if request.fps_range.max > 0 {
            if let Err(err) = self.dev.set_params(&Parameters::with_fps(request.fps_range.max)) {
                debug!(camera = %self.id, %err, "Frame rate not applied");
            }
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut stream = MmapStream::with_buffers(&self.dev, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|err| request_error(err.to_string()))?;
        info!(camera = %self.id, "Capture stream started with {} buffers", BUFFER_COUNT);

        let format = self.format.clone();
        let layout = self.layout;
        let events = self.events.clone();
        let running = self.running.clone();
        thread::Builder::new()
            .name(format!("v4l2-capture-{}", self.id))
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    let (buf, meta) = match stream.next() {
                        Ok(next) => next,
                        Err(err) => {
                            if running.load(Ordering::Acquire) {
                                warn!(camera = events.camera_id(), %err, "Capture stream failed");
                                events.post(PlatformEvent::Disconnected);
                            }
                            break;
                        }
                    };
                    let used = (meta.bytesused as usize).min(buf.len());
                    let data = Bytes::copy_from_slice(&buf[..used]);
                    let Some(planes) = planes_of(&format, layout, data) else {
                        debug!(camera = events.camera_id(), used, "Short capture buffer");
                        continue;
                    };
                    let frame = RawFrame {
                        layout,
                        width: format.width,
                        height: format.height,
                        planes,
                        sequence: u64::from(meta.sequence),
                        device_timestamp: Some(
                            Duration::from_secs(meta.timestamp.sec as u64)
                                + Duration::from_micros(meta.timestamp.usec as u64),
                        ),
                    };
                    if !events.post(PlatformEvent::FrameAvailable(frame)) {
                        break;
                    }
                }
            })?;
        Ok(())
    }

    fn abort_captures(&mut self) -> Result<(), PlatformError> {
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    /// The capture thread exits after its pending dequeue returns
    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
