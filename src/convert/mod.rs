//! Raw frame → RGBA conversion
//!
//! A converter lives on its camera's worker thread and sees every raw frame
//! notification for that camera. The shared protocol in
//! [`FrameConverter::on_frame_available`] handles the stop latch, backpressure
//! and out-of-memory recovery; implementations only produce output.

pub mod accel;
pub mod context;
pub mod cpu;
pub mod yuv;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::capture::frame::{monotonic_nanos, ColorOrder, Frame, PixelLayout, RawFrame, Resolution};
use crate::error::ConvertError;
use crate::pipeline::sink::{FrameSink, YuvFrame};

pub use accel::AcceleratedConverter;
pub use context::{AccelerationContext, AccelerationPool};
pub use cpu::CpuConverter;

/// Which conversion path a session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterKind {
    Cpu,
    Accelerated,
}

impl ConverterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Accelerated => "accelerated",
        }
    }
}

impl std::fmt::Display for ConverterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The device a converter reports back to
pub trait ConverterHost {
    fn is_stopping(&self) -> bool;

    /// Tear the camera down; called from the worker thread
    fn stop_camera(&self);
}

/// Construction parameters shared by both converters
#[derive(Clone)]
pub struct ConverterParams {
    pub camera_id: Arc<str>,
    pub layout: PixelLayout,
    pub resolution: Resolution,
    pub color_order: ColorOrder,
    pub grey: bool,
    /// Produce grey in its own kernel pass instead of fused with RGBA
    pub grey_separate: bool,
    pub queue_capacity: usize,
    pub sink: Arc<dyn FrameSink>,
}

/// Output of one conversion, ready for hand-off
pub enum Produced {
    Frame(Frame),
    /// Repacked I420 for the sink to convert itself
    Yuv(YuvFrame),
}

/// What happened to one raw frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Delivered,
    /// The sink refused the frame
    Rejected,
    Backpressure,
    Stopped,
    OutOfMemory,
    Failed,
}

/// Stop latch plus backpressure check in front of every conversion
pub struct FrameGate {
    camera_id: Arc<str>,
    sink: Arc<dyn FrameSink>,
    capacity: usize,
    stopped: bool,
}

enum Admit {
    Convert,
    Stopped,
    Backpressure,
}

impl FrameGate {
    pub fn new(params: &ConverterParams) -> Self {
        Self {
            camera_id: params.camera_id.clone(),
            sink: params.sink.clone(),
            capacity: params.queue_capacity,
            stopped: false,
        }
    }

    pub fn camera_id(&self) -> &Arc<str> {
        &self.camera_id
    }

    pub fn sink(&self) -> &dyn FrameSink {
        self.sink.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn admit(&mut self, host: &dyn ConverterHost) -> Admit {
        if self.stopped {
            return Admit::Stopped;
        }
        if host.is_stopping() {
            self.stopped = true;
            debug!(camera = %self.camera_id, "Stop observed on frame, tearing down");
            host.stop_camera();
            return Admit::Stopped;
        }
        if self.sink.in_flight() >= self.capacity {
            return Admit::Backpressure;
        }
        Admit::Convert
    }
}

/// Allocate a zeroed output buffer, reporting failure instead of aborting
pub fn try_alloc(len: usize) -> Result<Vec<u8>, ConvertError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| ConvertError::OutOfMemory { bytes: len })?;
    buf.resize(len, 0);
    Ok(buf)
}

/// RGBA plus optional grey output for one frame
pub fn alloc_outputs(resolution: Resolution, grey: bool) -> Result<(Vec<u8>, Option<Vec<u8>>), ConvertError> {
    let rgba = try_alloc(resolution.rgba_len())?;
    let grey = if grey {
        Some(try_alloc(resolution.pixel_count())?)
    } else {
        None
    };
    Ok((rgba, grey))
}

pub trait FrameConverter: Send {
    fn kind(&self) -> ConverterKind;

    fn gate(&mut self) -> &mut FrameGate;

    /// Convert one raw frame stamped with `timestamp`
    fn produce_frame(&mut self, raw: &RawFrame, timestamp: u64) -> Result<Produced, ConvertError>;

    /// Handle a frame notification from the platform
    fn on_frame_available(&mut self, raw: &RawFrame, host: &dyn ConverterHost) -> FrameOutcome {
        let timestamp = monotonic_nanos();
        let kind = self.kind();

        match self.gate().admit(host) {
            Admit::Stopped => return FrameOutcome::Stopped,
            Admit::Backpressure => {
                metrics::counter!("frames_dropped", "reason" => "backpressure").increment(1);
                return FrameOutcome::Backpressure;
            }
            Admit::Convert => {}
        }

        let started = Instant::now();
        let produced = self.produce_frame(raw, timestamp);
        let gate = self.gate();
        let accepted = match produced {
            Ok(Produced::Frame(frame)) => gate.sink.enqueue(frame),
            Ok(Produced::Yuv(frame)) => gate.sink.enqueue_yuv(frame),
            Err(ConvertError::OutOfMemory { bytes }) => {
                error!(camera = %gate.camera_id, bytes, "Out of memory converting frame, clearing queue");
                gate.sink.clear_queue(&gate.camera_id);
                metrics::counter!("frames_dropped", "reason" => "oom").increment(1);
                return FrameOutcome::OutOfMemory;
            }
            Err(err) => {
                warn!(camera = %gate.camera_id, converter = %kind, %err, "Frame conversion failed");
                metrics::counter!("frames_dropped", "reason" => "error").increment(1);
                return FrameOutcome::Failed;
            }
        };

        if !accepted {
            return FrameOutcome::Rejected;
        }
        metrics::counter!("frames_converted", "converter" => kind.as_str()).increment(1);
        metrics::histogram!("conversion_time_us").record(started.elapsed().as_micros() as f64);
        FrameOutcome::Delivered
    }
}

/// Pick a converter for a new session: accelerated first when a context is
/// available, CPU otherwise or when the accelerated path fails to initialise.
pub fn select_converter(
    params: ConverterParams,
    acceleration: Option<Arc<AccelerationContext>>,
) -> Result<Box<dyn FrameConverter>, ConvertError> {
    select_converter_with(params, acceleration, |params, ctx| {
        AcceleratedConverter::new(params, ctx).map(|c| Box::new(c) as Box<dyn FrameConverter>)
    })
}

/// [`select_converter`] with the accelerated constructor supplied by the caller
pub fn select_converter_with<C, F>(
    params: ConverterParams,
    acceleration: Option<Arc<C>>,
    accelerated: F,
) -> Result<Box<dyn FrameConverter>, ConvertError>
where
    F: FnOnce(ConverterParams, Arc<C>) -> Result<Box<dyn FrameConverter>, ConvertError>,
{
    if let Some(ctx) = acceleration {
        match accelerated(params.clone(), ctx) {
            Ok(converter) => return Ok(converter),
            Err(err) => {
                warn!(camera = %params.camera_id, %err, "Accelerated converter unavailable, using CPU");
            }
        }
    }
    Ok(Box::new(CpuConverter::new(params)?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::frame::Plane;
    use bytes::Bytes;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Sink that records frames and reports a configurable backlog
    #[derive(Default)]
    pub(crate) struct TestSink {
        pub frames: Mutex<Vec<Frame>>,
        pub backlog: AtomicUsize,
        pub cleared: AtomicUsize,
    }

    impl FrameSink for TestSink {
        fn register_camera(&self, _: &str, _: usize, _: bool) -> bool {
            true
        }
        fn enqueue(&self, frame: Frame) -> bool {
            self.frames.lock().unwrap().push(frame);
            true
        }
        fn in_flight(&self) -> usize {
            self.backlog.load(Ordering::SeqCst)
        }
        fn clear_queue(&self, _: &str) -> bool {
            self.cleared.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[derive(Default)]
    pub(crate) struct TestHost {
        pub stopping: Cell<bool>,
        pub stops: Cell<usize>,
    }

    impl ConverterHost for TestHost {
        fn is_stopping(&self) -> bool {
            self.stopping.get()
        }
        fn stop_camera(&self) {
            self.stops.set(self.stops.get() + 1);
        }
    }

    pub(crate) fn params(layout: PixelLayout, resolution: Resolution, grey: bool, sink: Arc<TestSink>) -> ConverterParams {
        ConverterParams {
            camera_id: "0".into(),
            layout,
            resolution,
            color_order: ColorOrder::Rgba,
            grey,
            grey_separate: false,
            queue_capacity: 2,
            sink,
        }
    }

    /// Mid-grey planar frame with padded chroma rows
    pub(crate) fn planar_frame(resolution: Resolution) -> RawFrame {
        let (w, h) = (resolution.width as usize, resolution.height as usize);
        let (cw, ch) = yuv::chroma_dims(resolution);
        let stride = cw + 8;
        RawFrame {
            layout: PixelLayout::Planar420,
            width: resolution.width,
            height: resolution.height,
            planes: [
                Plane::new(Bytes::from(vec![128u8; w * h]), w, 1),
                Plane::new(Bytes::from(vec![128u8; stride * ch]), stride, 1),
                Plane::new(Bytes::from(vec![128u8; stride * ch]), stride, 1),
            ],
            sequence: 0,
            device_timestamp: None,
        }
    }

    pub(crate) fn semi_planar_frame(resolution: Resolution) -> RawFrame {
        let (w, h) = (resolution.width as usize, resolution.height as usize);
        let (cw, ch) = yuv::chroma_dims(resolution);
        let uv = Bytes::from(vec![128u8; cw * 2 * ch]);
        RawFrame {
            layout: PixelLayout::SemiPlanar420,
            width: resolution.width,
            height: resolution.height,
            planes: [
                Plane::new(Bytes::from(vec![128u8; w * h]), w, 1),
                Plane::new(uv.clone(), cw * 2, 2),
                Plane::new(uv.slice(1..), cw * 2, 2),
            ],
            sequence: 0,
            device_timestamp: None,
        }
    }

    #[test]
    fn stop_latch_fires_once() {
        let sink = Arc::new(TestSink::default());
        let res = Resolution::new(4, 4);
        let mut conv = CpuConverter::new(params(PixelLayout::Planar420, res, false, sink.clone())).unwrap();
        let host = TestHost::default();
        host.stopping.set(true);

        let raw = planar_frame(res);
        assert_eq!(conv.on_frame_available(&raw, &host), FrameOutcome::Stopped);
        assert_eq!(conv.on_frame_available(&raw, &host), FrameOutcome::Stopped);
        assert_eq!(host.stops.get(), 1);
        assert!(sink.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn backpressure_drops_without_enqueue() {
        let sink = Arc::new(TestSink::default());
        sink.backlog.store(2, Ordering::SeqCst);
        let res = Resolution::new(4, 4);
        let mut conv = CpuConverter::new(params(PixelLayout::SemiPlanar420, res, true, sink.clone())).unwrap();
        let host = TestHost::default();

        assert_eq!(
            conv.on_frame_available(&semi_planar_frame(res), &host),
            FrameOutcome::Backpressure
        );
        assert!(sink.frames.lock().unwrap().is_empty());

        sink.backlog.store(1, Ordering::SeqCst);
        assert_eq!(
            conv.on_frame_available(&semi_planar_frame(res), &host),
            FrameOutcome::Delivered
        );
    }

    #[test]
    fn timestamp_taken_before_conversion() {
        let sink = Arc::new(TestSink::default());
        let res = Resolution::new(8, 8);
        let mut conv = CpuConverter::new(params(PixelLayout::Planar420, res, false, sink.clone())).unwrap();
        let before = monotonic_nanos();
        conv.on_frame_available(&planar_frame(res), &TestHost::default());
        let after = monotonic_nanos();
        let ts = sink.frames.lock().unwrap()[0].timestamp;
        assert!(before <= ts && ts <= after);
    }

    #[test]
    fn alloc_outputs_sizes() {
        let (rgba, grey) = alloc_outputs(Resolution::new(6, 4), true).unwrap();
        assert_eq!(rgba.len(), 96);
        assert_eq!(grey.map(|g| g.len()), Some(24));
        assert!(matches!(
            try_alloc(usize::MAX),
            Err(ConvertError::OutOfMemory { bytes: usize::MAX })
        ));
    }

    /// Converter whose every allocation fails
    struct Exhausted(FrameGate);

    impl FrameConverter for Exhausted {
        fn kind(&self) -> ConverterKind {
            ConverterKind::Cpu
        }
        fn gate(&mut self) -> &mut FrameGate {
            &mut self.0
        }
        fn produce_frame(&mut self, raw: &RawFrame, _: u64) -> Result<Produced, ConvertError> {
            Err(ConvertError::OutOfMemory {
                bytes: raw.resolution().rgba_len(),
            })
        }
    }

    #[test]
    fn out_of_memory_clears_queue_and_drops() {
        let sink = Arc::new(TestSink::default());
        let res = Resolution::new(4, 4);
        let mut conv = Exhausted(FrameGate::new(&params(PixelLayout::Planar420, res, false, sink.clone())));
        let host = TestHost::default();

        assert_eq!(conv.on_frame_available(&planar_frame(res), &host), FrameOutcome::OutOfMemory);
        assert_eq!(sink.cleared.load(Ordering::SeqCst), 1);
        assert!(sink.frames.lock().unwrap().is_empty());
        // not fatal: the next frame is attempted again
        assert_eq!(conv.on_frame_available(&planar_frame(res), &host), FrameOutcome::OutOfMemory);
        assert_eq!(host.stops.get(), 0);
    }

    #[test]
    fn failed_context_falls_back_to_cpu() {
        let sink = Arc::new(TestSink::default());
        let mut pool: AccelerationPool<()> =
            AccelerationPool::with_factory(2, |_| Err(ConvertError::Acceleration("no adapter".into())));

        let ctx = pool.acquire(2);
        assert!(ctx.is_none());
        assert!(!pool.is_available());

        let conv = select_converter_with(
            params(PixelLayout::Planar420, Resolution::new(8, 8), false, sink),
            ctx,
            |_, _| panic!("accelerated path taken without a context"),
        )
        .unwrap();
        assert_eq!(conv.kind(), ConverterKind::Cpu);
    }

    #[test]
    fn rejected_accelerated_build_falls_back_to_cpu() {
        let sink = Arc::new(TestSink::default());
        let mut pool: AccelerationPool<()> = AccelerationPool::with_factory(1, |_| Ok(()));
        let res = Resolution::new(6, 4);

        let conv = select_converter_with(
            params(PixelLayout::Planar420, res, false, sink.clone()),
            pool.acquire(1),
            |params, _| {
                accel::check_kernel_size(params.layout, params.resolution)?;
                unreachable!("6 wide frames are rejected")
            },
        )
        .unwrap();
        assert_eq!(conv.kind(), ConverterKind::Cpu);
        assert!(pool.is_available());

        let mut conv = conv;
        assert_eq!(
            conv.on_frame_available(&planar_frame(res), &TestHost::default()),
            FrameOutcome::Delivered
        );
    }

    #[test]
    fn selection_without_context_is_cpu() {
        let sink = Arc::new(TestSink::default());
        let conv = select_converter(
            params(PixelLayout::Planar420, Resolution::new(4, 4), false, sink),
            None,
        )
        .unwrap();
        assert_eq!(conv.kind(), ConverterKind::Cpu);
    }
}
