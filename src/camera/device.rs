//! One physical camera: open, negotiate, stream, stop
//!
//! Lifecycle decisions come from [`transition`]; this module only carries out
//! the resulting commands. Platform callbacks and frames are handled on the
//! device's worker thread, which also owns the session's converter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::camera::permit::Permit;
use crate::camera::state::{transition, Command, Event, LifecycleState};
use crate::camera::strategy::CaptureStrategy;
use crate::camera::worker::Worker;
use crate::capture::frame::{ColorOrder, RawFrame, Resolution};
use crate::capture::platform::{
    CameraDescriptor, CameraPlatform, CaptureRequest, CaptureSession, EventSink, PlatformDevice,
    PlatformEvent, SessionConfig,
};
use crate::convert::{select_converter, AccelerationContext, ConverterHost, ConverterParams, FrameConverter};
use crate::error::DeviceError;
use crate::pipeline::sink::FrameSink;

/// Grace period between aborting captures and closing the session
const ABORT_GRACE: Duration = Duration::from_millis(30);

/// Receives the outcome of `start_preview` once negotiation finishes
pub trait PreviewCallback: Send + Sync {
    fn on_preview_result(&self, camera_id: &str, ok: bool, message: &str);
}

impl<F> PreviewCallback for F
where
    F: Fn(&str, bool, &str) + Send + Sync,
{
    fn on_preview_result(&self, camera_id: &str, ok: bool, message: &str) {
        self(camera_id, ok, message)
    }
}

/// Per-device construction parameters
#[derive(Clone)]
pub struct DeviceOptions {
    /// Frames the sink may hold before new ones are dropped
    pub queue_capacity: usize,
    pub color_order: ColorOrder,
    pub grey: bool,
    pub grey_separate: bool,
    pub acceleration: Option<Arc<AccelerationContext>>,
    /// Overrides the strategy's permit wait
    pub permit_timeout: Option<Duration>,
    /// Bound on joining the worker thread during teardown
    pub join_timeout: Duration,
    pub core: Option<core_affinity::CoreId>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 4,
            color_order: ColorOrder::Rgba,
            grey: false,
            grey_separate: false,
            acceleration: None,
            permit_timeout: None,
            join_timeout: Duration::from_secs(1),
            core: None,
        }
    }
}

#[derive(Default)]
struct Handles {
    device: Option<Box<dyn PlatformDevice>>,
    session: Option<Box<dyn CaptureSession>>,
}

struct DeviceShared {
    id: Arc<str>,
    platform: Arc<dyn CameraPlatform>,
    sink: Arc<dyn FrameSink>,
    strategy: Box<dyn CaptureStrategy>,
    options: DeviceOptions,
    descriptor: Mutex<Option<CameraDescriptor>>,
    resolution: Mutex<Option<Resolution>>,
    state: Mutex<LifecycleState>,
    configured: AtomicBool,
    stopping: AtomicBool,
    permit: Permit,
    callback: Mutex<Option<Arc<dyn PreviewCallback>>>,
    handles: Mutex<Handles>,
    events: Mutex<Option<EventSink>>,
    worker: Mutex<Option<Worker>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceShared {
    fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    /// Advance the state machine, returning the commands to run
    fn step(&self, event: Event) -> Vec<Command> {
        let mut state = lock(&self.state);
        let t = transition(*state, &event);
        if t.next != *state {
            debug!(camera = %self.id, from = ?*state, to = ?t.next, ?event, "Lifecycle transition");
        }
        *state = t.next;
        t.commands
    }

    /// Commands that do not touch worker-local state
    fn execute(&self, command: Command) {
        match command {
            Command::MarkConfigured(configured) => {
                self.configured.store(configured, Ordering::Release);
            }
            Command::ReleasePermit => {
                self.permit.release();
            }
            Command::ReportReady { ok, reason } => self.report(ok, &reason),
            Command::CloseDevice => self.close_handles(),
            Command::Teardown => self.teardown(),
            Command::StartWorker | Command::OpenDevice | Command::CreateSession | Command::StartRepeating => {
                warn!(camera = %self.id, ?command, "Command issued outside its owner");
            }
        }
    }

    fn report(&self, ok: bool, reason: &str) {
        if ok {
            info!(camera = %self.id, "Preview started");
        } else {
            warn!(camera = %self.id, reason, "Preview failed");
        }
        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            callback.on_preview_result(&self.id, ok, reason);
        }
    }

    /// Abort and close the session, then the device
    fn close_handles(&self) {
        let (session, device) = {
            let mut handles = lock(&self.handles);
            (handles.session.take(), handles.device.take())
        };
        if let Some(mut session) = session {
            if let Err(err) = session.abort_captures() {
                debug!(camera = %self.id, %err, "Abort captures failed");
            }
            std::thread::sleep(ABORT_GRACE);
            session.close();
        }
        if let Some(mut device) = device {
            device.close();
        }
    }

    /// Close handles and stop the worker; safe to repeat
    fn release_resources(&self) {
        self.close_handles();
        lock(&self.events).take();
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            worker.stop(self.options.join_timeout);
        }
    }

    fn teardown(&self) {
        self.release_resources();
        for command in self.step(Event::TeardownComplete) {
            self.execute(command);
        }
    }

    /// Returns whether the stop released the permit
    fn force_stop(&self) -> bool {
        let commands = self.step(Event::StopRequested);
        let tearing_down = commands.contains(&Command::Teardown);
        let released = commands.contains(&Command::ReleasePermit);
        for command in commands {
            self.execute(command);
        }
        if !tearing_down {
            // already closed: leftovers of a failed or disconnected session
            self.release_resources();
            self.configured.store(false, Ordering::Release);
        }
        released
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<EventSink, DeviceError> {
        let weak = Arc::downgrade(self);
        let mut local = DeviceWorker::default();
        let worker = Worker::spawn(format!("camera-{}", self.id), self.options.core, move |event| {
            local.handle(&weak, event);
        })
        .map_err(|source| DeviceError::Worker {
            id: self.id.to_string(),
            source,
        })?;

        let events = EventSink::new(self.id.clone(), worker.sender());
        *lock(&self.events) = Some(events.clone());
        *lock(&self.worker) = Some(worker);
        Ok(events)
    }
}

impl ConverterHost for DeviceShared {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn stop_camera(&self) {
        self.force_stop();
    }
}

/// State owned by the worker thread
#[derive(Default)]
struct DeviceWorker {
    converter: Option<Box<dyn FrameConverter>>,
}

impl DeviceWorker {
    fn handle(&mut self, shared: &Weak<DeviceShared>, event: PlatformEvent) {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match event {
            PlatformEvent::Opened(mut device) => {
                if shared.state() != LifecycleState::Opening {
                    debug!(camera = %shared.id, "Open completed after stop, closing");
                    device.close();
                    return;
                }
                lock(&shared.handles).device = Some(device);
                self.dispatch(&shared, Event::Opened);
            }
            PlatformEvent::Disconnected => {
                warn!(camera = %shared.id, "Camera disconnected");
                self.dispatch(&shared, Event::Disconnected);
            }
            PlatformEvent::Error(code) => {
                error!(camera = %shared.id, ?code, "{}", code.message());
                self.dispatch(&shared, Event::DeviceError(code));
            }
            PlatformEvent::Configured(mut session) => {
                if shared.state() != LifecycleState::SessionRequested {
                    debug!(camera = %shared.id, "Session configured after stop, closing");
                    session.close();
                    return;
                }
                lock(&shared.handles).session = Some(session);
                self.dispatch(&shared, Event::Configured);
            }
            PlatformEvent::ConfigureFailed(reason) => {
                self.dispatch(&shared, Event::SessionFailed(reason));
            }
            PlatformEvent::FrameAvailable(raw) => self.on_frame(&shared, raw),
        }
    }

    fn on_frame(&mut self, shared: &DeviceShared, raw: RawFrame) {
        if shared.state() != LifecycleState::Streaming {
            metrics::counter!("frames_dropped", "reason" => "not_streaming").increment(1);
            return;
        }
        if let Some(converter) = self.converter.as_mut() {
            converter.on_frame_available(&raw, shared);
        }
    }

    fn dispatch(&mut self, shared: &DeviceShared, event: Event) {
        for command in shared.step(event) {
            match command {
                Command::CreateSession => {
                    let next = match self.create_session(shared) {
                        Ok(()) => Event::SessionRequested,
                        Err(reason) => {
                            self.converter = None;
                            Event::SessionFailed(reason)
                        }
                    };
                    self.dispatch(shared, next);
                }
                Command::StartRepeating => {
                    let next = match start_repeating(shared) {
                        Ok(()) => Event::StreamingStarted,
                        Err(reason) => Event::StreamingFailed(reason),
                    };
                    self.dispatch(shared, next);
                }
                Command::CloseDevice => {
                    self.converter = None;
                    shared.execute(Command::CloseDevice);
                }
                other => shared.execute(other),
            }
        }
    }

    /// Pick layout and converter, then ask the platform for a session
    fn create_session(&mut self, shared: &DeviceShared) -> Result<(), String> {
        let descriptor = lock(&shared.descriptor)
            .clone()
            .ok_or_else(|| format!("camera {} has not been opened", shared.id))?;
        let layout = descriptor
            .best_layout()
            .ok_or_else(|| DeviceError::UnsupportedLayout(shared.id.to_string()).to_string())?;
        let resolution = (*lock(&shared.resolution)).ok_or("no preview resolution requested")?;
        let events = lock(&shared.events).clone().ok_or("worker queue closed")?;

        let params = ConverterParams {
            camera_id: shared.id.clone(),
            layout,
            resolution,
            color_order: shared.options.color_order,
            grey: shared.options.grey,
            grey_separate: shared.options.grey_separate,
            queue_capacity: shared.options.queue_capacity,
            sink: shared.sink.clone(),
        };
        let converter = select_converter(params, shared.options.acceleration.clone())
            .map_err(|err| format!("no frame converter: {err}"))?;
        info!(
            camera = %shared.id,
            ?layout,
            %resolution,
            converter = %converter.kind(),
            strategy = shared.strategy.name(),
            "Creating capture session"
        );
        self.converter = Some(converter);

        let config = SessionConfig {
            layout,
            resolution,
            kind: shared.strategy.session_kind(),
        };
        let mut handles = lock(&shared.handles);
        let device = handles.device.as_mut().ok_or("camera closed during open")?;
        device
            .create_session(&config, events)
            .map_err(|err| err.to_string())
    }
}

/// Apply the fixed preview request to the configured session
fn start_repeating(shared: &DeviceShared) -> Result<(), String> {
    let descriptor = lock(&shared.descriptor)
        .clone()
        .ok_or("descriptor missing")?;
    let fps_range = shared.strategy.select_fps_range(&descriptor);
    let request = CaptureRequest::fixed_preview(fps_range);
    debug!(camera = %shared.id, %fps_range, "Starting repeating request");

    let mut handles = lock(&shared.handles);
    let session = handles.session.as_mut().ok_or("session closed")?;
    session
        .set_repeating_request(&request)
        .map_err(|err| err.to_string())
}

/// Handle to one camera's lifecycle
pub struct CameraDevice {
    shared: Arc<DeviceShared>,
}

impl CameraDevice {
    pub fn new(
        id: &str,
        platform: Arc<dyn CameraPlatform>,
        sink: Arc<dyn FrameSink>,
        strategy: Box<dyn CaptureStrategy>,
        options: DeviceOptions,
    ) -> Self {
        Self {
            shared: Arc::new(DeviceShared {
                id: id.into(),
                platform,
                sink,
                strategy,
                options,
                descriptor: Mutex::new(None),
                resolution: Mutex::new(None),
                state: Mutex::new(LifecycleState::Closed),
                configured: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                permit: Permit::new(),
                callback: Mutex::new(None),
                handles: Mutex::new(Handles::default()),
                events: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn strategy_name(&self) -> &'static str {
        self.shared.strategy.name()
    }

    /// Capability snapshot taken by the last successful [`open`](Self::open)
    pub fn descriptor(&self) -> Option<CameraDescriptor> {
        lock(&self.shared.descriptor).clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        *lock(&self.shared.resolution)
    }

    pub fn is_configured(&self) -> bool {
        self.shared.configured.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Query capabilities and check a convertible layout exists
    #[instrument(skip(self), fields(camera = %self.shared.id))]
    pub fn open(&self) -> Result<(), DeviceError> {
        let descriptor = self.shared.platform.describe(&self.shared.id)?;
        if descriptor.best_layout().is_none() {
            return Err(DeviceError::UnsupportedLayout(self.shared.id.to_string()));
        }
        info!(
            name = %descriptor.name,
            facing = ?descriptor.facing,
            layouts = ?descriptor.layouts,
            high_frame_rate = descriptor.supports_high_frame_rate,
            "Camera opened"
        );
        *lock(&self.shared.descriptor) = Some(descriptor);
        Ok(())
    }

    /// Begin streaming at `resolution`.
    ///
    /// Returns false without side effects if the device was never opened,
    /// the size is empty or the permit could not be taken in time. Otherwise
    /// the outcome arrives later through `callback`.
    pub fn start_preview(&self, resolution: Resolution, callback: Arc<dyn PreviewCallback>) -> bool {
        self.start_preview_by(resolution, callback, None)
    }

    /// [`start_preview`](Self::start_preview), giving up on the permit at
    /// `deadline` if that comes before the strategy's own wait.
    #[instrument(skip(self, callback), fields(camera = %self.shared.id))]
    pub fn start_preview_by(
        &self,
        resolution: Resolution,
        callback: Arc<dyn PreviewCallback>,
        deadline: Option<Instant>,
    ) -> bool {
        let shared = &self.shared;
        if lock(&shared.descriptor).is_none() {
            warn!("{}", DeviceError::NotOpen(shared.id.to_string()));
            return false;
        }
        if resolution.is_empty() {
            warn!(
                "{}",
                DeviceError::EmptyResolution {
                    id: shared.id.to_string(),
                    resolution,
                }
            );
            return false;
        }

        let wait = shared
            .options
            .permit_timeout
            .unwrap_or_else(|| shared.strategy.permit_timeout());
        let timeout = || match deadline {
            Some(deadline) => wait.min(deadline.saturating_duration_since(Instant::now())),
            None => wait,
        };
        if !shared.permit.acquire(timeout()) {
            warn!(?wait, "{}", DeviceError::PermitTimeout(shared.id.to_string()));
            return false;
        }
        if shared.state() != LifecycleState::Closed {
            // restart: tear the running session down first
            let released = shared.force_stop();
            if released && !shared.permit.acquire(timeout()) {
                warn!(?wait, "{}", DeviceError::PermitTimeout(shared.id.to_string()));
                return false;
            }
        }
        shared.release_resources();

        shared.stopping.store(false, Ordering::Release);
        shared.configured.store(false, Ordering::Release);
        *lock(&shared.resolution) = Some(resolution);
        *lock(&shared.callback) = Some(callback);

        let mut events = None;
        for command in shared.step(Event::OpenRequested) {
            let outcome = match command {
                Command::StartWorker => shared.spawn_worker().map(|sink| events = Some(sink)),
                Command::OpenDevice => match events.clone() {
                    Some(sink) => shared
                        .platform
                        .open_camera(&shared.id, sink)
                        .map_err(DeviceError::from),
                    None => Err(DeviceError::NotOpen(shared.id.to_string())),
                },
                other => {
                    shared.execute(other);
                    Ok(())
                }
            };
            if let Err(err) = outcome {
                error!(%err, "Could not open camera");
                for command in shared.step(Event::OpenFailed(err.to_string())) {
                    shared.execute(command);
                }
                shared.release_resources();
                return false;
            }
        }
        true
    }

    /// Ask the camera to stop; takes effect on the next frame
    pub fn stop_preview(&self) {
        self.shared.stopping.store(true, Ordering::Release);
    }

    /// Tear the camera down now. Safe to call repeatedly and from any thread.
    #[instrument(skip(self), fields(camera = %self.shared.id))]
    pub fn stop_camera(&self) {
        self.shared.force_stop();
    }
}

impl Drop for CameraDevice {
    fn drop(&mut self) {
        self.shared.force_stop();
    }
}

impl std::fmt::Debug for CameraDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraDevice")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("configured", &self.is_configured())
            .finish()
    }
}
