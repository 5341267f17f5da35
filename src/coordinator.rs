//! Multi-camera orchestration
//!
//! The coordinator owns the registered [`CameraDevice`]s, starts them as a
//! group and waits, under a deadline, for each to report whether its preview
//! came up.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::camera::{choose_strategy, CameraDevice, DeviceOptions};
use crate::capture::frame::{ColorOrder, Resolution};
use crate::capture::platform::{CameraPlatform, Facing};
use crate::convert::AccelerationPool;
use crate::error::{PlatformError, PreviewError};
use crate::pipeline::sink::FrameSink;
use crate::Config;

/// Placeholder id for "no camera in this slot"; always skipped
pub const NONE_ID: &str = "None";

/// Coordinator-wide tuning
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Contexts shared between cameras when several run at once
    pub acceleration_pool_size: usize,
    pub readiness_deadline: Duration,
    pub poll_interval: Duration,
    /// Overrides each strategy's permit wait
    pub permit_timeout: Option<Duration>,
    /// Pin each camera worker to its own core, round-robin
    pub pin_workers: bool,
    pub color_order: ColorOrder,
    pub grey: bool,
    pub grey_separate: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            acceleration_pool_size: 2,
            readiness_deadline: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            permit_timeout: None,
            pin_workers: false,
            color_order: ColorOrder::Rgba,
            grey: true,
            grey_separate: false,
        }
    }
}

impl From<&Config> for CoordinatorOptions {
    fn from(config: &Config) -> Self {
        Self {
            acceleration_pool_size: config.acceleration.pool_size,
            readiness_deadline: Duration::from_millis(config.pipeline.readiness_deadline_ms),
            poll_interval: Duration::from_millis(config.pipeline.poll_interval_ms),
            permit_timeout: config.pipeline.permit_timeout_ms.map(Duration::from_millis),
            pin_workers: config.pipeline.pin_workers,
            color_order: config.capture.color_order,
            grey: config.capture.grey,
            grey_separate: config.acceleration.grey_separate,
        }
    }
}

/// Rear cameras first, then front and external ones, the placeholder last
fn order_rank(id: &str, facing: Option<Facing>) -> u8 {
    match (id, facing) {
        (NONE_ID, _) => 2,
        (_, Some(Facing::Rear)) => 0,
        _ => 1,
    }
}

pub struct CameraCoordinator {
    platform: Arc<dyn CameraPlatform>,
    sink: Arc<dyn FrameSink>,
    options: CoordinatorOptions,
    devices: HashMap<String, CameraDevice>,
    pool: AccelerationPool,
    cores: Vec<core_affinity::CoreId>,
    next_core: usize,
    previewing: bool,
}

impl CameraCoordinator {
    pub fn new(
        platform: Arc<dyn CameraPlatform>,
        sink: Arc<dyn FrameSink>,
        options: CoordinatorOptions,
    ) -> Self {
        let cores = if options.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        Self {
            platform,
            sink,
            pool: AccelerationPool::new(options.acceleration_pool_size),
            options,
            devices: HashMap::new(),
            cores,
            next_core: 0,
            previewing: false,
        }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    pub fn device(&self, id: &str) -> Option<&CameraDevice> {
        self.devices.get(id)
    }

    /// Ids of registered devices, sorted
    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// True after a `start_preview` in which every camera came up
    pub fn is_previewing(&self) -> bool {
        self.previewing
    }

    /// Cameras facing one of `facings`, with the sizes each can stream.
    ///
    /// High-speed sizes are listed for cameras that support them when
    /// `want_high_frame_rate` is set. Cameras whose capabilities cannot be
    /// read are skipped.
    pub fn enumerate(
        &self,
        facings: &[Facing],
        want_high_frame_rate: bool,
    ) -> Result<Vec<(String, Vec<Resolution>)>, PlatformError> {
        let mut found = Vec::new();
        for id in self.platform.camera_ids()? {
            let descriptor = match self.platform.describe(&id) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    warn!(camera = %id, %err, "Skipping camera");
                    continue;
                }
            };
            if !facings.contains(&descriptor.facing) {
                continue;
            }
            let Some(layout) = descriptor.best_layout() else {
                debug!(camera = %id, "No YUV 4:2:0 output, skipping");
                continue;
            };
            let high = want_high_frame_rate && descriptor.supports_high_frame_rate;
            match self.platform.output_sizes(&id, layout, high) {
                Ok(sizes) => found.push((id, sizes)),
                Err(err) => warn!(camera = %id, %err, "Could not list output sizes"),
            }
        }
        Ok(found)
    }

    /// Sort ids for start-up: rear before front, the placeholder last
    pub fn ordered_ids(&self, ids: &[&str]) -> Vec<String> {
        let mut ranked: Vec<(u8, String)> = ids
            .iter()
            .map(|&id| {
                let facing = (id != NONE_ID)
                    .then(|| self.platform.describe(id).ok())
                    .flatten()
                    .map(|d| d.facing);
                (order_rank(id, facing), id.to_owned())
            })
            .collect();
        ranked.sort();
        ranked.into_iter().map(|(_, id)| id).collect()
    }

    fn next_core(&mut self) -> Option<core_affinity::CoreId> {
        if self.cores.is_empty() {
            return None;
        }
        let core = self.cores[self.next_core % self.cores.len()];
        self.next_core += 1;
        Some(core)
    }

    /// Create, open and register a device for each id.
    ///
    /// A device already registered under the same id is stopped and replaced.
    /// The map holds false for the placeholder id and for any camera that
    /// could not be opened or registered with the sink.
    #[instrument(skip(self))]
    pub fn initialize(
        &mut self,
        ids: &[&str],
        queue_capacity: usize,
        want_high_frame_rate: bool,
        use_acceleration: bool,
    ) -> HashMap<String, bool> {
        let ordered = self.ordered_ids(ids);
        let camera_count = ordered.iter().filter(|id| *id != NONE_ID).count();
        let mut results = HashMap::new();

        for id in ordered {
            if id == NONE_ID {
                results.insert(id, false);
                continue;
            }
            if let Some(previous) = self.devices.remove(&id) {
                debug!(camera = %id, "Replacing registered device");
                previous.stop_camera();
            }
            let ok = self.create_device(&id, camera_count, queue_capacity, want_high_frame_rate, use_acceleration);
            results.insert(id, ok);
        }
        info!(?results, "Cameras initialized");
        results
    }

    fn create_device(
        &mut self,
        id: &str,
        camera_count: usize,
        queue_capacity: usize,
        want_high_frame_rate: bool,
        use_acceleration: bool,
    ) -> bool {
        let descriptor = match self.platform.describe(id) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                error!(camera = %id, %err, "Capability query failed");
                return false;
            }
        };
        let strategy = choose_strategy(&descriptor, want_high_frame_rate);
        let acceleration = if use_acceleration {
            self.pool.acquire(camera_count)
        } else {
            None
        };
        let options = DeviceOptions {
            queue_capacity,
            color_order: self.options.color_order,
            grey: self.options.grey,
            grey_separate: self.options.grey_separate,
            acceleration,
            permit_timeout: self.options.permit_timeout,
            core: self.next_core(),
            ..DeviceOptions::default()
        };
        let device = CameraDevice::new(id, self.platform.clone(), self.sink.clone(), strategy, options);
        if let Err(err) = device.open() {
            error!(camera = %id, %err, "Could not open camera");
            return false;
        }
        if !self
            .sink
            .register_camera(id, queue_capacity, descriptor.is_rear_facing())
        {
            error!(camera = %id, "Sink refused camera registration");
            return false;
        }
        self.devices.insert(id.to_owned(), device);
        true
    }

    /// Start every requested camera concurrently and wait for all of them.
    ///
    /// A camera that reports failure is stopped right away; the others keep
    /// streaming whatever the overall result.
    #[instrument(skip(self, requests), fields(cameras = requests.len()))]
    pub fn start_preview(&mut self, requests: &HashMap<String, Resolution>) -> Result<(), PreviewError> {
        if let Some(id) = requests.keys().find(|id| !self.devices.contains_key(*id)) {
            error!(camera = %id, "Camera not initialised");
            return Err(PreviewError::NotInitialized(id.clone()));
        }

        let (mut rear, front): (Vec<_>, Vec<_>) = requests
            .iter()
            .filter_map(|(id, res)| self.devices.get(id).map(|device| (id.as_str(), *res, device)))
            .partition(|(_, _, device)| device.descriptor().is_some_and(|d| d.is_rear_facing()));
        rear.sort_by_key(|(id, _, _)| *id);
        let mut group = rear;
        let mut front = front;
        front.sort_by_key(|(id, _, _)| *id);
        group.extend(front);

        for (id, res, _) in &group {
            self.sink.set_preview_size(id, *res);
        }

        let ready: Arc<Mutex<HashMap<String, bool>>> = Arc::default();
        let options = &self.options;
        let deadline = Instant::now() + options.readiness_deadline;
        let (failed, unresponsive) = thread::scope(|scope| {
            for &(id, res, device) in &group {
                let ready = ready.clone();
                let failed_start = ready.clone();
                let callback = Arc::new(move |camera: &str, ok: bool, message: &str| {
                    if !ok {
                        warn!(camera, message, "Preview failed");
                    }
                    ready
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(camera.to_owned(), ok);
                });
                scope.spawn(move || {
                    if !device.start_preview_by(res, callback, Some(deadline)) {
                        failed_start
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(id.to_owned(), false);
                    }
                });
            }
            wait_ready(&group, &ready, deadline, options.poll_interval)
        });

        self.previewing = failed.is_empty() && unresponsive.is_empty();
        if self.previewing {
            info!("All cameras previewing");
            return Ok(());
        }
        let err = PreviewError::Failed {
            failed,
            unresponsive,
        };
        error!("{err}");
        Err(err)
    }

    /// Signal each named camera to stop and drop the pooled contexts
    pub fn stop_preview(&mut self, ids: &[&str]) {
        for id in ids {
            if let Some(device) = self.devices.get(*id) {
                device.stop_preview();
            }
        }
        self.previewing = false;
        self.pool.release_all();
    }

    /// Force-stop and forget every device
    pub fn shutdown(&mut self) {
        for (id, device) in self.devices.drain() {
            debug!(camera = %id, "Stopping camera");
            device.stop_camera();
        }
        self.previewing = false;
        self.pool.release_all();
    }
}

/// Poll readiness until every camera has answered or `deadline` passes.
///
/// Returns the ids that failed and the ids that never answered. Failed
/// cameras are stopped as soon as their answer is seen.
fn wait_ready(
    group: &[(&str, Resolution, &CameraDevice)],
    ready: &Mutex<HashMap<String, bool>>,
    deadline: Instant,
    poll_interval: Duration,
) -> (Vec<String>, Vec<String>) {
    let mut seen = HashSet::new();
    let mut failed = Vec::new();

    loop {
        let snapshot = ready.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for &(id, _, device) in group {
            if seen.contains(id) {
                continue;
            }
            if let Some(&ok) = snapshot.get(id) {
                seen.insert(id);
                if !ok {
                    device.stop_camera();
                    failed.push(id.to_owned());
                }
            }
        }
        if seen.len() == group.len() || Instant::now() >= deadline {
            break;
        }
        thread::sleep(poll_interval);
    }

    let unresponsive = group
        .iter()
        .filter(|(id, _, _)| !seen.contains(id))
        .map(|(id, _, _)| id.to_string())
        .collect();
    (failed, unresponsive)
}

impl Drop for CameraCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{SyntheticCamera, SyntheticPlatform};
    use crate::capture::PixelLayout;
    use crate::pipeline::RingSink;

    fn coordinator(platform: SyntheticPlatform) -> CameraCoordinator {
        CameraCoordinator::new(
            Arc::new(platform),
            Arc::new(RingSink::new()),
            CoordinatorOptions::default(),
        )
    }

    #[test]
    fn rear_before_front_placeholder_last() {
        let platform = SyntheticPlatform::new()
            .with_camera(SyntheticCamera::new("0", Facing::Front))
            .with_camera(SyntheticCamera::new("1", Facing::Rear))
            .with_camera(SyntheticCamera::new("2", Facing::External));
        let coordinator = coordinator(platform);
        assert_eq!(
            coordinator.ordered_ids(&[NONE_ID, "2", "0", "1"]),
            vec!["1", "0", "2", NONE_ID]
        );
    }

    #[test]
    fn enumerate_filters_by_facing() {
        let platform = SyntheticPlatform::new()
            .with_camera(SyntheticCamera::new("0", Facing::Rear))
            .with_camera(SyntheticCamera::new("1", Facing::Front))
            .with_camera(SyntheticCamera::new("2", Facing::Rear).layouts(&[PixelLayout::Jpeg]));
        let coordinator = coordinator(platform);

        let rear = coordinator.enumerate(&[Facing::Rear], false).unwrap();
        assert_eq!(rear.len(), 1);
        assert_eq!(rear[0].0, "0");
        assert!(rear[0].1.contains(&Resolution::new(640, 480)));

        let all = coordinator.enumerate(&[Facing::Rear, Facing::Front], false).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn placeholder_and_unknown_ids_fail_initialize() {
        let mut coordinator = coordinator(SyntheticPlatform::rear_and_front());
        let results = coordinator.initialize(&["0", NONE_ID, "missing"], 4, false, false);
        assert_eq!(results.get("0"), Some(&true));
        assert_eq!(results.get(NONE_ID), Some(&false));
        assert_eq!(results.get("missing"), Some(&false));
        assert_eq!(coordinator.camera_ids(), vec!["0"]);
    }

    #[test]
    fn unsupported_layout_is_not_registered() {
        let platform = SyntheticPlatform::new()
            .with_camera(SyntheticCamera::new("0", Facing::Rear).layouts(&[PixelLayout::Rgb565]));
        let mut coordinator = coordinator(platform);
        let results = coordinator.initialize(&["0"], 4, false, false);
        assert_eq!(results.get("0"), Some(&false));
        assert!(coordinator.device("0").is_none());
    }

    #[test]
    fn unregistered_request_fails_fast() {
        let mut coordinator = coordinator(SyntheticPlatform::rear_and_front());
        let requests = HashMap::from([("0".to_owned(), Resolution::new(320, 240))]);
        let err = coordinator.start_preview(&requests).unwrap_err();
        assert!(matches!(err, PreviewError::NotInitialized(id) if id == "0"));
    }
}
