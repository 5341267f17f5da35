#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use multicam::camera::PreviewCallback;
use multicam::pipeline::FrameSink;
use multicam::Frame;

/// Sink keeping every frame it is given, with an adjustable backlog
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Frame>>,
    registered: Mutex<Vec<(String, usize, bool)>>,
    pub backlog: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames_for(&self, camera_id: &str) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| &*f.camera_id == camera_id)
            .cloned()
            .collect()
    }

    pub fn count_for(&self, camera_id: &str) -> usize {
        self.frames_for(camera_id).len()
    }

    pub fn registered(&self) -> Vec<(String, usize, bool)> {
        self.registered.lock().unwrap().clone()
    }
}

impl FrameSink for RecordingSink {
    fn register_camera(&self, camera_id: &str, capacity: usize, rear_facing: bool) -> bool {
        self.registered
            .lock()
            .unwrap()
            .push((camera_id.to_owned(), capacity, rear_facing));
        true
    }

    fn enqueue(&self, frame: Frame) -> bool {
        self.frames.lock().unwrap().push(frame);
        true
    }

    fn in_flight(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    fn clear_queue(&self, _camera_id: &str) -> bool {
        true
    }
}

/// Readiness reports collected from a device
pub struct Reports {
    rx: flume::Receiver<(String, bool, String)>,
    tx: flume::Sender<(String, bool, String)>,
}

impl Reports {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { rx, tx }
    }

    pub fn callback(&self) -> Arc<dyn PreviewCallback> {
        let tx = self.tx.clone();
        Arc::new(move |id: &str, ok: bool, message: &str| {
            let _ = tx.send((id.to_owned(), ok, message.to_owned()));
        })
    }

    pub fn next(&self, timeout: Duration) -> Option<(String, bool, String)> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Poll `condition` every 10 ms until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
