//! Ring-buffer backed frame sink

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::debug;

use crate::capture::frame::{Frame, Resolution};
use crate::pipeline::sink::FrameSink;

/// Bounded per-camera frame queue; the oldest frame is evicted when full
pub struct FrameRingBuffer {
    ring: HeapRb<Frame>,

    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Snapshot of a queue's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Push a frame, returning the frame it evicted if the ring was full
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        let evicted = self.ring.push_overwrite(frame);
        if evicted.is_some() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        evicted
    }

    pub fn pop(&mut self) -> Option<Frame> {
        let frame = self.ring.try_pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Discard everything queued, returning how many frames were dropped
    pub fn clear(&mut self) -> usize {
        let cleared = self.ring.clear();
        self.stats.frames_dropped.fetch_add(cleared, Ordering::Relaxed);
        cleared
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

struct CameraQueue {
    ring: Mutex<FrameRingBuffer>,
    /// Set under the ring lock once a re-registration replaced this queue
    retired: AtomicBool,
    rear_facing: bool,
    preview_size: Mutex<Option<Resolution>>,
}

impl CameraQueue {
    fn ring(&self) -> std::sync::MutexGuard<'_, FrameRingBuffer> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// [`FrameSink`] keeping the newest frames of each camera in its own ring.
///
/// Producers are the camera workers; a consumer pops per camera and may wait
/// on [`RingSink::wait_frame`] for arrival notifications.
pub struct RingSink {
    queues: RwLock<HashMap<String, Arc<CameraQueue>>>,
    in_flight: AtomicUsize,
    notify_tx: flume::Sender<Arc<str>>,
    notify_rx: flume::Receiver<Arc<str>>,
}

impl RingSink {
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = flume::bounded(256);
        Self {
            queues: RwLock::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            notify_tx,
            notify_rx,
        }
    }

    fn queue(&self, camera_id: &str) -> Option<Arc<CameraQueue>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(camera_id)
            .cloned()
    }

    /// Oldest queued frame of one camera
    pub fn pop(&self, camera_id: &str) -> Option<Frame> {
        let frame = self.queue(camera_id)?.ring().pop()?;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        Some(frame)
    }

    /// Every queued frame of one camera, oldest first
    pub fn drain(&self, camera_id: &str) -> Vec<Frame> {
        let Some(queue) = self.queue(camera_id) else {
            return Vec::new();
        };
        let mut ring = queue.ring();
        let frames: Vec<Frame> = std::iter::from_fn(|| ring.pop()).collect();
        self.in_flight.fetch_sub(frames.len(), Ordering::AcqRel);
        frames
    }

    /// Wait for the next arrival notification, yielding the camera id
    pub fn wait_frame(&self, timeout: Duration) -> Option<Arc<str>> {
        self.notify_rx.recv_timeout(timeout).ok()
    }

    pub fn cameras(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn is_rear_facing(&self, camera_id: &str) -> Option<bool> {
        self.queue(camera_id).map(|q| q.rear_facing)
    }

    pub fn preview_size(&self, camera_id: &str) -> Option<Resolution> {
        let queue = self.queue(camera_id)?;
        let size = *queue.preview_size.lock().unwrap_or_else(PoisonError::into_inner);
        size
    }

    pub fn stats(&self, camera_id: &str) -> Option<RingStats> {
        self.queue(camera_id).map(|q| q.ring().stats())
    }
}

impl RingSink {
    fn push_into(&self, queue: &CameraQueue, frame: Frame) -> bool {
        let camera_id = frame.camera_id.clone();
        {
            // counted under the ring lock so a concurrent pop never underflows
            let mut ring = queue.ring();
            if queue.retired.load(Ordering::Acquire) {
                debug!(camera = %camera_id, "Frame for a replaced queue dropped");
                return false;
            }
            if ring.push(frame).is_none() {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
            }
        }
        // Notifications are a hint; a full channel just means the consumer is behind
        let _ = self.notify_tx.try_send(camera_id);
        true
    }
}

impl Default for RingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for RingSink {
    fn register_camera(&self, camera_id: &str, capacity: usize, rear_facing: bool) -> bool {
        if capacity == 0 {
            return false;
        }
        let queue = Arc::new(CameraQueue {
            ring: Mutex::new(FrameRingBuffer::new(capacity)),
            retired: AtomicBool::new(false),
            rear_facing,
            preview_size: Mutex::new(None),
        });
        let previous = self
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(camera_id.to_owned(), queue);
        if let Some(previous) = previous {
            let mut ring = previous.ring();
            previous.retired.store(true, Ordering::Release);
            let stale = ring.clear();
            self.in_flight.fetch_sub(stale, Ordering::AcqRel);
        }
        debug!(camera = camera_id, capacity, rear_facing, "Registered camera queue");
        true
    }

    fn enqueue(&self, frame: Frame) -> bool {
        let Some(queue) = self.queue(&frame.camera_id) else {
            return false;
        };
        self.push_into(&queue, frame)
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn clear_queue(&self, camera_id: &str) -> bool {
        let Some(queue) = self.queue(camera_id) else {
            return false;
        };
        let cleared = queue.ring().clear();
        self.in_flight.fetch_sub(cleared, Ordering::AcqRel);
        true
    }

    fn set_preview_size(&self, camera_id: &str, size: Resolution) -> bool {
        let Some(queue) = self.queue(camera_id) else {
            return false;
        };
        *queue.preview_size.lock().unwrap_or_else(PoisonError::into_inner) = Some(size);
        true
    }
}
