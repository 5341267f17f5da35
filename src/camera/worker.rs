//! Per-device worker thread with a private serial task queue

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tracing::{debug, warn};

use crate::capture::platform::PlatformEvent;

/// Message on a worker queue
pub enum WorkerTask {
    Platform(PlatformEvent),
    Quit,
}

/// A named thread draining one device's queue in FIFO order
pub struct Worker {
    name: String,
    tx: flume::Sender<WorkerTask>,
    done: flume::Receiver<()>,
    interrupted: Arc<AtomicBool>,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<H>(
        name: String,
        core: Option<core_affinity::CoreId>,
        mut handler: H,
    ) -> std::io::Result<Self>
    where
        H: FnMut(PlatformEvent) + Send + 'static,
    {
        let (tx, rx) = flume::unbounded::<WorkerTask>();
        // Never sent on; dropped when the thread exits so `stop` can wait on it
        let (done_tx, done) = flume::bounded::<()>(0);
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _done = done_tx;
            if let Some(core) = core {
                if !core_affinity::set_for_current(core) {
                    debug!(core = core.id, "Could not pin camera worker");
                }
            }
            while let Ok(task) = rx.recv() {
                if flag.load(Ordering::Acquire) {
                    break;
                }
                match task {
                    WorkerTask::Quit => break,
                    WorkerTask::Platform(event) => handler(event),
                }
            }
        })?;

        Ok(Self {
            name,
            tx,
            done,
            interrupted,
            thread_id: handle.thread().id(),
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> flume::Sender<WorkerTask> {
        self.tx.clone()
    }

    /// True when called from the worker thread itself
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Signal the thread to quit, then join it for at most `timeout`.
    ///
    /// From the worker thread itself this only signals; the loop exits after
    /// the task in progress returns. A thread that overruns the timeout is
    /// flagged as interrupted and detached.
    pub fn stop(mut self, timeout: Duration) {
        let _ = self.tx.send(WorkerTask::Quit);
        if self.is_current() {
            return;
        }

        match self.done.recv_timeout(timeout) {
            Err(flume::RecvTimeoutError::Timeout) => {
                warn!(worker = %self.name, "Worker did not exit in time, interrupting");
                self.interrupted.store(true, Ordering::Release);
            }
            _ => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        warn!(worker = %self.name, "Worker thread panicked");
                    }
                }
                debug!(worker = %self.name, "Worker stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformErrorCode;

    #[test]
    fn runs_tasks_in_order_and_stops() {
        let (seen_tx, seen_rx) = flume::unbounded();
        let worker = Worker::spawn("test-worker".into(), None, move |event| {
            if let PlatformEvent::Error(code) = event {
                let _ = seen_tx.send(code);
            }
        })
        .unwrap();

        let tx = worker.sender();
        for code in [PlatformErrorCode::CameraInUse, PlatformErrorCode::DeviceFatal] {
            tx.send(WorkerTask::Platform(PlatformEvent::Error(code))).unwrap();
        }
        worker.stop(Duration::from_secs(1));

        let seen: Vec<_> = seen_rx.drain().collect();
        assert_eq!(
            seen,
            vec![PlatformErrorCode::CameraInUse, PlatformErrorCode::DeviceFatal]
        );
        assert!(tx.send(WorkerTask::Quit).is_err());
    }

    #[test]
    fn stuck_worker_is_detached() {
        let worker = Worker::spawn("stuck-worker".into(), None, |_| {
            thread::sleep(Duration::from_millis(300));
        })
        .unwrap();
        worker
            .sender()
            .send(WorkerTask::Platform(PlatformEvent::Disconnected))
            .unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = std::time::Instant::now();
        worker.stop(Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(250));
    }
}
