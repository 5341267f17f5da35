//! GPU contexts for the accelerated converter and the pool that shares them

use std::sync::Arc;

use tracing::{info, instrument, warn};
use wgpu::*;

use crate::error::ConvertError;

/// A wgpu device and queue shared by the converters bound to it
pub struct AccelerationContext {
    index: usize,
    adapter: String,
    device: Device,
    queue: Queue,
}

impl AccelerationContext {
    /// Open a compute-capable GPU device
    #[instrument]
    pub fn new(index: usize) -> Result<Self, ConvertError> {
        pollster::block_on(Self::request(index))
    }

    async fn request(index: usize) -> Result<Self, ConvertError> {
        let instance = Instance::new(InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| ConvertError::Acceleration("no suitable GPU adapter found".into()))?;

        let name = adapter.get_info().name;
        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("multicam conversion device"),
                    required_features: Features::empty(),
                    required_limits: Limits::downlevel_defaults().using_resolution(adapter.limits()),
                    memory_hints: MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|err| ConvertError::Acceleration(err.to_string()))?;

        info!(index, adapter = %name, "Acceleration context ready");
        Ok(Self {
            index,
            adapter: name,
            device,
            queue,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }
}

impl std::fmt::Debug for AccelerationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationContext")
            .field("index", &self.index)
            .field("adapter", &self.adapter)
            .finish()
    }
}

type Factory<C> = Box<dyn FnMut(usize) -> Result<C, ConvertError> + Send>;

/// Bounded set of contexts handed out round-robin.
///
/// A single camera gets one context that is reused on every request; several
/// cameras spread over at most `capacity` contexts. Contexts stay alive until
/// [`release_all`](Self::release_all), independent of the devices using them.
pub struct AccelerationPool<C = AccelerationContext> {
    capacity: usize,
    contexts: Vec<Arc<C>>,
    next: usize,
    unavailable: bool,
    factory: Factory<C>,
}

impl AccelerationPool<AccelerationContext> {
    pub fn new(capacity: usize) -> Self {
        Self::with_factory(capacity, AccelerationContext::new)
    }
}

impl<C> AccelerationPool<C> {
    pub fn with_factory<F>(capacity: usize, factory: F) -> Self
    where
        F: FnMut(usize) -> Result<C, ConvertError> + Send + 'static,
    {
        Self {
            capacity: capacity.max(1),
            contexts: Vec::new(),
            next: 0,
            unavailable: false,
            factory: Box::new(factory),
        }
    }

    /// Context for the next device of a run with `camera_count` cameras.
    ///
    /// None once context creation has failed; callers fall back to the CPU.
    pub fn acquire(&mut self, camera_count: usize) -> Option<Arc<C>> {
        if self.unavailable {
            return None;
        }
        let limit = if camera_count <= 1 { 1 } else { self.capacity };
        let slot = self.next % limit;
        self.next = self.next.wrapping_add(1);

        if let Some(ctx) = self.contexts.get(slot) {
            return Some(ctx.clone());
        }
        match (self.factory)(self.contexts.len()) {
            Ok(ctx) => {
                let ctx = Arc::new(ctx);
                self.contexts.push(ctx.clone());
                Some(ctx)
            }
            Err(err) => {
                warn!(%err, "Acceleration disabled for this run");
                self.unavailable = true;
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// False once context creation has failed, until the next release
    pub fn is_available(&self) -> bool {
        !self.unavailable
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Drop the pool's references; contexts die once their converters do
    pub fn release_all(&mut self) {
        self.contexts.clear();
        self.next = 0;
        self.unavailable = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> AccelerationPool<usize> {
        AccelerationPool::with_factory(capacity, Ok)
    }

    #[test]
    fn single_camera_shares_one_context() {
        let mut pool = pool(2);
        let a = pool.acquire(1).unwrap();
        let b = pool.acquire(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn many_cameras_round_robin_within_capacity() {
        let mut pool = pool(2);
        let got: Vec<usize> = (0..5).map(|_| *pool.acquire(3).unwrap()).collect();
        assert_eq!(got, vec![0, 1, 0, 1, 0]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn creation_failure_disables_pool() {
        let mut calls = 0;
        let mut pool: AccelerationPool<usize> = AccelerationPool::with_factory(2, move |_| {
            calls += 1;
            assert_eq!(calls, 1, "factory retried after failure");
            Err(ConvertError::Acceleration("no gpu".into()))
        });
        assert!(pool.acquire(2).is_none());
        assert!(pool.acquire(2).is_none());
        assert!(!pool.is_available());
        pool.release_all();
        assert!(pool.is_available());
    }

    #[test]
    fn release_drops_references() {
        let mut pool = pool(2);
        let held = pool.acquire(2).unwrap();
        pool.release_all();
        assert!(pool.is_empty());
        assert_eq!(Arc::strong_count(&held), 1);
    }
}
