use std::time::Duration;

/// Binary semaphore guarding a device's open → session-negotiation window.
///
/// Holding the permit means a token sits in a capacity-1 channel.
#[derive(Clone)]
pub struct Permit {
    slot: flume::Sender<()>,
    token: flume::Receiver<()>,
}

impl Permit {
    pub fn new() -> Self {
        let (slot, token) = flume::bounded(1);
        Self { slot, token }
    }

    /// Wait up to `timeout` for the permit
    pub fn acquire(&self, timeout: Duration) -> bool {
        self.slot.send_timeout((), timeout).is_ok()
    }

    /// Release the permit; returns false if it was not held
    pub fn release(&self) -> bool {
        self.token.try_recv().is_ok()
    }

    pub fn is_held(&self) -> bool {
        self.slot.is_full()
    }
}

impl Default for Permit {
    fn default() -> Self {
        Self::new()
    }
}
