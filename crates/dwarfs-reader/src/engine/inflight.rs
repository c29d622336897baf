//! Outstanding-read tracking so `close` can drain before teardown.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct Inflight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Inflight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one outstanding operation until the guard drops.
    pub fn enter(self: &Arc<Self>) -> InflightGuard {
        *self.count.lock() += 1;
        InflightGuard(Arc::clone(self))
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until no operation is outstanding.
    pub fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

#[derive(Debug)]
pub struct InflightGuard(Arc<Inflight>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}
