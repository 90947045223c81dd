use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

static RUNTIME: Mutex<Weak<EngineRuntime>> = parking_lot::const_mutex(Weak::new());

/// Process-wide state shared by every live engine adapter.
///
/// Created when the first adapter is built and torn down when the last one is
/// dropped. Each adapter holds a [`RunnerLease`] on it, identified by the lowest
/// runner id not currently in use.
pub struct EngineRuntime {
    runners: Mutex<RunnerRegistry>,
}

impl EngineRuntime {
    /// Returns the live runtime, creating it if no adapter currently holds one.
    pub fn acquire() -> Arc<EngineRuntime> {
        let mut slot = RUNTIME.lock();
        if let Some(runtime) = slot.upgrade() {
            return runtime;
        }
        let runtime = Arc::new(EngineRuntime {
            runners: Mutex::new(RunnerRegistry::default()),
        });
        *slot = Arc::downgrade(&runtime);
        info!("engine runtime initialized");
        runtime
    }

    /// Leases a runner id for one adapter.
    pub fn lease(self: &Arc<Self>) -> RunnerLease {
        let id = self.runners.lock().allocate();
        debug!(runner = id, "runner leased");
        RunnerLease {
            runtime: Arc::clone(self),
            id,
        }
    }

    pub fn live_runners(&self) -> usize {
        self.runners.lock().len()
    }
}

impl Drop for EngineRuntime {
    fn drop(&mut self) {
        info!("engine runtime torn down");
    }
}

/// A runner id held for as long as its adapter lives.
pub struct RunnerLease {
    runtime: Arc<EngineRuntime>,
    id: usize,
}

impl RunnerLease {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for RunnerLease {
    fn drop(&mut self) {
        self.runtime.runners.lock().release(self.id);
        debug!(runner = self.id, "runner released");
    }
}

/// Hands out the lowest free id.
#[derive(Default)]
pub(crate) struct RunnerRegistry {
    live: BTreeSet<usize>,
}

impl RunnerRegistry {
    pub(crate) fn allocate(&mut self) -> usize {
        let id = (0..).find(|id| !self.live.contains(id)).unwrap_or(self.live.len());
        self.live.insert(id);
        id
    }

    pub(crate) fn release(&mut self, id: usize) {
        self.live.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_reuses_lowest_free_id() {
        let mut registry = RunnerRegistry::default();
        assert_eq!(registry.allocate(), 0);
        assert_eq!(registry.allocate(), 1);
        assert_eq!(registry.allocate(), 2);
        registry.release(1);
        assert_eq!(registry.allocate(), 1);
        assert_eq!(registry.allocate(), 3);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_acquire_shares_live_runtime() {
        let first = EngineRuntime::acquire();
        let second = EngineRuntime::acquire();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_leases_are_distinct_while_held() {
        let runtime = EngineRuntime::acquire();
        let a = runtime.lease();
        let b = runtime.lease();
        assert_ne!(a.id(), b.id());
    }
}
