//! Reclamation triggers
//!
//! Reclamation is advisory: a [`Reclaimer`] is asked to give memory back and
//! may free nothing at all. It never fails.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Something that can be asked to release memory
pub trait Reclaimer: Send + Sync {
    fn reclaim(&self);
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Reclaimer running registered release callbacks in registration order.
///
/// Callers register whatever owns droppable memory (caches, pools, spill
/// buffers). With no hooks registered, reclamation is a no-op. Hooks run
/// without the registry locked, so a hook may register further hooks.
#[derive(Default)]
pub struct ReclaimHooks {
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl ReclaimHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named release callback
    pub fn register(&self, name: impl Into<String>, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.lock().push((name.into(), Arc::new(hook)));
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Reclaimer for ReclaimHooks {
    fn reclaim(&self) {
        let hooks = self.hooks.lock().clone();
        for (name, hook) in &hooks {
            debug!(hook = %name, "Running reclaim hook");
            hook();
        }
    }
}
