//! Shared teardown flag consulted before applying remote results.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable flag shared by every component of one synchroniser.
///
/// Remote calls are never aborted. Once the flag is cleared, components stop
/// writing the results of calls that resolve afterwards.
#[derive(Clone, Debug)]
pub struct Liveness {
    alive: Arc<AtomicBool>,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    /// Creates a live flag.
    #[must_use]
    pub fn new() -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Returns `true` until [`Liveness::retire`] is called on any clone.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Marks the owner as torn down.
    pub fn retire(&self) {
        self.alive.store(false, Ordering::Release);
    }
}
