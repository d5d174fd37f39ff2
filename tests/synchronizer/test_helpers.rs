//! Shared fixtures for synchronizer BDD scenarios.

use std::cell::RefCell;
use std::sync::Arc;

use byocvpn_sync::test_support::{Gate, ScriptedBackend};
use byocvpn_sync::{Instance, Synchronizer, SynchronizerError, SynchronizerOptions};
use rstest::fixture;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

pub type PendingSpawn = JoinHandle<Result<Instance, SynchronizerError>>;

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Sync(#[from] SynchronizerError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

pub struct SyncWorld {
    pub runtime: Runtime,
    pub backend: ScriptedBackend,
    pub synchronizer: Arc<Synchronizer<ScriptedBackend>>,
    pub spawn_gate: RefCell<Option<Gate>>,
    pub pending_spawn: RefCell<Option<PendingSpawn>>,
}

impl SyncWorld {
    /// Drives the runtime until spawned work has had a chance to run.
    pub fn settle(&self) {
        self.runtime.block_on(async {
            for _ in 0..16 {
                tokio::task::yield_now().await;
            }
        });
    }
}

#[fixture]
pub fn world() -> SyncWorld {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| panic!("test runtime should build: {err}"));
    let backend = ScriptedBackend::new();
    let synchronizer = Arc::new(Synchronizer::new(
        Arc::new(backend.clone()),
        SynchronizerOptions::default(),
    ));
    SyncWorld {
        runtime,
        backend,
        synchronizer,
        spawn_gate: RefCell::new(None),
        pending_spawn: RefCell::new(None),
    }
}
