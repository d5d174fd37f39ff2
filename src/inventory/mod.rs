//! Instance inventory across all catalog regions.
//!
//! [`InstanceInventory`] is the only writer of the instance collection. A
//! refresh fans one listing out per region and merges the answers in catalog
//! order. Spawns insert a placeholder first and reconcile it once the backend
//! answers; terminations mark the entry before the call and remove it after.

mod error;
mod types;

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{Backend, InstanceRecord, SpawnedInstance};
use crate::config::DEFAULT_INSTANCE_DISPLAY_NAME;
use crate::liveness::Liveness;
use crate::region::{CatalogStatus, RegionCatalog};

pub use error::InventoryError;
pub use types::{
    Instance, InventoryEntry, InventorySnapshot, LifecycleState, PENDING_ID_PREFIX, Placeholder,
    RefreshReport, RegionFailure,
};

/// Tuning knobs for [`InstanceInventory`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InventoryOptions {
    /// Upper bound on concurrent region listings; zero removes the cap.
    pub max_concurrent_region_queries: usize,
    /// Name given to instances the backend reports without one.
    pub default_display_name: String,
}

impl Default for InventoryOptions {
    fn default() -> Self {
        Self {
            max_concurrent_region_queries: 0,
            default_display_name: DEFAULT_INSTANCE_DISPLAY_NAME.to_owned(),
        }
    }
}

/// Owns the merged instance collection.
#[derive(Debug)]
pub struct InstanceInventory<B> {
    backend: Arc<B>,
    catalog: Arc<RegionCatalog<B>>,
    state: watch::Sender<InventorySnapshot>,
    liveness: Liveness,
    options: InventoryOptions,
}

impl<B: Backend> InstanceInventory<B> {
    /// Creates an empty inventory over the catalog's regions.
    #[must_use]
    pub fn new(
        backend: Arc<B>,
        catalog: Arc<RegionCatalog<B>>,
        liveness: Liveness,
        options: InventoryOptions,
    ) -> Self {
        let (state, _) = watch::channel(InventorySnapshot::default());
        Self {
            backend,
            catalog,
            state,
            liveness,
            options,
        }
    }

    /// Lists every known region in parallel and merges the answers.
    ///
    /// Failing regions are logged and contribute no instances. Placeholders
    /// survive the refresh and follow the refreshed entries.
    pub async fn refresh(&self) -> RefreshReport {
        let regions: Vec<String> = self
            .catalog
            .regions()
            .into_iter()
            .map(|region| region.code)
            .collect();
        let limit = match self.options.max_concurrent_region_queries {
            0 => regions.len().max(1),
            cap => cap,
        };
        let _in_flight = RefreshInFlight::begin(&self.state);
        debug!(regions = regions.len(), limit, "refreshing instances");

        let answers: Vec<(String, Result<Vec<InstanceRecord>, String>)> =
            stream::iter(regions)
                .map(|region| async move {
                    let outcome = self
                        .backend
                        .list_instances(&region)
                        .await
                        .map_err(|err| err.to_string());
                    (region, outcome)
                })
                .buffered(limit)
                .collect()
                .await;

        let report = self.merge(answers);
        if self.liveness.is_alive() {
            self.apply_refresh(&report);
        } else {
            debug!("discarding refresh result after teardown");
        }
        report
    }

    fn merge(&self, answers: Vec<(String, Result<Vec<InstanceRecord>, String>)>) -> RefreshReport {
        let mut report = RefreshReport::default();
        for (region, outcome) in answers {
            match outcome {
                Ok(records) => {
                    for record in records {
                        let instance = Instance::from_record(
                            record,
                            &region,
                            &self.options.default_display_name,
                        );
                        if report.instances.iter().all(|known| known.id != instance.id) {
                            report.instances.push(instance);
                        }
                    }
                }
                Err(message) => {
                    warn!(region = %region, error = %message, "instance listing failed");
                    report.failed_regions.push(RegionFailure { region, message });
                }
            }
        }
        report
    }

    fn apply_refresh(&self, report: &RefreshReport) {
        let failed: Vec<String> = report
            .failed_regions
            .iter()
            .map(|failure| failure.region.clone())
            .collect();
        info!(
            instances = report.instances.len(),
            failed_regions = failed.len(),
            "inventory refreshed"
        );
        self.state.send_modify(|snapshot| {
            let pending: Vec<InventoryEntry> = snapshot
                .entries
                .drain(..)
                .filter(InventoryEntry::is_pending)
                .collect();
            snapshot.entries = report
                .instances
                .iter()
                .cloned()
                .map(InventoryEntry::Confirmed)
                .chain(pending)
                .collect();
            snapshot.revision += 1;
            snapshot.last_error = if failed.is_empty() {
                None
            } else {
                Some(InventoryError::PartialRefresh {
                    regions: failed.clone(),
                })
            };
            snapshot.failed_regions = failed;
        });
    }

    /// Inserts a placeholder for a new instance in `region`.
    ///
    /// The returned ticket issues the backend call when confirmed. Dropping it
    /// unsettled removes the placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::EmptyRegion`] for a blank region and
    /// [`InventoryError::UnknownRegion`] when the catalog is loaded and does
    /// not list the region.
    pub fn spawn(&self, region: &str) -> Result<SpawnTicket<'_, B>, InventoryError> {
        let region = region.trim();
        if region.is_empty() {
            return Err(InventoryError::EmptyRegion);
        }
        if self.catalog.status() == CatalogStatus::Ready && !self.catalog.contains(region) {
            return Err(InventoryError::UnknownRegion {
                region: region.to_owned(),
            });
        }

        let placeholder = Placeholder::new(region, &self.options.default_display_name);
        debug!(region = %region, temp_id = %placeholder.temp_id, "inserting placeholder");
        self.state.send_modify(|snapshot| {
            snapshot
                .entries
                .push(InventoryEntry::Pending(placeholder.clone()));
            snapshot.revision += 1;
        });

        Ok(SpawnTicket {
            inventory: self,
            placeholder,
            settled: false,
        })
    }

    /// Spawns an instance and waits for the backend to confirm it.
    ///
    /// # Errors
    ///
    /// Returns the validation errors of [`InstanceInventory::spawn`] and
    /// [`InventoryError::Spawn`] when the backend call fails.
    pub async fn spawn_and_confirm(&self, region: &str) -> Result<Instance, InventoryError> {
        self.spawn(region)?.confirm().await
    }

    fn settle_spawn(
        &self,
        placeholder: &Placeholder,
        outcome: Result<SpawnedInstance, String>,
    ) -> Result<Instance, InventoryError> {
        let alive = self.liveness.is_alive();
        match outcome {
            Ok(spawned) => {
                let instance = Instance::from_spawned(spawned, &placeholder.display_name);
                info!(
                    instance_id = %instance.id,
                    region = %instance.region,
                    "spawn confirmed"
                );
                if alive {
                    self.state.send_modify(|snapshot| {
                        reconcile_spawn(&mut snapshot.entries, &placeholder.temp_id, &instance);
                        snapshot.revision += 1;
                    });
                }
                Ok(instance)
            }
            Err(message) => {
                warn!(region = %placeholder.region, error = %message, "spawn failed");
                let error = InventoryError::Spawn {
                    region: placeholder.region.clone(),
                    message,
                };
                if alive {
                    self.state.send_modify(|snapshot| {
                        snapshot
                            .entries
                            .retain(|entry| entry.id() != placeholder.temp_id);
                        snapshot.revision += 1;
                        snapshot.last_error = Some(error.clone());
                    });
                }
                Err(error)
            }
        }
    }

    fn discard_placeholder(&self, temp_id: &str) {
        if !self.liveness.is_alive() {
            return;
        }
        let removed = self.state.send_if_modified(|snapshot| {
            let before = snapshot.entries.len();
            snapshot.entries.retain(|entry| {
                !matches!(entry, InventoryEntry::Pending(placeholder) if placeholder.temp_id == temp_id)
            });
            let changed = snapshot.entries.len() != before;
            if changed {
                snapshot.revision += 1;
            }
            changed
        });
        if removed {
            debug!(temp_id = %temp_id, "discarded unsettled placeholder");
        }
    }

    /// Terminates a confirmed instance.
    ///
    /// The entry reads [`LifecycleState::Terminating`] while the call is in
    /// flight and is removed once the backend confirms.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::UnknownInstance`] or
    /// [`InventoryError::PendingInstance`] without calling the backend, and
    /// [`InventoryError::Terminate`] when the backend call fails.
    pub async fn terminate(&self, instance_id: &str) -> Result<(), InventoryError> {
        let mut target = Err(InventoryError::UnknownInstance {
            instance_id: instance_id.to_owned(),
        });
        self.state.send_if_modified(|snapshot| {
            match snapshot
                .entries
                .iter_mut()
                .find(|entry| entry.id() == instance_id)
            {
                None => false,
                Some(InventoryEntry::Pending(_)) => {
                    target = Err(InventoryError::PendingInstance {
                        instance_id: instance_id.to_owned(),
                    });
                    false
                }
                Some(InventoryEntry::Confirmed(instance)) => {
                    target = Ok((instance.region.clone(), instance.lifecycle_state));
                    instance.lifecycle_state = LifecycleState::Terminating;
                    snapshot.revision += 1;
                    true
                }
            }
        });
        let (region, previous) = target?;
        debug!(instance_id = %instance_id, region = %region, "terminating instance");

        let outcome = self
            .backend
            .terminate_instance(instance_id, &region)
            .await
            .map_err(|err| err.to_string());
        let alive = self.liveness.is_alive();

        match outcome {
            Ok(()) => {
                info!(instance_id = %instance_id, "instance terminated");
                if alive {
                    self.state.send_if_modified(|snapshot| {
                        let before = snapshot.entries.len();
                        snapshot.entries.retain(|entry| entry.id() != instance_id);
                        let changed = snapshot.entries.len() != before;
                        if changed {
                            snapshot.revision += 1;
                        }
                        changed
                    });
                }
                Ok(())
            }
            Err(message) => {
                warn!(instance_id = %instance_id, error = %message, "terminate failed");
                let error = InventoryError::Terminate {
                    instance_id: instance_id.to_owned(),
                    message,
                };
                if alive {
                    self.state.send_modify(|snapshot| {
                        let restored = snapshot.entries.iter_mut().find_map(|entry| match entry {
                            InventoryEntry::Confirmed(instance)
                                if instance.id == instance_id
                                    && instance.lifecycle_state == LifecycleState::Terminating =>
                            {
                                Some(instance)
                            }
                            _ => None,
                        });
                        if let Some(instance) = restored {
                            instance.lifecycle_state = previous;
                            snapshot.revision += 1;
                        }
                        snapshot.last_error = Some(error.clone());
                    });
                }
                Err(error)
            }
        }
    }

    /// Inserts or replaces a confirmed instance by identifier.
    pub fn insert(&self, instance: Instance) {
        self.state.send_modify(|snapshot| {
            let slot = snapshot
                .entries
                .iter_mut()
                .find(|entry| entry.id() == instance.id);
            match slot {
                Some(entry) => *entry = InventoryEntry::Confirmed(instance),
                None => snapshot.entries.push(InventoryEntry::Confirmed(instance)),
            }
            snapshot.revision += 1;
        });
    }

    /// Removes the entry carrying `id`, returning it when present.
    pub fn remove(&self, id: &str) -> Option<InventoryEntry> {
        let mut removed = None;
        self.state.send_if_modified(|snapshot| {
            let index = snapshot.entries.iter().position(|entry| entry.id() == id);
            if let Some(index) = index {
                removed = Some(snapshot.entries.remove(index));
                snapshot.revision += 1;
                true
            } else {
                false
            }
        });
        removed
    }

    /// Instance view of every entry.
    #[must_use]
    pub fn instances(&self) -> Vec<Instance> {
        self.state.borrow().instances()
    }

    /// Looks up a confirmed instance.
    #[must_use]
    pub fn find(&self, instance_id: &str) -> Option<Instance> {
        self.state.borrow().find_confirmed(instance_id).cloned()
    }

    /// Current revision counter.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.state.borrow().revision
    }

    /// Copy of the read model.
    #[must_use]
    pub fn snapshot(&self) -> InventorySnapshot {
        self.state.borrow().clone()
    }

    /// Subscribes to read model changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<InventorySnapshot> {
        self.state.subscribe()
    }
}

fn reconcile_spawn(entries: &mut Vec<InventoryEntry>, temp_id: &str, instance: &Instance) {
    let existing = entries.iter().position(
        |entry| matches!(entry, InventoryEntry::Confirmed(known) if known.id == instance.id),
    );
    let slot = entries.iter().position(
        |entry| matches!(entry, InventoryEntry::Pending(placeholder) if placeholder.temp_id == temp_id),
    );
    let confirmed = InventoryEntry::Confirmed(instance.clone());
    match (existing, slot) {
        (Some(index), slot) => {
            if let Some(entry) = entries.get_mut(index) {
                *entry = confirmed;
            }
            if let Some(slot) = slot {
                entries.remove(slot);
            }
        }
        (None, Some(slot)) => {
            if let Some(entry) = entries.get_mut(slot) {
                *entry = confirmed;
            }
        }
        (None, None) => entries.push(confirmed),
    }
}

/// Counts one outstanding refresh until dropped, so the refreshing flag
/// settles on every exit path.
struct RefreshInFlight<'a> {
    state: &'a watch::Sender<InventorySnapshot>,
}

impl<'a> RefreshInFlight<'a> {
    fn begin(state: &'a watch::Sender<InventorySnapshot>) -> Self {
        state.send_modify(|snapshot| {
            snapshot.refreshes_in_flight += 1;
            snapshot.refreshing = true;
        });
        Self { state }
    }
}

impl Drop for RefreshInFlight<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|snapshot| {
            snapshot.refreshes_in_flight = snapshot.refreshes_in_flight.saturating_sub(1);
            snapshot.refreshing = snapshot.refreshes_in_flight > 0;
        });
    }
}

/// Outstanding spawn created by [`InstanceInventory::spawn`].
#[must_use = "dropping an unconfirmed ticket removes its placeholder"]
#[derive(Debug)]
pub struct SpawnTicket<'a, B: Backend> {
    inventory: &'a InstanceInventory<B>,
    placeholder: Placeholder,
    settled: bool,
}

impl<B: Backend> SpawnTicket<'_, B> {
    /// Placeholder inserted for this spawn.
    #[must_use]
    pub const fn placeholder(&self) -> &Placeholder {
        &self.placeholder
    }

    /// Issues the create call and reconciles the placeholder with its answer.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Spawn`] when the backend call fails; the
    /// placeholder is removed.
    pub async fn confirm(mut self) -> Result<Instance, InventoryError> {
        let outcome = self
            .inventory
            .backend
            .spawn_instance(&self.placeholder.region)
            .await
            .map_err(|err| err.to_string());
        self.settled = true;
        self.inventory.settle_spawn(&self.placeholder, outcome)
    }
}

impl<B: Backend> Drop for SpawnTicket<'_, B> {
    fn drop(&mut self) {
        if !self.settled {
            self.inventory.discard_placeholder(&self.placeholder.temp_id);
        }
    }
}

#[cfg(test)]
mod tests;
