//! Wiring of the catalog, inventory, session tracker, and metrics stream.
//!
//! [`Synchronizer`] owns one instance of each component, translates user
//! commands into component calls, posts notices for their outcomes, and runs
//! the background loops that keep the session and metrics current.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, Credentials};
use crate::config::ClientConfig;
use crate::inventory::{
    Instance, InstanceInventory, InventoryError, InventoryOptions, RefreshReport, SpawnTicket,
};
use crate::liveness::Liveness;
use crate::metrics::{Metrics, MetricsError, MetricsStream, StreamStatus};
use crate::notice::{Notice, NoticeBoard, NoticeKind, Severity};
use crate::region::{CatalogError, CatalogStatus, Region, RegionCatalog, RegionGroup};
use crate::session::{SessionError, SessionPhase, VpnSession, VpnSessionTracker};

/// Errors returned by [`Synchronizer`] commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SynchronizerError {
    /// Region discovery failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// An inventory operation failed.
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    /// A session operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The metrics subscription failed.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    /// The backend refused the credentials.
    #[error("failed to save credentials: {message}")]
    Credentials {
        /// Backend error message.
        message: String,
    },
}

/// Runtime settings for [`Synchronizer`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SynchronizerOptions {
    /// Interval of the status reconciliation loop.
    pub status_poll_interval: Duration,
    /// Inventory tuning.
    pub inventory: InventoryOptions,
}

impl Default for SynchronizerOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for SynchronizerOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            status_poll_interval: config.status_poll_interval(),
            inventory: InventoryOptions {
                max_concurrent_region_queries: config.max_concurrent_region_queries,
                default_display_name: config.instance_display_name.clone(),
            },
        }
    }
}

/// Outcome of [`Synchronizer::bootstrap`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapReport {
    /// Regions loaded.
    pub regions: usize,
    /// Confirmed instances found.
    pub instances: usize,
    /// Regions whose listing failed.
    pub failed_regions: Vec<String>,
    /// Session after the initial status query.
    pub session: VpnSession,
}

/// Combined read model for a dashboard.
#[derive(Clone, Debug, PartialEq)]
pub struct DashboardView {
    /// Regions grouped by continent.
    pub region_groups: Vec<RegionGroup>,
    /// Region discovery state.
    pub catalog_status: CatalogStatus,
    /// Inventory entries, placeholders last.
    pub instances: Vec<Instance>,
    /// `true` while a refresh is outstanding.
    pub refreshing: bool,
    /// Regions that failed in the last refresh.
    pub failed_regions: Vec<String>,
    /// Current session.
    pub session: VpnSession,
    /// Display phase of the session.
    pub phase: SessionPhase,
    /// Latest counters; always `None` unless connected.
    pub metrics: Option<Metrics>,
    /// Active notices.
    pub notices: Vec<Notice>,
}

/// Client-side state synchroniser.
#[derive(Debug)]
pub struct Synchronizer<B> {
    backend: Arc<B>,
    catalog: Arc<RegionCatalog<B>>,
    inventory: Arc<InstanceInventory<B>>,
    session: Arc<VpnSessionTracker<B>>,
    metrics: Arc<MetricsStream<B>>,
    notices: Arc<NoticeBoard>,
    liveness: Liveness,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    options: SynchronizerOptions,
}

impl<B: Backend + 'static> Synchronizer<B> {
    /// Wires the components over `backend`.
    #[must_use]
    pub fn new(backend: Arc<B>, options: SynchronizerOptions) -> Self {
        let liveness = Liveness::new();
        let catalog = Arc::new(RegionCatalog::new(Arc::clone(&backend), liveness.clone()));
        let inventory = Arc::new(InstanceInventory::new(
            Arc::clone(&backend),
            Arc::clone(&catalog),
            liveness.clone(),
            options.inventory.clone(),
        ));
        let session = Arc::new(VpnSessionTracker::new(
            Arc::clone(&backend),
            Arc::clone(&inventory),
            liveness.clone(),
        ));
        let metrics = Arc::new(MetricsStream::new(Arc::clone(&backend), liveness.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            backend,
            catalog,
            inventory,
            session,
            metrics,
            notices: Arc::new(NoticeBoard::new()),
            liveness,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            options,
        }
    }

    fn tasks_lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post_error(&self, kind: NoticeKind, err: &impl std::fmt::Display) {
        self.notices.post(Severity::Error, kind, err.to_string());
    }

    /// Loads regions, refreshes the inventory, and queries the session.
    ///
    /// # Errors
    ///
    /// Returns [`SynchronizerError::Catalog`] when region discovery fails;
    /// nothing else is attempted in that case.
    pub async fn bootstrap(&self) -> Result<BootstrapReport, SynchronizerError> {
        let regions = self.reload_regions().await?;
        let refresh = self.refresh().await;
        let session = match self.session.query_status().await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "initial status query failed");
                self.session.session()
            }
        };
        let report = BootstrapReport {
            regions: regions.len(),
            instances: refresh.instances.len(),
            failed_regions: refresh
                .failed_regions
                .into_iter()
                .map(|failure| failure.region)
                .collect(),
            session,
        };
        info!(
            regions = report.regions,
            instances = report.instances,
            "bootstrap complete"
        );
        Ok(report)
    }

    /// Starts the reconciliation loop, the metrics follower, and the
    /// subscription notice watcher. Calling it again has no effect.
    pub fn start(&self) {
        let mut tasks = self.tasks_lock();
        if !tasks.is_empty() {
            return;
        }

        let session = Arc::clone(&self.session);
        let interval = self.options.status_poll_interval;
        let stop_polling = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            session.reconcile_until(interval, stop_polling).await;
        }));

        let metrics = Arc::clone(&self.metrics);
        let sessions = self.session.subscribe();
        let stop_following = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            metrics.follow(sessions, stop_following).await;
        }));

        let notices = Arc::clone(&self.notices);
        let mut streams = self.metrics.subscribe();
        let mut stop_watching = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut reported = false;
            loop {
                tokio::select! {
                    changed = streams.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = stop_watching.changed() => break,
                }
                let status = streams.borrow_and_update().status.clone();
                match status {
                    StreamStatus::Unavailable(message) if !reported => {
                        notices.post(Severity::Error, NoticeKind::Subscription, message);
                        reported = true;
                    }
                    StreamStatus::Unavailable(_) => {}
                    _ => reported = false,
                }
            }
        }));
        debug!("background tasks started");
    }

    /// Stops the background tasks and drops the metrics subscription. Results
    /// of calls still in flight are not applied.
    pub async fn shutdown(&self) {
        self.liveness.retire();
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks_lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        self.metrics.deactivate().await;
        info!("synchronizer shut down");
    }

    /// Reloads the region catalog.
    ///
    /// # Errors
    ///
    /// Returns [`SynchronizerError::Catalog`] and posts a notice on failure.
    pub async fn reload_regions(&self) -> Result<Vec<Region>, SynchronizerError> {
        self.catalog.load_regions().await.map_err(|err| {
            self.post_error(NoticeKind::RegionLoad, &err);
            SynchronizerError::from(err)
        })
    }

    /// Refreshes the inventory, posting a warning when regions failed.
    pub async fn refresh(&self) -> RefreshReport {
        let report = self.inventory.refresh().await;
        if !report.is_complete() {
            let regions: Vec<&str> = report
                .failed_regions
                .iter()
                .map(|failure| failure.region.as_str())
                .collect();
            self.notices.post(
                Severity::Warning,
                NoticeKind::PartialInventory,
                format!("Could not list instances in {}", regions.join(", ")),
            );
        }
        report
    }

    /// Spawns an instance and waits for the backend to confirm it.
    ///
    /// # Errors
    ///
    /// Returns [`SynchronizerError::Inventory`] and posts a notice on failure.
    pub async fn spawn(&self, region: &str) -> Result<Instance, SynchronizerError> {
        match self.inventory.spawn_and_confirm(region).await {
            Ok(instance) => {
                self.notices.post(
                    Severity::Info,
                    NoticeKind::Spawn,
                    format!("Spawned {} in {}", instance.id, instance.region),
                );
                Ok(instance)
            }
            Err(err) => {
                self.post_error(NoticeKind::Spawn, &err);
                Err(err.into())
            }
        }
    }

    /// Inserts a placeholder and hands back the ticket that confirms it.
    ///
    /// # Errors
    ///
    /// Returns [`SynchronizerError::Inventory`] when the region is rejected.
    pub fn begin_spawn(&self, region: &str) -> Result<SpawnTicket<'_, B>, SynchronizerError> {
        Ok(self.inventory.spawn(region)?)
    }

    /// Terminates an instance. A session connected to it stops reporting it
    /// as resolved once it is gone.
    ///
    /// # Errors
    ///
    /// Returns [`SynchronizerError::Inventory`] and posts a notice on failure.
    pub async fn terminate(&self, instance_id: &str) -> Result<(), SynchronizerError> {
        match self.inventory.terminate(instance_id).await {
            Ok(()) => {
                self.session.reconcile_with_inventory();
                self.notices.post(
                    Severity::Info,
                    NoticeKind::Terminate,
                    format!("Terminated {instance_id}"),
                );
                Ok(())
            }
            Err(err) => {
                self.post_error(NoticeKind::Terminate, &err);
                Err(err.into())
            }
        }
    }

    /// Connects to the inventory entry carrying `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SynchronizerError::Inventory`] for unknown ids and
    /// [`SynchronizerError::Session`] when the tracker rejects or fails the
    /// call. Failures post a notice.
    pub async fn connect(&self, instance_id: &str) -> Result<VpnSession, SynchronizerError> {
        let outcome = match self
            .inventory
            .instances()
            .into_iter()
            .find(|instance| instance.id == instance_id)
        {
            Some(instance) => self
                .session
                .connect(&instance)
                .await
                .map_err(SynchronizerError::from),
            None => Err(SynchronizerError::from(InventoryError::UnknownInstance {
                instance_id: instance_id.to_owned(),
            })),
        };
        match outcome {
            Ok(session) => {
                self.notices.post(
                    Severity::Info,
                    NoticeKind::Connect,
                    format!("Connected to {instance_id}"),
                );
                Ok(session)
            }
            Err(err) => {
                self.post_error(NoticeKind::Connect, &err);
                Err(err)
            }
        }
    }

    /// Disconnects and discards the metrics immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SynchronizerError::Session`] and posts a notice when the
    /// backend call fails; the session is cleared either way.
    pub async fn disconnect(&self) -> Result<(), SynchronizerError> {
        let outcome = self.session.disconnect().await;
        self.metrics.deactivate().await;
        match outcome {
            Ok(()) => {
                self.notices
                    .post(Severity::Info, NoticeKind::Disconnect, "Disconnected");
                Ok(())
            }
            Err(err) => {
                self.post_error(NoticeKind::Disconnect, &err);
                Err(err.into())
            }
        }
    }

    /// Stores credentials and, on success, reloads regions and instances.
    ///
    /// # Errors
    ///
    /// Returns [`SynchronizerError::Credentials`] when the backend refuses
    /// them, or the errors of [`Synchronizer::bootstrap`].
    pub async fn save_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<BootstrapReport, SynchronizerError> {
        if let Err(err) = self.backend.save_credentials(credentials).await {
            let error = SynchronizerError::Credentials {
                message: err.to_string(),
            };
            warn!(provider = %credentials.provider, error = %error, "credentials rejected");
            self.post_error(NoticeKind::Credentials, &error);
            return Err(error);
        }
        self.notices.post(
            Severity::Info,
            NoticeKind::Credentials,
            format!("Saved {} credentials", credentials.provider),
        );
        self.bootstrap().await
    }

    /// Builds the combined read model.
    #[must_use]
    pub fn view(&self) -> DashboardView {
        let catalog = self.catalog.snapshot();
        let inventory = self.inventory.snapshot();
        let session = self.session.snapshot();
        let metrics = if session.session.is_connected() {
            self.metrics.metrics()
        } else {
            None
        };
        DashboardView {
            region_groups: catalog.groups,
            catalog_status: catalog.status,
            instances: inventory.instances(),
            refreshing: inventory.refreshing,
            failed_regions: inventory.failed_regions,
            phase: session.phase(),
            session: session.session,
            metrics,
            notices: self.notices.active(),
        }
    }

    /// Region catalog.
    #[must_use]
    pub const fn catalog(&self) -> &Arc<RegionCatalog<B>> {
        &self.catalog
    }

    /// Instance inventory.
    #[must_use]
    pub const fn inventory(&self) -> &Arc<InstanceInventory<B>> {
        &self.inventory
    }

    /// Session tracker.
    #[must_use]
    pub const fn session(&self) -> &Arc<VpnSessionTracker<B>> {
        &self.session
    }

    /// Metrics stream.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<MetricsStream<B>> {
        &self.metrics
    }

    /// Notice board.
    #[must_use]
    pub const fn notices(&self) -> &Arc<NoticeBoard> {
        &self.notices
    }
}

impl<B> Drop for Synchronizer<B> {
    fn drop(&mut self) {
        self.liveness.retire();
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests;
