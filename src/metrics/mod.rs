//! Live traffic metrics tied to the VPN session.
//!
//! At most one backend subscription is open at a time. Each activation gets a
//! fresh generation number and the pump task that forwards pushes into the
//! read model stops as soon as its generation is no longer current.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, MetricsRecord};
use crate::liveness::Liveness;
use crate::session::SessionSnapshot;

/// Status message used when the backend ends an open feed.
pub const FEED_CLOSED: &str = "metrics feed closed";

/// Traffic counters for the open tunnel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metrics {
    /// Bytes sent since the tunnel opened.
    pub bytes_sent: u64,
    /// Bytes received since the tunnel opened.
    pub bytes_received: u64,
    /// Packets sent since the tunnel opened.
    pub packets_sent: u64,
    /// Packets received since the tunnel opened.
    pub packets_received: u64,
    /// Upload rate in bytes per second, never negative.
    pub upload_rate: f64,
    /// Download rate in bytes per second, never negative.
    pub download_rate: f64,
}

fn clamp_rate(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 {
        rate
    } else {
        0.0
    }
}

impl From<MetricsRecord> for Metrics {
    fn from(record: MetricsRecord) -> Self {
        Self {
            bytes_sent: record.bytes_sent,
            bytes_received: record.bytes_received,
            packets_sent: record.packets_sent,
            packets_received: record.packets_received,
            upload_rate: clamp_rate(record.upload_rate),
            download_rate: clamp_rate(record.download_rate),
        }
    }
}

/// Subscription state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum StreamStatus {
    /// No subscription.
    #[default]
    Inactive,
    /// Subscribe call outstanding.
    Opening,
    /// Subscription open.
    Active,
    /// The last subscribe call failed or the backend ended the feed.
    Unavailable(String),
}

/// Read model published by [`MetricsStream`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Latest counters; absent while inactive.
    pub metrics: Option<Metrics>,
    /// Subscription state.
    pub status: StreamStatus,
    /// Generation of the current activation.
    pub generation: u64,
}

/// Errors surfaced by [`MetricsStream`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MetricsError {
    /// Opening the subscription failed.
    #[error("failed to subscribe to metrics: {message}")]
    Subscribe {
        /// Backend error message.
        message: String,
    },
}

#[derive(Debug)]
struct ActiveFeed {
    feed_id: String,
    pump: JoinHandle<()>,
}

#[derive(Debug)]
struct Shared<B> {
    backend: Arc<B>,
    state: watch::Sender<MetricsSnapshot>,
    active: Mutex<Option<ActiveFeed>>,
    liveness: Liveness,
}

impl<B> Shared<B> {
    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveFeed>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the metrics subscription and the latest counters.
#[derive(Debug)]
pub struct MetricsStream<B> {
    shared: Arc<Shared<B>>,
}

impl<B: Backend + 'static> MetricsStream<B> {
    /// Creates an inactive stream.
    #[must_use]
    pub fn new(backend: Arc<B>, liveness: Liveness) -> Self {
        let (state, _) = watch::channel(MetricsSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                backend,
                state,
                active: Mutex::new(None),
                liveness,
            }),
        }
    }

    /// Opens the subscription unless one is open or opening.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Subscribe`] when the backend refuses; the
    /// stream is left inactive with status [`StreamStatus::Unavailable`].
    pub async fn activate(&self) -> Result<(), MetricsError> {
        let mut opening = None;
        self.shared.state.send_if_modified(|snapshot| {
            if matches!(snapshot.status, StreamStatus::Opening | StreamStatus::Active) {
                return false;
            }
            snapshot.generation += 1;
            snapshot.status = StreamStatus::Opening;
            opening = Some(snapshot.generation);
            true
        });
        let Some(generation) = opening else {
            return Ok(());
        };

        match self.shared.backend.subscribe_metrics().await {
            Ok(feed) => {
                let feed_id = feed.id.clone();
                if self.install(generation, feed.id, feed.updates) {
                    info!(feed = %feed_id, generation, "metrics subscription open");
                } else {
                    debug!(feed = %feed_id, "closing subscription that opened after deactivation");
                    self.unsubscribe(&feed_id).await;
                }
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "metrics subscription failed");
                self.shared.state.send_if_modified(|snapshot| {
                    if snapshot.generation != generation {
                        return false;
                    }
                    snapshot.status = StreamStatus::Unavailable(message.clone());
                    snapshot.metrics = None;
                    true
                });
                Err(MetricsError::Subscribe { message })
            }
        }
    }

    fn install(
        &self,
        generation: u64,
        feed_id: String,
        updates: mpsc::Receiver<MetricsRecord>,
    ) -> bool {
        let mut active = self.shared.lock_active();
        if !self.shared.liveness.is_alive() {
            return false;
        }
        let current = self.shared.state.send_if_modified(|snapshot| {
            if snapshot.generation != generation || snapshot.status != StreamStatus::Opening {
                return false;
            }
            snapshot.status = StreamStatus::Active;
            true
        });
        if current {
            let pump = tokio::spawn(pump(Arc::clone(&self.shared), generation, updates));
            *active = Some(ActiveFeed { feed_id, pump });
        }
        current
    }

    async fn unsubscribe(&self, feed_id: &str) {
        match self.shared.backend.unsubscribe_metrics(feed_id).await {
            Ok(()) => debug!(feed = %feed_id, "metrics subscription closed"),
            Err(err) => warn!(feed = %feed_id, error = %err, "metrics unsubscribe failed"),
        }
    }

    /// Discards the counters and closes the subscription. Always succeeds
    /// locally; a failing unsubscribe is only logged.
    pub async fn deactivate(&self) {
        let taken = {
            let mut active = self.shared.lock_active();
            self.shared.state.send_if_modified(|snapshot| {
                snapshot.generation += 1;
                let changed = snapshot.status != StreamStatus::Inactive || snapshot.metrics.is_some();
                snapshot.status = StreamStatus::Inactive;
                snapshot.metrics = None;
                changed
            });
            active.take()
        };
        if let Some(feed) = taken {
            feed.pump.abort();
            self.unsubscribe(&feed.feed_id).await;
        }
    }

    /// Activates while `sessions` reports a connected session and deactivates
    /// otherwise, until `shutdown` flips.
    pub async fn follow(
        &self,
        mut sessions: watch::Receiver<SessionSnapshot>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() || !self.shared.liveness.is_alive() {
                break;
            }
            let connected = sessions.borrow_and_update().session.is_connected();
            if connected {
                if let Err(err) = self.activate().await {
                    debug!(error = %err, "metrics activation failed");
                }
            } else {
                self.deactivate().await;
            }
            tokio::select! {
                changed = sessions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        self.deactivate().await;
        debug!("metrics follower stopped");
    }

    /// Latest counters.
    #[must_use]
    pub fn metrics(&self) -> Option<Metrics> {
        self.shared.state.borrow().metrics.clone()
    }

    /// Subscription state.
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.shared.state.borrow().status.clone()
    }

    /// Copy of the read model.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.shared.state.borrow().clone()
    }

    /// Subscribes to read model changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MetricsSnapshot> {
        self.shared.state.subscribe()
    }
}

async fn pump<B>(
    shared: Arc<Shared<B>>,
    generation: u64,
    mut updates: mpsc::Receiver<MetricsRecord>,
) {
    loop {
        let Some(record) = updates.recv().await else {
            feed_closed(&shared, generation);
            break;
        };
        if !shared.liveness.is_alive() {
            break;
        }
        let metrics = Metrics::from(record);
        let current = shared.state.send_if_modified(|snapshot| {
            if snapshot.generation != generation || snapshot.status != StreamStatus::Active {
                return false;
            }
            snapshot.metrics = Some(metrics);
            true
        });
        if !current {
            debug!(generation, "dropping push from a stale subscription");
            break;
        }
    }
}

/// Marks the stream unavailable when the backend ends a feed that is still
/// current, so held counters are not shown as live.
fn feed_closed<B>(shared: &Shared<B>, generation: u64) {
    if !shared.liveness.is_alive() {
        return;
    }
    let closed = shared.state.send_if_modified(|snapshot| {
        if snapshot.generation != generation || snapshot.status != StreamStatus::Active {
            return false;
        }
        snapshot.status = StreamStatus::Unavailable(String::from(FEED_CLOSED));
        snapshot.metrics = None;
        true
    });
    if closed {
        warn!(generation, "metrics feed closed by the backend");
    }
}
