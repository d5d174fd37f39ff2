//! VPN session tracking and status reconciliation.
//!
//! The backend holds at most one tunnel, so the tracker keeps a single
//! [`VpnSession`] value. Every status answer is resolved against the
//! inventory by instance id. Answers to queries that started before the last
//! connect or disconnect are discarded.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::{Backend, VpnStatusRecord};
use crate::inventory::{Instance, InstanceInventory, LifecycleState};
use crate::liveness::Liveness;

/// Identifier shown when the backend reports a tunnel without naming its
/// instance.
pub const UNKNOWN_INSTANCE_ID: &str = "unknown";

/// Current tunnel as seen by this client.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum VpnSession {
    /// No tunnel.
    #[default]
    Disconnected,
    /// Tunnel open to `instance`.
    Connected {
        /// Instance the tunnel terminates on.
        instance: Instance,
        /// `false` when the instance was not found in the inventory and only
        /// carries what the backend reported.
        resolved: bool,
    },
}

impl VpnSession {
    /// Returns `true` for [`VpnSession::Connected`].
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Connected instance, if any.
    #[must_use]
    pub const fn instance(&self) -> Option<&Instance> {
        match self {
            Self::Connected { instance, .. } => Some(instance),
            Self::Disconnected => None,
        }
    }
}

/// Display state derived from the tracker's read model.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionPhase {
    /// No tunnel and no error.
    Disconnected,
    /// A connect call is outstanding.
    Connecting,
    /// Tunnel open.
    Connected,
    /// The last operation failed.
    Error,
}

/// Errors surfaced by [`VpnSessionTracker`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// The connect call failed; the session is unchanged.
    #[error("failed to connect to {instance_id}: {message}")]
    Connect {
        /// Target instance.
        instance_id: String,
        /// Backend error message.
        message: String,
    },
    /// The disconnect call failed; the session was still cleared locally.
    #[error("failed to disconnect: {message}")]
    Disconnect {
        /// Backend error message.
        message: String,
    },
    /// The status query failed.
    #[error("failed to query VPN status: {message}")]
    Status {
        /// Backend error message.
        message: String,
    },
    /// The instance cannot be used as a tunnel endpoint.
    #[error("cannot connect to {instance_id}: {reason}")]
    NotConnectable {
        /// Rejected instance.
        instance_id: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Another connect call is still outstanding.
    #[error("already connecting to {instance_id}")]
    ConnectInProgress {
        /// Instance the outstanding call targets.
        instance_id: String,
    },
}

/// Read model published by [`VpnSessionTracker`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SessionSnapshot {
    /// Current session.
    pub session: VpnSession,
    /// Instance targeted by an outstanding connect call.
    pub connecting: Option<String>,
    /// Most recent error; cleared by the next successful query or connect.
    pub last_error: Option<SessionError>,
    /// Bumped by connect and disconnect; status answers from an older epoch
    /// are discarded.
    pub epoch: u64,
}

impl SessionSnapshot {
    /// Derives the display phase.
    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        if self.connecting.is_some() {
            SessionPhase::Connecting
        } else if self.last_error.is_some() {
            SessionPhase::Error
        } else if self.session.is_connected() {
            SessionPhase::Connected
        } else {
            SessionPhase::Disconnected
        }
    }
}

/// Tracks the single VPN session.
#[derive(Debug)]
pub struct VpnSessionTracker<B> {
    backend: Arc<B>,
    inventory: Arc<InstanceInventory<B>>,
    state: watch::Sender<SessionSnapshot>,
    liveness: Liveness,
}

impl<B: Backend> VpnSessionTracker<B> {
    /// Creates a disconnected tracker.
    #[must_use]
    pub fn new(backend: Arc<B>, inventory: Arc<InstanceInventory<B>>, liveness: Liveness) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            backend,
            inventory,
            state,
            liveness,
        }
    }

    fn resolve(&self, record: VpnStatusRecord) -> VpnSession {
        if !record.connected {
            return VpnSession::Disconnected;
        }
        let Some(instance_id) = record
            .instance_id
            .filter(|instance_id| !instance_id.trim().is_empty())
        else {
            warn!("backend reported a tunnel without an instance id");
            return VpnSession::Connected {
                instance: Instance {
                    display_name: UNKNOWN_INSTANCE_ID.to_owned(),
                    id: UNKNOWN_INSTANCE_ID.to_owned(),
                    lifecycle_state: LifecycleState::Running,
                    public_ip_v4: record.public_ip_v4.unwrap_or_default(),
                    public_ip_v6: record.public_ip_v6,
                    region: String::new(),
                },
                resolved: false,
            };
        };
        match self.inventory.find(&instance_id) {
            Some(instance) => VpnSession::Connected {
                instance,
                resolved: true,
            },
            None => VpnSession::Connected {
                instance: Instance {
                    display_name: instance_id.clone(),
                    id: instance_id,
                    lifecycle_state: LifecycleState::Running,
                    public_ip_v4: record.public_ip_v4.unwrap_or_default(),
                    public_ip_v6: record.public_ip_v6,
                    region: String::new(),
                },
                resolved: false,
            },
        }
    }

    /// Asks the backend for the tunnel status and resolves it against the
    /// inventory.
    ///
    /// An answer that arrives after a connect or disconnect started is
    /// discarded and the current session returned instead.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Status`] when the backend call fails.
    pub async fn query_status(&self) -> Result<VpnSession, SessionError> {
        let started = self.state.borrow().epoch;
        let outcome = self
            .backend
            .vpn_status()
            .await
            .map_err(|err| err.to_string());
        if !self.liveness.is_alive() {
            debug!("discarding status answer after teardown");
            return outcome
                .map(|_| self.session())
                .map_err(|message| SessionError::Status { message });
        }

        match outcome {
            Ok(record) => {
                let session = self.resolve(record);
                let mut stale = false;
                self.state.send_if_modified(|snapshot| {
                    if snapshot.epoch != started {
                        stale = true;
                        return false;
                    }
                    let changed = snapshot.session != session || snapshot.last_error.is_some();
                    snapshot.session = session.clone();
                    snapshot.last_error = None;
                    changed
                });
                if stale {
                    debug!("discarding stale status answer");
                    return Ok(self.session());
                }
                Ok(session)
            }
            Err(message) => {
                let error = SessionError::Status { message };
                debug!(error = %error, "status query failed");
                self.state.send_if_modified(|snapshot| {
                    if snapshot.epoch != started {
                        return false;
                    }
                    snapshot.last_error = Some(error.clone());
                    true
                });
                Err(error)
            }
        }
    }

    /// Re-resolves the current session against the inventory without asking
    /// the backend.
    pub fn reconcile_with_inventory(&self) {
        self.state.send_if_modified(|snapshot| {
            let VpnSession::Connected { instance, resolved } = &snapshot.session else {
                return false;
            };
            let updated = self.inventory.find(&instance.id).map_or_else(
                || VpnSession::Connected {
                    instance: instance.clone(),
                    resolved: false,
                },
                |found| VpnSession::Connected {
                    instance: found,
                    resolved: true,
                },
            );
            if !*resolved && !updated_is_resolved(&updated) {
                return false;
            }
            let changed = snapshot.session != updated;
            snapshot.session = updated;
            changed
        });
    }

    /// Opens a tunnel to `instance` and re-queries the status on success.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnectable`] for placeholders and
    /// instances without a region, [`SessionError::ConnectInProgress`] while
    /// another connect is outstanding, [`SessionError::Connect`] when the
    /// backend call fails, and [`SessionError::Status`] when the follow-up
    /// query fails.
    pub async fn connect(&self, instance: &Instance) -> Result<VpnSession, SessionError> {
        instance
            .ensure_connectable()
            .map_err(|err| SessionError::NotConnectable {
                instance_id: instance.id.clone(),
                reason: err.to_string(),
            })?;

        let mut busy = None;
        self.state.send_if_modified(|snapshot| {
            if let Some(current) = &snapshot.connecting {
                busy = Some(current.clone());
                return false;
            }
            snapshot.connecting = Some(instance.id.clone());
            snapshot.epoch += 1;
            true
        });
        if let Some(instance_id) = busy {
            return Err(SessionError::ConnectInProgress { instance_id });
        }

        debug!(instance_id = %instance.id, region = %instance.region, "connecting");
        let outcome = self
            .backend
            .connect(&instance.id, &instance.region)
            .await
            .map_err(|err| err.to_string());
        let alive = self.liveness.is_alive();

        match outcome {
            Ok(()) => {
                info!(instance_id = %instance.id, "tunnel opened");
                if alive {
                    self.state.send_modify(|snapshot| {
                        snapshot.connecting = None;
                        snapshot.last_error = None;
                        snapshot.epoch += 1;
                    });
                }
                self.query_status().await
            }
            Err(message) => {
                warn!(instance_id = %instance.id, error = %message, "connect failed");
                let error = SessionError::Connect {
                    instance_id: instance.id.clone(),
                    message,
                };
                if alive {
                    self.state.send_modify(|snapshot| {
                        snapshot.connecting = None;
                        snapshot.last_error = Some(error.clone());
                    });
                }
                Err(error)
            }
        }
    }

    /// Closes the tunnel. The local session becomes
    /// [`VpnSession::Disconnected`] whatever the backend answers.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Disconnect`] when the backend call fails.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let outcome = self
            .backend
            .disconnect()
            .await
            .map_err(|err| SessionError::Disconnect {
                message: err.to_string(),
            });
        match &outcome {
            Ok(()) => info!("tunnel closed"),
            Err(err) => warn!(error = %err, "disconnect failed; clearing session anyway"),
        }
        if self.liveness.is_alive() {
            self.state.send_modify(|snapshot| {
                snapshot.session = VpnSession::Disconnected;
                snapshot.connecting = None;
                snapshot.last_error = outcome.clone().err();
                snapshot.epoch += 1;
            });
        }
        outcome
    }

    /// Polls the status on `interval` and whenever the inventory revision
    /// changes, until `shutdown` flips or the liveness flag is retired.
    pub async fn reconcile_until(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inventory = self.inventory.subscribe();
        let mut seen_revision = inventory.borrow_and_update().revision;

        loop {
            if *shutdown.borrow() || !self.liveness.is_alive() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = inventory.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let revision = inventory.borrow_and_update().revision;
                    if revision == seen_revision {
                        continue;
                    }
                    seen_revision = revision;
                    self.reconcile_with_inventory();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(err) = self.query_status().await {
                debug!(error = %err, "reconciliation poll failed");
            }
        }
        debug!("session reconciliation stopped");
    }

    /// Current session.
    #[must_use]
    pub fn session(&self) -> VpnSession {
        self.state.borrow().session.clone()
    }

    /// Current display phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.state.borrow().phase()
    }

    /// Copy of the read model.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Subscribes to read model changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }
}

const fn updated_is_resolved(session: &VpnSession) -> bool {
    matches!(session, VpnSession::Connected { resolved: true, .. })
}
