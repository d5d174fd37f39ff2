//! Backend abstraction for the remote command and event boundary.
//!
//! Everything the synchroniser knows about the outside world arrives through
//! [`Backend`]: region discovery, per-region instance listings, instance
//! creation and teardown, the single VPN session, and the metrics push
//! channel. Records in this module mirror the wire shapes returned by the
//! backend and are converted into domain types by the owning component.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Region as reported by `list_regions`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegionRecord {
    /// Provider specific region code (for example `us-east-1`).
    pub name: String,
    /// Country used for display.
    pub country: String,
}

/// Instance as reported by `list_instances`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceRecord {
    /// Provider instance identifier.
    pub id: String,
    /// Optional display name (the `Name` tag on most providers).
    #[serde(default)]
    pub name: Option<String>,
    /// Provider lifecycle state string (for example `running`).
    pub state: String,
    /// Public IPv4 address; empty when not yet assigned.
    #[serde(default)]
    pub public_ip_v4: String,
    /// Public IPv6 address; empty when not assigned.
    #[serde(default)]
    pub public_ip_v6: String,
    /// Region reported by the backend, when it includes one.
    #[serde(default)]
    pub region: Option<String>,
}

/// Result of a successful `spawn_instance` call.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SpawnedInstance {
    /// Backend assigned instance identifier.
    pub instance_id: String,
    /// Public IPv4 address of the new server.
    pub public_ip_v4: String,
    /// Public IPv6 address, when the provider assigned one.
    #[serde(default)]
    pub public_ip_v6: Option<String>,
    /// Region the instance was created in.
    pub region: String,
}

/// Result of `get_vpn_status`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VpnStatusRecord {
    /// Whether the backend VPN client currently holds a tunnel.
    pub connected: bool,
    /// Instance the tunnel terminates on, when connected.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Public IPv4 of the tunnel endpoint, when known.
    #[serde(default)]
    pub public_ip_v4: Option<String>,
    /// Public IPv6 of the tunnel endpoint, when known.
    #[serde(default)]
    pub public_ip_v6: Option<String>,
}

/// One push on the metrics channel.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct MetricsRecord {
    /// Bytes sent through the tunnel since it opened.
    pub bytes_sent: u64,
    /// Bytes received through the tunnel since it opened.
    pub bytes_received: u64,
    /// Packets sent through the tunnel since it opened.
    pub packets_sent: u64,
    /// Packets received through the tunnel since it opened.
    pub packets_received: u64,
    /// Instantaneous upload rate in bytes per second.
    pub upload_rate: f64,
    /// Instantaneous download rate in bytes per second.
    pub download_rate: f64,
}

/// Open metrics subscription handed out by [`Backend::subscribe_metrics`].
///
/// The backend pushes records into `updates` until the subscription is
/// closed through [`Backend::unsubscribe_metrics`] or the sender is dropped.
#[derive(Debug)]
pub struct MetricsFeed {
    /// Identifier used to close the subscription.
    pub id: String,
    /// Receiving half of the push channel.
    pub updates: mpsc::Receiver<MetricsRecord>,
}

/// Cloud credentials forwarded to the backend by the settings flow.
#[derive(Clone, Eq, PartialEq, Serialize)]
pub struct Credentials {
    /// Provider name (for example `aws`).
    #[serde(skip)]
    pub provider: String,
    /// Access key identifier.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
}

impl Credentials {
    /// Builds credentials, trimming surrounding whitespace from every field.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into().trim().to_owned(),
            access_key_id: access_key_id.into().trim().to_owned(),
            secret_access_key: secret_access_key.into().trim().to_owned(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("provider", &self.provider)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Remote operations the synchroniser depends on.
pub trait Backend: Send + Sync {
    /// Transport specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Lists the regions the configured account may deploy into.
    fn list_regions(&self) -> BackendFuture<'_, Vec<RegionRecord>, Self::Error>;

    /// Lists instances in a single region.
    fn list_instances<'a>(
        &'a self,
        region: &'a str,
    ) -> BackendFuture<'a, Vec<InstanceRecord>, Self::Error>;

    /// Creates a VPN server in `region` and waits until it has addresses.
    fn spawn_instance<'a>(&'a self, region: &'a str)
    -> BackendFuture<'a, SpawnedInstance, Self::Error>;

    /// Terminates an instance.
    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
        region: &'a str,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Opens the VPN tunnel to an instance.
    fn connect<'a>(
        &'a self,
        instance_id: &'a str,
        region: &'a str,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Closes the VPN tunnel.
    fn disconnect(&self) -> BackendFuture<'_, (), Self::Error>;

    /// Reports the current tunnel status.
    fn vpn_status(&self) -> BackendFuture<'_, VpnStatusRecord, Self::Error>;

    /// Opens a metrics push subscription.
    fn subscribe_metrics(&self) -> BackendFuture<'_, MetricsFeed, Self::Error>;

    /// Closes a metrics subscription previously opened by
    /// [`Backend::subscribe_metrics`].
    fn unsubscribe_metrics<'a>(&'a self, feed_id: &'a str) -> BackendFuture<'a, (), Self::Error>;

    /// Stores cloud credentials for subsequent calls.
    fn save_credentials<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> BackendFuture<'a, (), Self::Error>;
}
