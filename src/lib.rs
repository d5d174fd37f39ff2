//! Client-side state synchroniser for a bring-your-own-cloud VPN.
//!
//! The crate keeps four views of remote state consistent while the backend
//! answers asynchronously: the region catalog, the instance inventory, the
//! VPN session, and the live tunnel metrics. [`Synchronizer`] wires them
//! together over a [`Backend`]; [`CommandBackend`] implements that trait by
//! shelling out to the helper binary.

pub mod backend;
pub mod command;
pub mod config;
pub mod inventory;
pub mod liveness;
pub mod metrics;
pub mod notice;
pub mod region;
pub mod session;
pub mod synchronizer;
pub mod test_support;

pub use backend::{
    Backend, BackendFuture, Credentials, InstanceRecord, MetricsFeed, MetricsRecord,
    RegionRecord, SpawnedInstance, VpnStatusRecord,
};
pub use command::{CommandBackend, CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ClientConfig, ConfigError};
pub use inventory::{
    Instance, InstanceInventory, InventoryError, InventoryOptions, LifecycleState, RefreshReport,
    SpawnTicket,
};
pub use liveness::Liveness;
pub use metrics::{Metrics, MetricsError, MetricsStream, StreamStatus};
pub use notice::{Notice, NoticeBoard, NoticeKind, Severity};
pub use region::{CatalogError, CatalogStatus, Region, RegionCatalog, RegionGroup};
pub use session::{SessionError, SessionPhase, VpnSession, VpnSessionTracker};
pub use synchronizer::{
    BootstrapReport, DashboardView, Synchronizer, SynchronizerError, SynchronizerOptions,
};
