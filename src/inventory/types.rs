//! Instance records held by the inventory.

use uuid::Uuid;

use crate::backend::{InstanceRecord, SpawnedInstance};

use super::error::InventoryError;

/// Prefix of locally generated placeholder identifiers.
pub const PENDING_ID_PREFIX: &str = "pending-";

/// Lifecycle of a VPN server instance.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LifecycleState {
    /// Creation requested and not yet confirmed.
    Spawning,
    /// Server is up.
    Running,
    /// Teardown requested or under way.
    Terminating,
    /// Backend reported a state this client does not understand.
    Error,
}

impl LifecycleState {
    /// Maps a backend lifecycle string onto a local state.
    ///
    /// ```
    /// use byocvpn_sync::inventory::LifecycleState;
    ///
    /// assert_eq!(LifecycleState::from_backend("Running"), LifecycleState::Running);
    /// assert_eq!(LifecycleState::from_backend("stopping"), LifecycleState::Terminating);
    /// assert_eq!(LifecycleState::from_backend("rebooting"), LifecycleState::Error);
    /// ```
    #[must_use]
    pub fn from_backend(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Spawning,
            "running" => Self::Running,
            "shutting-down" | "stopping" | "terminated" => Self::Terminating,
            _ => Self::Error,
        }
    }

    /// Short lowercase label used in logs and CLI output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Error => "error",
        }
    }
}

/// VPN server instance as presented to readers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Backend identifier, or a temporary identifier for placeholders.
    pub id: String,
    /// Human readable name.
    pub display_name: String,
    /// Current lifecycle state.
    pub lifecycle_state: LifecycleState,
    /// Public IPv4 address; empty until assigned.
    pub public_ip_v4: String,
    /// Public IPv6 address, when assigned.
    pub public_ip_v6: Option<String>,
    /// Region code the instance lives in.
    pub region: String,
}

impl Instance {
    /// Converts a listing record, tagging it with the region it was listed in.
    #[must_use]
    pub fn from_record(record: InstanceRecord, region: &str, default_name: &str) -> Self {
        Self {
            id: record.id,
            display_name: record
                .name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| default_name.to_owned()),
            lifecycle_state: LifecycleState::from_backend(&record.state),
            public_ip_v4: record.public_ip_v4,
            public_ip_v6: non_empty(record.public_ip_v6),
            region: region.to_owned(),
        }
    }

    /// Converts a confirmed spawn into a running instance.
    #[must_use]
    pub fn from_spawned(spawned: SpawnedInstance, display_name: &str) -> Self {
        Self {
            id: spawned.instance_id,
            display_name: display_name.to_owned(),
            lifecycle_state: LifecycleState::Running,
            public_ip_v4: spawned.public_ip_v4,
            public_ip_v6: spawned.public_ip_v6.and_then(non_empty),
            region: spawned.region,
        }
    }

    /// Returns `true` for locally generated placeholders.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.lifecycle_state == LifecycleState::Spawning && self.id.starts_with(PENDING_ID_PREFIX)
    }

    /// Checks that the instance can be used as a connection target.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::PendingInstance`] for placeholders and
    /// [`InventoryError::EmptyRegion`] when no region is recorded.
    pub fn ensure_connectable(&self) -> Result<(), InventoryError> {
        if self.is_placeholder() {
            return Err(InventoryError::PendingInstance {
                instance_id: self.id.clone(),
            });
        }
        if self.region.trim().is_empty() {
            return Err(InventoryError::EmptyRegion);
        }
        Ok(())
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Locally inserted stand-in for an instance the backend has not confirmed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Placeholder {
    /// Temporary identifier of the form `pending-<uuid>`.
    pub temp_id: String,
    /// Region the instance is being created in.
    pub region: String,
    /// Name shown while the spawn is outstanding.
    pub display_name: String,
}

impl Placeholder {
    pub(crate) fn new(region: &str, display_name: &str) -> Self {
        Self {
            temp_id: format!("{PENDING_ID_PREFIX}{}", Uuid::new_v4()),
            region: region.to_owned(),
            display_name: display_name.to_owned(),
        }
    }

    /// Presents the placeholder as a spawning instance with empty addresses.
    #[must_use]
    pub fn as_instance(&self) -> Instance {
        Instance {
            id: self.temp_id.clone(),
            display_name: self.display_name.clone(),
            lifecycle_state: LifecycleState::Spawning,
            public_ip_v4: String::new(),
            public_ip_v6: None,
            region: self.region.clone(),
        }
    }
}

/// Entry of the inventory collection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InventoryEntry {
    /// Spawn in flight.
    Pending(Placeholder),
    /// Instance known to the backend.
    Confirmed(Instance),
}

impl InventoryEntry {
    /// Identifier of the entry.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Pending(placeholder) => &placeholder.temp_id,
            Self::Confirmed(instance) => &instance.id,
        }
    }

    /// Instance view of the entry.
    #[must_use]
    pub fn to_instance(&self) -> Instance {
        match self {
            Self::Pending(placeholder) => placeholder.as_instance(),
            Self::Confirmed(instance) => instance.clone(),
        }
    }

    /// Returns `true` for placeholders.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Region whose listing failed during a refresh.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegionFailure {
    /// Region code.
    pub region: String,
    /// Backend error message.
    pub message: String,
}

/// Outcome of [`super::InstanceInventory::refresh`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RefreshReport {
    /// Merged confirmed instances in catalog order.
    pub instances: Vec<Instance>,
    /// Regions that failed and were treated as empty.
    pub failed_regions: Vec<RegionFailure>,
}

impl RefreshReport {
    /// Returns `true` when every region answered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_regions.is_empty()
    }
}

/// Read model published by the inventory.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InventorySnapshot {
    /// Confirmed entries followed by placeholders.
    pub entries: Vec<InventoryEntry>,
    /// Incremented on every collection change.
    pub revision: u64,
    /// Regions that failed during the last refresh.
    pub failed_regions: Vec<String>,
    /// `true` while at least one refresh is outstanding.
    pub refreshing: bool,
    /// Number of refreshes currently fanning out.
    pub refreshes_in_flight: usize,
    /// Most recent operation error.
    pub last_error: Option<InventoryError>,
}

impl InventorySnapshot {
    /// Instance view of every entry.
    #[must_use]
    pub fn instances(&self) -> Vec<Instance> {
        self.entries.iter().map(InventoryEntry::to_instance).collect()
    }

    /// Looks up a confirmed instance by identifier.
    #[must_use]
    pub fn find_confirmed(&self, instance_id: &str) -> Option<&Instance> {
        self.entries.iter().find_map(|entry| match entry {
            InventoryEntry::Confirmed(instance) if instance.id == instance_id => Some(instance),
            _ => None,
        })
    }

    /// Returns `true` when any entry carries `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|entry| entry.id() == id)
    }
}
