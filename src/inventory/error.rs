//! Error types for inventory operations.

use thiserror::Error;

/// Errors surfaced by [`super::InstanceInventory`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InventoryError {
    /// One or more regions failed to list; their instances are missing.
    #[error("instance listing failed in {}", regions.join(", "))]
    PartialRefresh {
        /// Failed region codes.
        regions: Vec<String>,
    },
    /// Instance creation failed and its placeholder was removed.
    #[error("failed to spawn instance in {region}: {message}")]
    Spawn {
        /// Region the spawn targeted.
        region: String,
        /// Backend error message.
        message: String,
    },
    /// Instance teardown failed and the previous state was restored.
    #[error("failed to terminate instance {instance_id}: {message}")]
    Terminate {
        /// Instance the teardown targeted.
        instance_id: String,
        /// Backend error message.
        message: String,
    },
    /// The region is not part of the loaded catalog.
    #[error("unknown region {region}")]
    UnknownRegion {
        /// Rejected region code.
        region: String,
    },
    /// No entry carries the identifier.
    #[error("unknown instance {instance_id}")]
    UnknownInstance {
        /// Rejected identifier.
        instance_id: String,
    },
    /// The identifier belongs to a spawn that has not been confirmed.
    #[error("instance {instance_id} is still being created")]
    PendingInstance {
        /// Placeholder identifier.
        instance_id: String,
    },
    /// A region code was required but empty.
    #[error("region must not be empty")]
    EmptyRegion,
}
