//! Region discovery and continent grouping.
//!
//! The catalog is loaded once at startup. Groups are derived from the region
//! set by a pure function so the same set always renders in the same order.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{Backend, RegionRecord};
use crate::liveness::Liveness;

/// Continent assigned to region codes whose prefix is not in the table.
pub const OTHER_CONTINENT: &str = "Other";

const CONTINENT_PREFIXES: &[(&str, &str)] = &[
    ("us", "North America"),
    ("ca", "North America"),
    ("eu", "Europe"),
    ("ap", "Asia Pacific"),
    ("sa", "South America"),
    ("me", "Middle East"),
    ("af", "Africa"),
];

/// Deployable region.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Region {
    /// Provider specific code, unique per region.
    pub code: String,
    /// Country shown next to the code.
    pub display_country: String,
}

impl Region {
    /// Builds a region from its code and display country.
    #[must_use]
    pub fn new(code: impl Into<String>, display_country: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            display_country: display_country.into(),
        }
    }
}

impl From<RegionRecord> for Region {
    fn from(record: RegionRecord) -> Self {
        Self {
            code: record.name,
            display_country: record.country,
        }
    }
}

/// Regions sharing a continent, sorted by code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegionGroup {
    /// Continent name.
    pub continent: String,
    /// Member regions ordered by code.
    pub regions: Vec<Region>,
}

/// Returns the continent for a region code using its leading prefix token.
#[must_use]
pub fn continent_for(code: &str) -> &'static str {
    let prefix = code.split('-').next().unwrap_or_default();
    CONTINENT_PREFIXES
        .iter()
        .find(|(candidate, _)| *candidate == prefix)
        .map_or(OTHER_CONTINENT, |(_, continent)| continent)
}

/// Groups regions by continent.
///
/// Groups are ordered by continent name and regions inside a group by code.
/// Duplicate codes collapse to their first occurrence.
#[must_use]
pub fn group_by_continent(regions: &[Region]) -> Vec<RegionGroup> {
    let mut by_code: BTreeMap<&str, &Region> = BTreeMap::new();
    for region in regions {
        by_code.entry(region.code.as_str()).or_insert(region);
    }

    let mut groups: BTreeMap<&'static str, Vec<Region>> = BTreeMap::new();
    for region in by_code.into_values() {
        groups
            .entry(continent_for(&region.code))
            .or_default()
            .push(region.clone());
    }

    groups
        .into_iter()
        .map(|(continent, members)| RegionGroup {
            continent: continent.to_owned(),
            regions: members,
        })
        .collect()
}

fn dedupe_by_code(records: Vec<RegionRecord>) -> Vec<Region> {
    let mut regions: Vec<Region> = Vec::with_capacity(records.len());
    for record in records {
        if regions.iter().all(|known| known.code != record.name) {
            regions.push(Region::from(record));
        }
    }
    regions
}

/// Load state of the catalog.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum CatalogStatus {
    /// Nothing requested yet.
    #[default]
    Idle,
    /// Discovery call outstanding.
    Loading,
    /// Regions loaded.
    Ready,
    /// The last discovery call failed with the given message.
    Failed(String),
}

/// Read model published by [`RegionCatalog`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CatalogSnapshot {
    /// Known regions in backend order.
    pub regions: Vec<Region>,
    /// Regions grouped for display.
    pub groups: Vec<RegionGroup>,
    /// Load state.
    pub status: CatalogStatus,
}

/// Errors raised by the region catalog.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CatalogError {
    /// Region discovery failed; the catalog is left empty.
    #[error("failed to load regions: {message}")]
    Load {
        /// Message returned by the backend.
        message: String,
    },
}

/// Owns the region set and its continent grouping.
#[derive(Debug)]
pub struct RegionCatalog<B> {
    backend: Arc<B>,
    state: watch::Sender<CatalogSnapshot>,
    liveness: Liveness,
}

impl<B: Backend> RegionCatalog<B> {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new(backend: Arc<B>, liveness: Liveness) -> Self {
        let (state, _) = watch::channel(CatalogSnapshot::default());
        Self {
            backend,
            state,
            liveness,
        }
    }

    /// Loads regions from the backend and regroups them.
    ///
    /// No retry is attempted; callers re-invoke this method to try again.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Load`] when discovery fails. The catalog is
    /// emptied and its status records the failure.
    pub async fn load_regions(&self) -> Result<Vec<Region>, CatalogError> {
        self.state
            .send_modify(|snapshot| snapshot.status = CatalogStatus::Loading);

        let outcome = self.backend.list_regions().await;
        let applying = self.liveness.is_alive();
        if !applying {
            debug!("discarding region discovery result after teardown");
        }

        match outcome {
            Ok(records) => {
                let regions = dedupe_by_code(records);
                info!(count = regions.len(), "loaded regions");
                if applying {
                    let groups = group_by_continent(&regions);
                    self.state.send_replace(CatalogSnapshot {
                        regions: regions.clone(),
                        groups,
                        status: CatalogStatus::Ready,
                    });
                }
                Ok(regions)
            }
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "region discovery failed");
                if applying {
                    self.state.send_replace(CatalogSnapshot {
                        regions: Vec::new(),
                        groups: Vec::new(),
                        status: CatalogStatus::Failed(message.clone()),
                    });
                }
                Err(CatalogError::Load { message })
            }
        }
    }

    /// Returns the known regions.
    #[must_use]
    pub fn regions(&self) -> Vec<Region> {
        self.state.borrow().regions.clone()
    }

    /// Returns the continent groups.
    #[must_use]
    pub fn groups(&self) -> Vec<RegionGroup> {
        self.state.borrow().groups.clone()
    }

    /// Returns the current load status.
    #[must_use]
    pub fn status(&self) -> CatalogStatus {
        self.state.borrow().status.clone()
    }

    /// Returns `true` when `code` names a loaded region.
    #[must_use]
    pub fn contains(&self, code: &str) -> bool {
        self.state
            .borrow()
            .regions
            .iter()
            .any(|region| region.code == code)
    }

    /// Returns a copy of the read model.
    #[must_use]
    pub fn snapshot(&self) -> CatalogSnapshot {
        self.state.borrow().clone()
    }

    /// Subscribes to read model changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CatalogSnapshot> {
        self.state.subscribe()
    }
}
