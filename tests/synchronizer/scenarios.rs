//! BDD scenarios for the synchronizer.

use rstest_bdd_macros::scenario;

use super::test_helpers::{SyncWorld, world};

#[scenario(
    path = "tests/features/synchronizer.feature",
    name = "Merge inventory despite a failing region"
)]
fn scenario_partial_inventory(world: SyncWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/synchronizer.feature",
    name = "Confirmed spawn replaces its placeholder"
)]
fn scenario_confirmed_spawn(world: SyncWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/synchronizer.feature",
    name = "Terminating the connected instance unresolves the session"
)]
fn scenario_terminate_connected(world: SyncWorld) {
    drop(world);
}
