//! BDD step definitions for the synchronizer scenarios.

use std::sync::Arc;

use byocvpn_sync::test_support::{GatedCall, instance_record};
use byocvpn_sync::{Instance, VpnSession};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{StepError, SyncWorld};

#[given("a backend offering regions on three continents")]
fn backend_with_regions(world: &SyncWorld) {
    world.backend.with_regions(&[
        ("us-east-1", "USA"),
        ("eu-west-1", "Ireland"),
        ("ap-south-1", "India"),
    ]);
}

#[given("region \"{region}\" hosts instance \"{instance_id}\"")]
fn region_hosts_instance(world: &SyncWorld, region: String, instance_id: String) {
    world
        .backend
        .set_instances(&region, &[instance_record(&instance_id, "running", "1.2.3.4")]);
}

#[given("listing instances in \"{region}\" fails with \"{message}\"")]
fn listing_fails(world: &SyncWorld, region: String, message: String) {
    world.backend.fail_instances(&region, &message);
}

#[given("spawning in \"{region}\" yields instance \"{instance_id}\"")]
fn spawn_yields(world: &SyncWorld, region: String, instance_id: String) {
    world.backend.push_spawn(&region, &instance_id, "5.6.7.8");
}

#[given("spawn calls are held by the backend")]
fn spawns_held(world: &SyncWorld) {
    world
        .spawn_gate
        .replace(Some(world.backend.hold(GatedCall::Spawn)));
}

#[when("the synchronizer bootstraps")]
fn bootstrap(world: &SyncWorld) -> Result<(), StepError> {
    world.runtime.block_on(world.synchronizer.bootstrap())?;
    Ok(())
}

#[when("I request a spawn in \"{region}\"")]
fn request_spawn(world: &SyncWorld, region: String) {
    let synchronizer = Arc::clone(&world.synchronizer);
    let handle = world
        .runtime
        .spawn(async move { synchronizer.spawn(&region).await });
    world.pending_spawn.replace(Some(handle));
    world.settle();
}

#[when("the backend answers the spawn")]
fn answer_spawn(world: &SyncWorld) -> Result<(), StepError> {
    let gate = world
        .spawn_gate
        .borrow_mut()
        .take()
        .ok_or_else(|| StepError::Assertion(String::from("spawn gate was not installed")))?;
    gate.release();
    let handle = world
        .pending_spawn
        .borrow_mut()
        .take()
        .ok_or_else(|| StepError::Assertion(String::from("no spawn in flight")))?;
    world
        .runtime
        .block_on(handle)
        .map_err(|err| StepError::Assertion(err.to_string()))??;
    Ok(())
}

#[when("I connect to \"{instance_id}\"")]
fn connect(world: &SyncWorld, instance_id: String) -> Result<(), StepError> {
    world
        .runtime
        .block_on(world.synchronizer.connect(&instance_id))?;
    Ok(())
}

#[when("I terminate \"{instance_id}\"")]
fn terminate(world: &SyncWorld, instance_id: String) -> Result<(), StepError> {
    world
        .runtime
        .block_on(world.synchronizer.terminate(&instance_id))?;
    Ok(())
}

#[then("the inventory contains \"{instance_id}\"")]
fn inventory_contains(world: &SyncWorld, instance_id: String) -> Result<(), StepError> {
    let instances = world.synchronizer.view().instances;
    let matches = instances
        .iter()
        .filter(|instance| instance.id == instance_id)
        .count();
    if matches == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {instance_id} exactly once, found {matches} in {instances:?}"
        )))
    }
}

#[then("the inventory is empty")]
fn inventory_empty(world: &SyncWorld) -> Result<(), StepError> {
    let instances = world.synchronizer.view().instances;
    if instances.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no instances, found {instances:?}"
        )))
    }
}

#[then("region \"{region}\" is reported as failed")]
fn region_failed(world: &SyncWorld, region: String) -> Result<(), StepError> {
    let failed = world.synchronizer.view().failed_regions;
    if failed == vec![region.clone()] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected only {region} to fail, got {failed:?}"
        )))
    }
}

#[then("an \"{kind}\" notice is active")]
fn notice_active(world: &SyncWorld, kind: String) -> Result<(), StepError> {
    let notices = world.synchronizer.notices().active();
    if notices
        .iter()
        .any(|notice| notice.kind.to_string() == kind)
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected a {kind} notice, got {notices:?}"
        )))
    }
}

#[then("a placeholder in \"{region}\" is listed")]
fn placeholder_listed(world: &SyncWorld, region: String) -> Result<(), StepError> {
    let instances = world.synchronizer.view().instances;
    if instances
        .iter()
        .any(|instance| instance.is_placeholder() && instance.region == region)
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected a placeholder in {region}, got {instances:?}"
        )))
    }
}

#[then("no placeholder is listed")]
fn no_placeholder(world: &SyncWorld) -> Result<(), StepError> {
    let instances = world.synchronizer.view().instances;
    if instances.iter().any(Instance::is_placeholder) {
        Err(StepError::Assertion(format!(
            "placeholder still listed: {instances:?}"
        )))
    } else {
        Ok(())
    }
}

#[then("the session is connected to \"{instance_id}\"")]
fn session_connected(world: &SyncWorld, instance_id: String) -> Result<(), StepError> {
    match world.synchronizer.view().session {
        VpnSession::Connected {
            ref instance,
            resolved: true,
        } if instance.id == instance_id => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a resolved session on {instance_id}, got {other:?}"
        ))),
    }
}

#[then("the session is no longer resolved")]
fn session_unresolved(world: &SyncWorld) -> Result<(), StepError> {
    match world.synchronizer.view().session {
        VpnSession::Connected {
            resolved: false, ..
        } => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected an unresolved session, got {other:?}"
        ))),
    }
}
