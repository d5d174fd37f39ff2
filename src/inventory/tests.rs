//! Unit tests for the instance inventory.

use std::sync::Arc;

use rstest::{fixture, rstest};

use super::*;
use crate::region::RegionCatalog;
use crate::test_support::{BackendCall, GatedCall, ScriptedBackend, instance_record};

struct Harness {
    backend: Arc<ScriptedBackend>,
    inventory: InstanceInventory<ScriptedBackend>,
}

async fn harness_with(backend: ScriptedBackend, options: InventoryOptions) -> Harness {
    let backend = Arc::new(backend);
    let liveness = Liveness::new();
    let catalog = Arc::new(RegionCatalog::new(Arc::clone(&backend), liveness.clone()));
    catalog.load_regions().await.expect("regions load");
    let inventory = InstanceInventory::new(Arc::clone(&backend), catalog, liveness, options);
    Harness { backend, inventory }
}

#[fixture]
fn two_regions() -> ScriptedBackend {
    let backend = ScriptedBackend::new();
    backend.with_regions(&[("us-east-1", "USA"), ("eu-west-1", "Ireland")]);
    backend
}

fn ids(instances: &[Instance]) -> Vec<&str> {
    instances.iter().map(|instance| instance.id.as_str()).collect()
}

#[rstest]
#[case("pending", LifecycleState::Spawning)]
#[case("RUNNING", LifecycleState::Running)]
#[case("shutting-down", LifecycleState::Terminating)]
#[case("stopping", LifecycleState::Terminating)]
#[case("terminated", LifecycleState::Terminating)]
#[case("stopped", LifecycleState::Error)]
#[case("", LifecycleState::Error)]
fn backend_states_map_to_lifecycle(#[case] raw: &str, #[case] expected: LifecycleState) {
    assert_eq!(LifecycleState::from_backend(raw), expected);
}

#[rstest]
#[tokio::test]
async fn refresh_merges_regions_in_catalog_order(two_regions: ScriptedBackend) {
    two_regions.set_instances("us-east-1", &[instance_record("i-1", "running", "1.1.1.1")]);
    two_regions.set_instances(
        "eu-west-1",
        &[
            instance_record("i-2", "running", "2.2.2.2"),
            instance_record("i-3", "pending", ""),
        ],
    );
    let harness = harness_with(two_regions, InventoryOptions::default()).await;

    let report = harness.inventory.refresh().await;

    assert!(report.is_complete());
    assert_eq!(ids(&report.instances), vec!["i-1", "i-2", "i-3"]);
    let regions: Vec<&str> = report
        .instances
        .iter()
        .map(|instance| instance.region.as_str())
        .collect();
    assert_eq!(regions, vec!["us-east-1", "eu-west-1", "eu-west-1"]);
    assert_eq!(
        report.instances.first().map(|instance| instance.display_name.as_str()),
        Some(DEFAULT_INSTANCE_DISPLAY_NAME)
    );
    let snapshot = harness.inventory.snapshot();
    assert_eq!(snapshot.revision, 1);
    assert!(!snapshot.refreshing);
    assert!(snapshot.last_error.is_none());
}

#[rstest]
#[tokio::test]
async fn failing_region_is_reported_not_thrown(two_regions: ScriptedBackend) {
    two_regions.set_instances("us-east-1", &[instance_record("i-1", "running", "1.1.1.1")]);
    two_regions.fail_instances("eu-west-1", "throttled");
    let harness = harness_with(two_regions, InventoryOptions::default()).await;

    let report = harness.inventory.refresh().await;

    assert_eq!(ids(&report.instances), vec!["i-1"]);
    assert_eq!(
        report.failed_regions,
        vec![RegionFailure {
            region: String::from("eu-west-1"),
            message: String::from("throttled"),
        }]
    );
    let snapshot = harness.inventory.snapshot();
    assert_eq!(snapshot.failed_regions, vec![String::from("eu-west-1")]);
    assert_eq!(
        snapshot.last_error,
        Some(InventoryError::PartialRefresh {
            regions: vec![String::from("eu-west-1")],
        })
    );
}

#[rstest]
#[case::none(&[])]
#[case::first(&["us-east-1"])]
#[case::second(&["eu-west-1"])]
#[case::all(&["us-east-1", "eu-west-1", "ap-south-1"])]
#[tokio::test]
async fn any_failing_subset_keeps_the_rest(#[case] failing: &[&str]) {
    let backend = ScriptedBackend::new();
    backend.with_regions(&[
        ("us-east-1", "USA"),
        ("eu-west-1", "Ireland"),
        ("ap-south-1", "India"),
    ]);
    for (index, region) in ["us-east-1", "eu-west-1", "ap-south-1"].iter().enumerate() {
        if failing.contains(region) {
            backend.fail_instances(region, "unavailable");
        } else {
            backend.set_instances(region, &[instance_record(&format!("i-{index}"), "running", "")]);
        }
    }
    let harness = harness_with(backend, InventoryOptions::default()).await;

    let report = harness.inventory.refresh().await;

    assert_eq!(report.instances.len() + report.failed_regions.len(), 3);
    assert!(
        report
            .instances
            .iter()
            .all(|instance| !failing.contains(&instance.region.as_str()))
    );
}

#[rstest]
#[tokio::test]
async fn capped_fan_out_still_queries_every_region(two_regions: ScriptedBackend) {
    let options = InventoryOptions {
        max_concurrent_region_queries: 1,
        ..InventoryOptions::default()
    };
    let harness = harness_with(two_regions, options).await;

    harness.inventory.refresh().await;

    let listed = harness
        .backend
        .count_calls(|call| matches!(call, BackendCall::ListInstances(_)));
    assert_eq!(listed, 2);
}

#[rstest]
#[tokio::test]
async fn spawn_inserts_placeholder_then_confirms_in_place(two_regions: ScriptedBackend) {
    two_regions.push_spawn("us-east-1", "i-123", "3.3.3.3");
    let harness = harness_with(two_regions, InventoryOptions::default()).await;

    let ticket = harness.inventory.spawn("us-east-1").expect("spawn accepted");
    let placeholder = ticket.placeholder().clone();
    assert!(placeholder.temp_id.starts_with(PENDING_ID_PREFIX));
    let pending = harness.inventory.instances();
    assert_eq!(pending.len(), 1);
    assert!(pending.iter().all(Instance::is_placeholder));
    assert!(pending.iter().all(|instance| instance.public_ip_v4.is_empty()));

    let confirmed = ticket.confirm().await.expect("spawn confirmed");

    assert_eq!(confirmed.id, "i-123");
    assert_eq!(confirmed.lifecycle_state, LifecycleState::Running);
    assert_eq!(harness.inventory.instances(), vec![confirmed]);
}

#[rstest]
#[tokio::test]
async fn spawn_then_refresh_never_duplicates(two_regions: ScriptedBackend) {
    two_regions.push_spawn("us-east-1", "i-123", "3.3.3.3");
    two_regions.set_instances("us-east-1", &[instance_record("i-123", "running", "3.3.3.3")]);
    let harness = harness_with(two_regions, InventoryOptions::default()).await;

    harness
        .inventory
        .spawn_and_confirm("us-east-1")
        .await
        .expect("spawn confirmed");
    harness.inventory.refresh().await;

    assert_eq!(ids(&harness.inventory.instances()), vec!["i-123"]);
}

#[rstest]
#[tokio::test]
async fn refresh_during_spawn_keeps_placeholder_and_confirm_dedupes(two_regions: ScriptedBackend) {
    two_regions.push_spawn("us-east-1", "i-123", "3.3.3.3");
    two_regions.set_instances("us-east-1", &[instance_record("i-123", "pending", "")]);
    let harness = harness_with(two_regions, InventoryOptions::default()).await;
    let gate = harness.backend.hold(GatedCall::Spawn);

    let ticket = harness.inventory.spawn("us-east-1").expect("spawn accepted");
    let temp_id = ticket.placeholder().temp_id.clone();
    let confirm = ticket.confirm();
    let refresh = async {
        let report = harness.inventory.refresh().await;
        let entries = harness.inventory.snapshot().entries;
        assert!(entries.iter().any(|entry| entry.id() == temp_id));
        assert_eq!(entries.last().map(InventoryEntry::is_pending), Some(true));
        gate.release();
        report
    };
    let (confirmed, report) = tokio::join!(confirm, refresh);

    assert_eq!(ids(&report.instances), vec!["i-123"]);
    confirmed.expect("spawn confirmed");
    let instances = harness.inventory.instances();
    assert_eq!(ids(&instances), vec!["i-123"]);
    assert!(instances.iter().all(|instance| instance.lifecycle_state == LifecycleState::Running));
}

#[rstest]
#[tokio::test]
async fn failed_spawn_removes_placeholder(two_regions: ScriptedBackend) {
    two_regions.push_spawn_failure("quota exceeded");
    let harness = harness_with(two_regions, InventoryOptions::default()).await;

    let err = harness
        .inventory
        .spawn_and_confirm("eu-west-1")
        .await
        .expect_err("spawn should fail");

    assert_eq!(
        err,
        InventoryError::Spawn {
            region: String::from("eu-west-1"),
            message: String::from("quota exceeded"),
        }
    );
    assert!(harness.inventory.instances().is_empty());
    assert_eq!(harness.inventory.snapshot().last_error, Some(err));
}

#[rstest]
#[tokio::test]
async fn dropped_ticket_removes_placeholder(two_regions: ScriptedBackend) {
    let harness = harness_with(two_regions, InventoryOptions::default()).await;

    let ticket = harness.inventory.spawn("eu-west-1").expect("spawn accepted");
    assert_eq!(harness.inventory.instances().len(), 1);
    drop(ticket);

    assert!(harness.inventory.instances().is_empty());
    assert_eq!(
        harness
            .backend
            .count_calls(|call| matches!(call, BackendCall::Spawn(_))),
        0
    );
}

#[rstest]
#[tokio::test]
async fn concurrent_spawns_each_own_a_placeholder(two_regions: ScriptedBackend) {
    two_regions.push_spawn("us-east-1", "i-1", "1.1.1.1");
    two_regions.push_spawn("eu-west-1", "i-2", "2.2.2.2");
    let harness = harness_with(two_regions, InventoryOptions::default()).await;

    let first = harness.inventory.spawn("us-east-1").expect("first spawn");
    let second = harness.inventory.spawn("eu-west-1").expect("second spawn");
    assert_ne!(first.placeholder().temp_id, second.placeholder().temp_id);
    assert_eq!(harness.inventory.instances().len(), 2);

    let (one, two) = tokio::join!(first.confirm(), second.confirm());
    one.expect("first confirmed");
    two.expect("second confirmed");

    let mut confirmed = ids(&harness.inventory.instances())
        .into_iter()
        .map(str::to_owned)
        .collect::<Vec<_>>();
    confirmed.sort();
    assert_eq!(confirmed, vec![String::from("i-1"), String::from("i-2")]);
}

#[rstest]
#[case::blank("  ", InventoryError::EmptyRegion)]
#[case::unknown("mars-north-1", InventoryError::UnknownRegion { region: String::from("mars-north-1") })]
#[tokio::test]
async fn spawn_rejects_bad_regions_without_placeholder(
    two_regions: ScriptedBackend,
    #[case] region: &str,
    #[case] expected: InventoryError,
) {
    let harness = harness_with(two_regions, InventoryOptions::default()).await;

    let err = harness
        .inventory
        .spawn(region)
        .map(|ticket| ticket.placeholder().clone())
        .expect_err("region should be rejected");

    assert_eq!(err, expected);
    assert_eq!(harness.inventory.revision(), 0);
}

#[rstest]
#[tokio::test]
async fn terminate_marks_then_removes(two_regions: ScriptedBackend) {
    two_regions.set_instances("us-east-1", &[instance_record("i-123", "running", "1.1.1.1")]);
    let harness = harness_with(two_regions, InventoryOptions::default()).await;
    harness.inventory.refresh().await;
    let gate = harness.backend.hold(GatedCall::Terminate);

    let terminate = harness.inventory.terminate("i-123");
    let observe = async {
        tokio::task::yield_now().await;
        let state = harness.inventory.find("i-123").map(|instance| instance.lifecycle_state);
        gate.release();
        state
    };
    let (outcome, observed) = tokio::join!(terminate, observe);

    outcome.expect("terminate succeeds");
    assert_eq!(observed, Some(LifecycleState::Terminating));
    assert!(harness.inventory.find("i-123").is_none());
    assert!(harness.backend.calls().contains(&BackendCall::Terminate {
        instance_id: String::from("i-123"),
        region: String::from("us-east-1"),
    }));
}

#[rstest]
#[tokio::test]
async fn failed_terminate_restores_previous_state(two_regions: ScriptedBackend) {
    two_regions.set_instances("eu-west-1", &[instance_record("i-9", "stopped", "")]);
    two_regions.fail_terminate("i-9", "dependency violation");
    let harness = harness_with(two_regions, InventoryOptions::default()).await;
    harness.inventory.refresh().await;

    let err = harness
        .inventory
        .terminate("i-9")
        .await
        .expect_err("terminate should fail");

    assert!(matches!(err, InventoryError::Terminate { ref instance_id, .. } if instance_id == "i-9"));
    assert_eq!(
        harness.inventory.find("i-9").map(|instance| instance.lifecycle_state),
        Some(LifecycleState::Error)
    );
}

#[rstest]
#[tokio::test]
async fn terminate_rejects_placeholders_and_unknown_ids(two_regions: ScriptedBackend) {
    let harness = harness_with(two_regions, InventoryOptions::default()).await;
    let ticket = harness.inventory.spawn("us-east-1").expect("spawn accepted");
    let temp_id = ticket.placeholder().temp_id.clone();

    let pending = harness.inventory.terminate(&temp_id).await;
    let unknown = harness.inventory.terminate("i-missing").await;

    assert!(matches!(pending, Err(InventoryError::PendingInstance { .. })));
    assert!(matches!(unknown, Err(InventoryError::UnknownInstance { .. })));
    assert_eq!(
        harness
            .backend
            .count_calls(|call| matches!(call, BackendCall::Terminate { .. })),
        0
    );
    drop(ticket);
}

#[rstest]
#[tokio::test]
async fn insert_upserts_and_remove_deletes(two_regions: ScriptedBackend) {
    let harness = harness_with(two_regions, InventoryOptions::default()).await;
    let mut instance = Instance {
        id: String::from("i-5"),
        display_name: String::from("Frankfurt"),
        lifecycle_state: LifecycleState::Running,
        public_ip_v4: String::from("5.5.5.5"),
        public_ip_v6: None,
        region: String::from("eu-west-1"),
    };

    harness.inventory.insert(instance.clone());
    instance.public_ip_v4 = String::from("6.6.6.6");
    harness.inventory.insert(instance.clone());

    assert_eq!(harness.inventory.instances(), vec![instance]);
    assert!(harness.inventory.remove("i-5").is_some());
    assert!(harness.inventory.remove("i-5").is_none());
    assert_eq!(harness.inventory.revision(), 3);
}

#[rstest]
#[tokio::test]
async fn retired_inventory_ignores_refresh_results(two_regions: ScriptedBackend) {
    two_regions.set_instances("us-east-1", &[instance_record("i-1", "running", "")]);
    let backend = Arc::new(two_regions);
    let liveness = Liveness::new();
    let catalog = Arc::new(RegionCatalog::new(Arc::clone(&backend), liveness.clone()));
    catalog.load_regions().await.expect("regions load");
    let inventory = InstanceInventory::new(
        Arc::clone(&backend),
        catalog,
        liveness.clone(),
        InventoryOptions::default(),
    );
    liveness.retire();

    let report = inventory.refresh().await;

    assert_eq!(report.instances.len(), 1);
    assert!(inventory.instances().is_empty());
    let snapshot = inventory.snapshot();
    assert!(!snapshot.refreshing);
    assert_eq!(snapshot.refreshes_in_flight, 0);
}

#[rstest]
#[tokio::test]
async fn retired_inventory_keeps_placeholders_of_dropped_tickets(two_regions: ScriptedBackend) {
    let backend = Arc::new(two_regions);
    let liveness = Liveness::new();
    let catalog = Arc::new(RegionCatalog::new(Arc::clone(&backend), liveness.clone()));
    catalog.load_regions().await.expect("regions load");
    let inventory = InstanceInventory::new(
        Arc::clone(&backend),
        catalog,
        liveness.clone(),
        InventoryOptions::default(),
    );
    let ticket = inventory.spawn("eu-west-1").expect("spawn accepted");
    let revision = inventory.revision();

    liveness.retire();
    drop(ticket);

    assert_eq!(inventory.revision(), revision);
    assert_eq!(inventory.instances().len(), 1);
}

#[rstest]
#[tokio::test]
async fn overlapping_refreshes_keep_the_flag_until_the_last_finishes(
    two_regions: ScriptedBackend,
) {
    let harness = harness_with(two_regions, InventoryOptions::default()).await;
    let gate = harness.backend.hold(GatedCall::ListInstances);

    let first = async {
        let report = harness.inventory.refresh().await;
        (report, harness.inventory.snapshot())
    };
    let second = harness.inventory.refresh();
    let driver = async {
        tokio::task::yield_now().await;
        let during = harness.inventory.snapshot();
        gate.release();
        gate.release();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        gate.release();
        gate.release();
        during
    };
    let ((first_report, after_first), second_report, during) =
        tokio::join!(first, second, driver);

    assert!(first_report.is_complete());
    assert!(second_report.is_complete());
    assert!(during.refreshing);
    assert_eq!(during.refreshes_in_flight, 2);
    assert!(after_first.refreshing);
    assert_eq!(after_first.refreshes_in_flight, 1);
    let settled = harness.inventory.snapshot();
    assert!(!settled.refreshing);
    assert_eq!(settled.refreshes_in_flight, 0);
}
