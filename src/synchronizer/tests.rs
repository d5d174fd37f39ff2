//! Unit tests for the synchroniser wiring.

use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::backend::VpnStatusRecord;
use crate::inventory::LifecycleState;
use crate::test_support::{
    BackendCall, ScriptedBackend, connected_status, instance_record, metrics_record,
};

#[fixture]
fn backend() -> ScriptedBackend {
    let backend = ScriptedBackend::new();
    backend.with_regions(&[
        ("us-east-1", "USA"),
        ("eu-west-1", "Ireland"),
        ("ap-south-1", "India"),
    ]);
    backend.set_instances("us-east-1", &[instance_record("i-123", "running", "1.2.3.4")]);
    backend
}

fn synchronizer(backend: &ScriptedBackend) -> Synchronizer<ScriptedBackend> {
    Synchronizer::new(Arc::new(backend.clone()), SynchronizerOptions::default())
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

fn notice_kinds(sync: &Synchronizer<ScriptedBackend>) -> Vec<(Severity, NoticeKind)> {
    sync.notices()
        .active()
        .iter()
        .map(|notice| (notice.severity, notice.kind))
        .collect()
}

#[rstest]
#[tokio::test]
async fn bootstrap_loads_everything(backend: ScriptedBackend) {
    backend.set_status(connected_status("i-123"));
    let sync = synchronizer(&backend);

    let report = sync.bootstrap().await.expect("bootstrap");

    assert_eq!(report.regions, 3);
    assert_eq!(report.instances, 1);
    assert!(report.failed_regions.is_empty());
    assert!(matches!(
        report.session,
        VpnSession::Connected { resolved: true, .. }
    ));
    let view = sync.view();
    assert_eq!(view.catalog_status, CatalogStatus::Ready);
    assert_eq!(view.region_groups.len(), 3);
    assert_eq!(view.phase, SessionPhase::Connected);
}

#[rstest]
#[tokio::test]
async fn bootstrap_stops_when_regions_fail(backend: ScriptedBackend) {
    backend.fail_regions("expired token");
    let sync = synchronizer(&backend);

    let err = sync.bootstrap().await.expect_err("bootstrap fails");

    assert!(matches!(err, SynchronizerError::Catalog(_)));
    assert_eq!(
        backend.count_calls(|call| matches!(call, BackendCall::ListInstances(_))),
        0
    );
    assert_eq!(
        notice_kinds(&sync),
        vec![(Severity::Error, NoticeKind::RegionLoad)]
    );
}

#[rstest]
#[tokio::test]
async fn partial_refresh_posts_a_warning(backend: ScriptedBackend) {
    backend.fail_instances("eu-west-1", "throttled");
    let sync = synchronizer(&backend);

    let report = sync.bootstrap().await.expect("bootstrap");

    assert_eq!(report.failed_regions, vec![String::from("eu-west-1")]);
    let notices = sync.notices().active();
    let warning = notices
        .iter()
        .find(|notice| notice.kind == NoticeKind::PartialInventory)
        .expect("partial inventory notice");
    assert_eq!(warning.severity, Severity::Warning);
    assert!(warning.message.contains("eu-west-1"));
    assert_eq!(sync.view().instances.len(), 1);
}

#[rstest]
#[tokio::test]
async fn spawn_posts_success_and_failure_notices(backend: ScriptedBackend) {
    backend.push_spawn("eu-west-1", "i-new", "5.6.7.8");
    backend.push_spawn_failure("quota exceeded");
    let sync = synchronizer(&backend);
    sync.bootstrap().await.expect("bootstrap");

    let spawned = sync.spawn("eu-west-1").await.expect("spawn");
    let failed = sync.spawn("eu-west-1").await;

    assert_eq!(spawned.id, "i-new");
    assert_eq!(spawned.lifecycle_state, LifecycleState::Running);
    assert!(matches!(failed, Err(SynchronizerError::Inventory(_))));
    assert_eq!(
        notice_kinds(&sync),
        vec![
            (Severity::Info, NoticeKind::Spawn),
            (Severity::Error, NoticeKind::Spawn),
        ]
    );
    assert_eq!(sync.view().instances.len(), 2);
}

#[rstest]
#[tokio::test]
async fn begin_spawn_exposes_the_placeholder(backend: ScriptedBackend) {
    backend.push_spawn("us-east-1", "i-456", "9.9.9.9");
    let sync = synchronizer(&backend);
    sync.bootstrap().await.expect("bootstrap");

    let ticket = sync.begin_spawn("us-east-1").expect("ticket");
    let pending = sync.view().instances;
    assert!(pending.iter().any(Instance::is_placeholder));

    let confirmed = ticket.confirm().await.expect("confirm");
    let settled = sync.view().instances;

    assert_eq!(confirmed.id, "i-456");
    assert!(!settled.iter().any(Instance::is_placeholder));
    assert_eq!(settled.len(), 2);
}

#[rstest]
#[tokio::test]
async fn connect_requires_a_known_instance(backend: ScriptedBackend) {
    let sync = synchronizer(&backend);
    sync.bootstrap().await.expect("bootstrap");

    let err = sync.connect("i-missing").await.expect_err("unknown id");

    assert_eq!(
        err,
        SynchronizerError::Inventory(InventoryError::UnknownInstance {
            instance_id: String::from("i-missing"),
        })
    );
    assert_eq!(
        backend.count_calls(|call| matches!(call, BackendCall::Connect { .. })),
        0
    );
    assert_eq!(
        notice_kinds(&sync),
        vec![(Severity::Error, NoticeKind::Connect)]
    );
}

#[rstest]
#[tokio::test]
async fn connect_and_disconnect_gate_metrics(backend: ScriptedBackend) {
    let sync = synchronizer(&backend);
    sync.bootstrap().await.expect("bootstrap");

    sync.connect("i-123").await.expect("connect");
    sync.metrics().activate().await.expect("metrics");
    assert!(backend.push_metrics(metrics_record(10, 20, 1.5)));
    settle().await;
    assert!(sync.view().metrics.is_some());

    sync.disconnect().await.expect("disconnect");

    let view = sync.view();
    assert_eq!(view.session, VpnSession::Disconnected);
    assert!(view.metrics.is_none());
    assert!(backend.open_feeds().is_empty());
}

#[rstest]
#[tokio::test]
async fn terminating_the_connected_instance_unresolves_the_session(backend: ScriptedBackend) {
    let sync = synchronizer(&backend);
    sync.bootstrap().await.expect("bootstrap");
    sync.connect("i-123").await.expect("connect");

    sync.terminate("i-123").await.expect("terminate");

    let view = sync.view();
    assert!(view.instances.is_empty());
    assert!(matches!(
        view.session,
        VpnSession::Connected { resolved: false, .. }
    ));
    assert!(
        notice_kinds(&sync).contains(&(Severity::Info, NoticeKind::Terminate)),
        "terminate notice missing"
    );
}

#[rstest]
#[tokio::test]
async fn rejected_credentials_do_not_reload(backend: ScriptedBackend) {
    backend.fail_credentials("invalid key");
    let sync = synchronizer(&backend);

    let err = sync
        .save_credentials(&Credentials::new("aws", "AKIA", "secret"))
        .await
        .expect_err("credentials rejected");

    assert_eq!(
        err,
        SynchronizerError::Credentials {
            message: String::from("invalid key"),
        }
    );
    assert_eq!(
        backend.count_calls(|call| *call == BackendCall::ListRegions),
        0
    );
}

#[rstest]
#[tokio::test]
async fn saved_credentials_trigger_a_reload(backend: ScriptedBackend) {
    let sync = synchronizer(&backend);

    let report = sync
        .save_credentials(&Credentials::new("aws", "AKIA", "secret"))
        .await
        .expect("credentials saved");

    assert_eq!(report.regions, 3);
    assert_eq!(backend.saved_credentials().len(), 1);
    assert_eq!(
        backend.count_calls(|call| *call == BackendCall::ListRegions),
        1
    );
}

#[rstest]
#[tokio::test]
async fn view_hides_metrics_without_a_session(backend: ScriptedBackend) {
    let sync = synchronizer(&backend);
    sync.bootstrap().await.expect("bootstrap");
    sync.metrics().activate().await.expect("metrics");
    assert!(backend.push_metrics(metrics_record(1, 1, 1.0)));
    settle().await;

    assert!(sync.metrics().metrics().is_some());
    assert!(sync.view().metrics.is_none());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn background_tasks_follow_the_backend_and_stop(backend: ScriptedBackend) {
    let sync = synchronizer(&backend);
    sync.bootstrap().await.expect("bootstrap");
    sync.start();
    sync.start();

    backend.set_status(VpnStatusRecord {
        public_ip_v4: Some(String::from("1.2.3.4")),
        ..connected_status("i-123")
    });
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    assert_eq!(sync.view().phase, SessionPhase::Connected);
    assert_eq!(sync.metrics().status(), StreamStatus::Active);

    sync.shutdown().await;

    assert!(backend.open_feeds().is_empty());
    let polls = backend.count_calls(|call| *call == BackendCall::Status);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        backend.count_calls(|call| *call == BackendCall::Status),
        polls
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_subscription_posts_one_notice(backend: ScriptedBackend) {
    backend.fail_subscribe(Some("no tunnel"));
    backend.set_status(connected_status("i-123"));
    let sync = synchronizer(&backend);
    sync.bootstrap().await.expect("bootstrap");
    sync.start();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let subscription_notices = sync
        .notices()
        .active()
        .into_iter()
        .filter(|notice| notice.kind == NoticeKind::Subscription)
        .count();
    assert_eq!(subscription_notices, 1);
    sync.shutdown().await;
}
