use crate::{Index, SharedIndex};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, ReplicaSet, ReplicaSetSpec},
        batch::v1::{Job, JobSpec},
        core::v1::{
            Pod, PodStatus, ReplicationController, ReplicationControllerSpec, Service,
            ServiceSpec,
        },
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use kubert::index::IndexNamespacedResource;
use linkerd_tap_controller_core::{
    labels::Selector, ResourceKind, ResourceSelection, TargetId, CONTROL_PLANE_NS_LABEL,
};
use std::iter::FromIterator;

const TAP_PORT: u16 = 4190;
const CONTROL_PLANE_NS: &str = "linkerd";

struct TestConfig {
    index: SharedIndex,
    _tracing: tracing::subscriber::DefaultGuard,
}

impl Default for TestConfig {
    fn default() -> Self {
        let _tracing = tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(tracing::Level::TRACE)
                .finish(),
        );
        Self {
            index: Index::shared(TAP_PORT, CONTROL_PLANE_NS),
            _tracing,
        }
    }
}

fn mk_pod(
    ns: impl ToString,
    name: impl ToString,
    ip: &str,
    labels: impl IntoIterator<Item = (&'static str, &'static str)>,
) -> Pod {
    let mut labels = labels
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<std::collections::BTreeMap<_, _>>();
    labels.insert(
        CONTROL_PLANE_NS_LABEL.to_string(),
        CONTROL_PLANE_NS.to_string(),
    );
    Pod {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mk_deployment(
    ns: impl ToString,
    name: impl ToString,
    labels: impl IntoIterator<Item = (&'static str, &'static str)>,
) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(
                    labels
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                match_expressions: None,
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mk_service(
    ns: impl ToString,
    name: impl ToString,
    selector: impl IntoIterator<Item = (&'static str, &'static str)>,
) -> Service {
    Service {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(
                selector
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mk_labels(
    labels: impl IntoIterator<Item = (&'static str, &'static str)>,
) -> std::collections::BTreeMap<String, String> {
    labels
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn ids(rx: &crate::TargetsRx) -> Vec<TargetId> {
    rx.borrow().keys().cloned().collect()
}

#[test]
fn pod_selection() {
    let test = TestConfig::default();
    test.index
        .write()
        .apply(mk_pod("ns-0", "pod-0", "10.1.1.1", Some(("app", "web"))));
    test.index
        .write()
        .apply(mk_pod("ns-0", "pod-1", "10.1.1.2", Some(("app", "api"))));

    let rx = test.index.write().subscribe(&ResourceSelection::new(
        "ns-0",
        ResourceKind::Pod,
        Some("pod-0".to_string()),
    ));
    let targets = rx.borrow().clone();
    assert_eq!(targets.len(), 1);
    let target = targets
        .get(&TargetId::new("ns-0", "pod-0"))
        .expect("pod-0 must be a target");
    assert_eq!(target.addr, ([10, 1, 1, 1], TAP_PORT).into());

    let rx = test.index.write().subscribe(
        &ResourceSelection::new("ns-0", ResourceKind::Namespace, None)
            .with_selector(Selector::from_iter(Some(("app", "api")))),
    );
    assert_eq!(ids(&rx), vec![TargetId::new("ns-0", "pod-1")]);
}

#[test]
fn unmeshed_and_pending_pods_are_not_targets() {
    let test = TestConfig::default();

    let mut unmeshed = mk_pod("ns-0", "pod-0", "10.1.1.1", None);
    unmeshed
        .metadata
        .labels
        .as_mut()
        .expect("labels")
        .remove(CONTROL_PLANE_NS_LABEL);
    test.index.write().apply(unmeshed);

    let mut pending = mk_pod("ns-0", "pod-1", "10.1.1.2", None);
    pending.status = Some(PodStatus {
        phase: Some("Pending".to_string()),
        ..Default::default()
    });
    test.index.write().apply(pending);

    let rx = test
        .index
        .write()
        .subscribe(&ResourceSelection::new("ns-0", ResourceKind::Pod, None));
    assert!(rx.borrow().is_empty());

    test.index
        .write()
        .apply(mk_pod("ns-0", "pod-1", "10.1.1.2", None));
    assert_eq!(ids(&rx), vec![TargetId::new("ns-0", "pod-1")]);
}

#[test]
fn pods_meshed_by_other_control_planes_are_not_targets() {
    let test = TestConfig::default();

    let mut foreign = mk_pod("ns-0", "pod-0", "10.1.1.1", None);
    foreign
        .metadata
        .labels
        .as_mut()
        .expect("labels")
        .insert(CONTROL_PLANE_NS_LABEL.to_string(), "linkerd-edge".to_string());
    test.index.write().apply(foreign);
    test.index
        .write()
        .apply(mk_pod("ns-0", "pod-1", "10.1.1.2", None));

    let rx = test
        .index
        .write()
        .subscribe(&ResourceSelection::new("ns-0", ResourceKind::Pod, None));
    assert_eq!(ids(&rx), vec![TargetId::new("ns-0", "pod-1")]);

    // A pod that moves to another control plane stops being a target.
    let mut moved = mk_pod("ns-0", "pod-1", "10.1.1.2", None);
    moved
        .metadata
        .labels
        .as_mut()
        .expect("labels")
        .insert(CONTROL_PLANE_NS_LABEL.to_string(), "linkerd-edge".to_string());
    test.index.write().apply(moved);
    assert!(rx.borrow().is_empty());
}

#[test]
fn deployment_membership_tracks_pods() {
    let test = TestConfig::default();
    test.index
        .write()
        .apply(mk_deployment("ns-0", "web", Some(("app", "web"))));
    test.index
        .write()
        .apply(mk_pod("ns-0", "web-0", "10.1.1.1", Some(("app", "web"))));

    let mut rx = test.index.write().subscribe(&ResourceSelection::new(
        "ns-0",
        ResourceKind::Deployment,
        Some("web".to_string()),
    ));
    assert_eq!(ids(&rx), vec![TargetId::new("ns-0", "web-0")]);
    let _ = rx.borrow_and_update();

    // A new replica joins the deployment.
    test.index
        .write()
        .apply(mk_pod("ns-0", "web-1", "10.1.1.2", Some(("app", "web"))));
    assert!(rx.has_changed().expect("index must be live"));
    assert_eq!(
        ids(&rx),
        vec![TargetId::new("ns-0", "web-0"), TargetId::new("ns-0", "web-1")]
    );
    let _ = rx.borrow_and_update();

    // Unrelated pods do not publish updates.
    test.index
        .write()
        .apply(mk_pod("ns-0", "api-0", "10.1.1.3", Some(("app", "api"))));
    assert!(!rx.has_changed().expect("index must be live"));

    // Relabeling a pod removes it from the deployment.
    test.index
        .write()
        .apply(mk_pod("ns-0", "web-0", "10.1.1.1", Some(("app", "debug"))));
    assert_eq!(ids(&rx), vec![TargetId::new("ns-0", "web-1")]);

    <Index as IndexNamespacedResource<Pod>>::delete(
        &mut test.index.write(),
        "ns-0".to_string(),
        "web-1".to_string(),
    );
    assert!(rx.borrow().is_empty());
}

#[test]
fn service_selection() {
    let test = TestConfig::default();
    test.index
        .write()
        .apply(mk_pod("ns-0", "api-0", "10.1.1.1", Some(("app", "api"))));

    let rx = test.index.write().subscribe(&ResourceSelection::new(
        "ns-0",
        ResourceKind::Service,
        Some("api".to_string()),
    ));
    assert!(rx.borrow().is_empty(), "service does not exist yet");

    test.index
        .write()
        .apply(mk_service("ns-0", "api", Some(("app", "api"))));
    assert_eq!(ids(&rx), vec![TargetId::new("ns-0", "api-0")]);

    <Index as IndexNamespacedResource<Service>>::delete(
        &mut test.index.write(),
        "ns-0".to_string(),
        "api".to_string(),
    );
    assert!(rx.borrow().is_empty());
}

#[test]
fn job_replicaset_and_replicationcontroller_selection() {
    let test = TestConfig::default();
    test.index.write().apply(Job {
        metadata: ObjectMeta {
            namespace: Some("ns-0".to_string()),
            name: Some("migrate".to_string()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            selector: Some(LabelSelector {
                match_labels: Some(mk_labels(Some(("job-name", "migrate")))),
                match_expressions: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    });
    test.index.write().apply(ReplicaSet {
        metadata: ObjectMeta {
            namespace: Some("ns-0".to_string()),
            name: Some("web-abc".to_string()),
            ..Default::default()
        },
        spec: Some(ReplicaSetSpec {
            selector: LabelSelector {
                match_labels: Some(mk_labels(Some(("app", "web")))),
                match_expressions: None,
            },
            ..Default::default()
        }),
        ..Default::default()
    });
    test.index.write().apply(ReplicationController {
        metadata: ObjectMeta {
            namespace: Some("ns-0".to_string()),
            name: Some("legacy".to_string()),
            ..Default::default()
        },
        spec: Some(ReplicationControllerSpec {
            selector: Some(mk_labels(Some(("app", "legacy")))),
            ..Default::default()
        }),
        ..Default::default()
    });
    test.index
        .write()
        .apply(mk_pod("ns-0", "migrate-0", "10.1.1.1", Some(("job-name", "migrate"))));
    test.index
        .write()
        .apply(mk_pod("ns-0", "web-abc-0", "10.1.1.2", Some(("app", "web"))));
    test.index
        .write()
        .apply(mk_pod("ns-0", "legacy-0", "10.1.1.3", Some(("app", "legacy"))));

    for (kind, name, pod) in [
        (ResourceKind::Job, "migrate", "migrate-0"),
        (ResourceKind::ReplicaSet, "web-abc", "web-abc-0"),
        (ResourceKind::ReplicationController, "legacy", "legacy-0"),
    ] {
        let rx = test.index.write().subscribe(&ResourceSelection::new(
            "ns-0",
            kind,
            Some(name.to_string()),
        ));
        assert_eq!(ids(&rx), vec![TargetId::new("ns-0", pod)], "{kind}/{name}");
    }

    let rx = test.index.write().subscribe(&ResourceSelection::new(
        "ns-0",
        ResourceKind::ReplicationController,
        Some("legacy".to_string()),
    ));
    <Index as IndexNamespacedResource<ReplicationController>>::delete(
        &mut test.index.write(),
        "ns-0".to_string(),
        "legacy".to_string(),
    );
    assert!(rx.borrow().is_empty());
}

#[test]
fn all_deployments_selection() {
    let test = TestConfig::default();
    test.index
        .write()
        .apply(mk_deployment("ns-0", "web", Some(("app", "web"))));
    test.index
        .write()
        .apply(mk_deployment("ns-0", "api", Some(("app", "api"))));
    test.index
        .write()
        .apply(mk_pod("ns-0", "web-0", "10.1.1.1", Some(("app", "web"))));
    test.index
        .write()
        .apply(mk_pod("ns-0", "api-0", "10.1.1.2", Some(("app", "api"))));
    test.index
        .write()
        .apply(mk_pod("ns-0", "job-0", "10.1.1.3", Some(("app", "job"))));

    let rx = test.index.write().subscribe(&ResourceSelection::new(
        "ns-0",
        ResourceKind::Deployment,
        None,
    ));
    assert_eq!(
        ids(&rx),
        vec![TargetId::new("ns-0", "api-0"), TargetId::new("ns-0", "web-0")]
    );
}

#[test]
fn subscriptions_are_shared_and_pruned() {
    let test = TestConfig::default();
    let sel = ResourceSelection::new("ns-0", ResourceKind::Pod, None);

    let rx0 = test.index.write().subscribe(&sel);
    let rx1 = test.index.write().subscribe(&sel);
    assert!(rx0.same_channel(&rx1));
    assert_eq!(test.index.read().subscriptions.len(), 1);

    drop((rx0, rx1));
    test.index
        .write()
        .apply(mk_pod("ns-0", "pod-0", "10.1.1.1", None));
    assert!(test.index.read().subscriptions.is_empty());
}
