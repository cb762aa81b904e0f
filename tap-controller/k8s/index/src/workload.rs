use crate::Index;
use k8s_openapi::{
    api::{apps::v1 as apps, batch::v1 as batch, core::v1 as core},
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::ResourceExt;
use linkerd_tap_controller_core::{
    labels::{Expression, Operator, Selector},
    ResourceKind,
};

/// Names a pod-selecting resource within a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct WorkloadRef {
    pub(crate) kind: ResourceKind,
    pub(crate) name: String,
}

impl WorkloadRef {
    pub(crate) fn new(kind: ResourceKind, name: impl ToString) -> Self {
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

impl Index {
    fn apply_workload(&mut self, namespace: String, wref: WorkloadRef, selector: Option<Selector>) {
        let ns = self.ns_or_default(namespace.clone());
        if ns.workloads.get(&wref) == Some(&selector) {
            return;
        }
        tracing::debug!(ns = %namespace, kind = %wref.kind, name = %wref.name, "indexed workload");
        ns.workloads.insert(wref, selector);
        self.reindex(&namespace);
    }

    fn delete_workload(&mut self, namespace: String, wref: WorkloadRef) {
        let removed = self
            .namespaces
            .get_mut(&namespace)
            .and_then(|ns| ns.workloads.remove(&wref));
        if removed.is_some() {
            tracing::debug!(ns = %namespace, kind = %wref.kind, name = %wref.name, "workload deleted");
            self.reindex(&namespace);
        }
    }
}

impl kubert::index::IndexNamespacedResource<core::Service> for Index {
    fn apply(&mut self, svc: core::Service) {
        let namespace = svc.namespace().expect("service must have a namespace");
        let wref = WorkloadRef::new(ResourceKind::Service, svc.name_unchecked());

        // Services without a selector (e.g. those with manually managed
        // endpoints) do not select any pods.
        let selector = svc
            .spec
            .and_then(|spec| spec.selector)
            .filter(|labels| !labels.is_empty())
            .map(Selector::from_map);
        self.apply_workload(namespace, wref, selector);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_workload(namespace, WorkloadRef::new(ResourceKind::Service, name));
    }
}

impl kubert::index::IndexNamespacedResource<apps::Deployment> for Index {
    fn apply(&mut self, deploy: apps::Deployment) {
        let namespace = deploy.namespace().expect("deployment must have a namespace");
        let wref = WorkloadRef::new(ResourceKind::Deployment, deploy.name_unchecked());
        let selector = deploy.spec.and_then(|spec| pod_selector(spec.selector));
        self.apply_workload(namespace, wref, selector);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_workload(namespace, WorkloadRef::new(ResourceKind::Deployment, name));
    }
}

impl kubert::index::IndexNamespacedResource<apps::StatefulSet> for Index {
    fn apply(&mut self, sts: apps::StatefulSet) {
        let namespace = sts.namespace().expect("statefulset must have a namespace");
        let wref = WorkloadRef::new(ResourceKind::StatefulSet, sts.name_unchecked());
        let selector = sts.spec.and_then(|spec| pod_selector(spec.selector));
        self.apply_workload(namespace, wref, selector);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_workload(namespace, WorkloadRef::new(ResourceKind::StatefulSet, name));
    }
}

impl kubert::index::IndexNamespacedResource<apps::DaemonSet> for Index {
    fn apply(&mut self, ds: apps::DaemonSet) {
        let namespace = ds.namespace().expect("daemonset must have a namespace");
        let wref = WorkloadRef::new(ResourceKind::DaemonSet, ds.name_unchecked());
        let selector = ds.spec.and_then(|spec| pod_selector(spec.selector));
        self.apply_workload(namespace, wref, selector);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_workload(namespace, WorkloadRef::new(ResourceKind::DaemonSet, name));
    }
}

impl kubert::index::IndexNamespacedResource<apps::ReplicaSet> for Index {
    fn apply(&mut self, rs: apps::ReplicaSet) {
        let namespace = rs.namespace().expect("replicaset must have a namespace");
        let wref = WorkloadRef::new(ResourceKind::ReplicaSet, rs.name_unchecked());
        let selector = rs.spec.and_then(|spec| pod_selector(spec.selector));
        self.apply_workload(namespace, wref, selector);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_workload(namespace, WorkloadRef::new(ResourceKind::ReplicaSet, name));
    }
}

impl kubert::index::IndexNamespacedResource<batch::Job> for Index {
    fn apply(&mut self, job: batch::Job) {
        let namespace = job.namespace().expect("job must have a namespace");
        let wref = WorkloadRef::new(ResourceKind::Job, job.name_unchecked());
        let selector = job
            .spec
            .and_then(|spec| spec.selector)
            .and_then(pod_selector);
        self.apply_workload(namespace, wref, selector);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_workload(namespace, WorkloadRef::new(ResourceKind::Job, name));
    }
}

impl kubert::index::IndexNamespacedResource<core::ReplicationController> for Index {
    fn apply(&mut self, rc: core::ReplicationController) {
        let namespace = rc
            .namespace()
            .expect("replicationcontroller must have a namespace");
        let wref = WorkloadRef::new(ResourceKind::ReplicationController, rc.name_unchecked());

        // Replication controllers select pods by equality only.
        let selector = rc
            .spec
            .and_then(|spec| spec.selector)
            .filter(|labels| !labels.is_empty())
            .map(Selector::from_map);
        self.apply_workload(namespace, wref, selector);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_workload(
            namespace,
            WorkloadRef::new(ResourceKind::ReplicationController, name),
        );
    }
}

/// Converts a workload's label selector. An empty selector or one with an
/// unknown operator selects no pods.
fn pod_selector(selector: LabelSelector) -> Option<Selector> {
    let labels = Selector::from_map(selector.match_labels.unwrap_or_default());
    let exprs = selector
        .match_expressions
        .unwrap_or_default()
        .into_iter()
        .map(|req| {
            let op = match req.operator.as_str() {
                "In" => Operator::In,
                "NotIn" => Operator::NotIn,
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                op => {
                    tracing::warn!(key = %req.key, op, "unsupported label selector operator");
                    return None;
                }
            };
            Some(Expression::new(req.key, op, req.values.unwrap_or_default()))
        })
        .collect::<Option<Vec<_>>>()?;

    let selector = labels.and(Selector::from_expressions(exprs));
    if selector.is_empty() {
        return None;
    }
    Some(selector)
}
