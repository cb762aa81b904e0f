//! Linkerd Tap Controller Index
//!
//! The index maintains a per-namespace view of meshed pods and of the
//! workloads that select them, so that tap requests scoped to a resource can
//! be resolved to the set of proxies that must be tapped. It watches the
//! following cluster resources:
//!
//! - Each `Pod` meshed by this control plane is a potential tap target. Only
//!   running pods with an IP are targets; their tap endpoint is the pod IP and
//!   the proxy's tap port.
//! - `Service`, `Deployment`, `StatefulSet`, `DaemonSet`, `ReplicaSet`, `Job`,
//!   and `ReplicationController` resources select pods by label. A tap on one
//!   of these resources targets every pod it selects.
//!
//! ```text
//! [ Workload | Service ] -> selector -> [ Pod ] -> [ Target ]
//! ```
//!
//! Lookups are modeled as subscriptions: each distinct resource selection is
//! backed by a single watch that is recomputed whenever its namespace changes.
//! Subscriptions are dropped from the index once all of their receivers are
//! gone.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod pod;
mod workload;

#[cfg(test)]
mod tests;

use self::{pod::Pod, workload::WorkloadRef};
use ahash::AHashMap as HashMap;
use linkerd_tap_controller_core::{
    labels::Selector, ResourceKind, ResourceSelection, Target, TargetId, TargetSet,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Watches a resource selection's tap targets.
pub type TargetsRx = watch::Receiver<Arc<TargetSet>>;

type TargetsTx = watch::Sender<Arc<TargetSet>>;

/// Holds all indexing state. Updated by the tasks that process watch events
/// and read by the tap server when sessions subscribe to selections.
#[derive(Debug)]
pub struct Index {
    /// The port on which proxies serve the tap API.
    tap_port: u16,

    /// Pods are only tapped when their `linkerd.io/control-plane-ns` label
    /// names this namespace.
    control_plane_ns: String,

    namespaces: HashMap<String, Namespace>,

    subscriptions: HashMap<ResourceSelection, TargetsTx>,
}

#[derive(Debug, Default)]
struct Namespace {
    pods: HashMap<String, Pod>,

    /// Pod selectors for workloads in this namespace. A workload whose
    /// selector could not be interpreted selects no pods.
    workloads: HashMap<WorkloadRef, Option<Selector>>,
}

// === impl Index ===

impl Index {
    pub fn shared(tap_port: u16, control_plane_ns: impl ToString) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            tap_port,
            control_plane_ns: control_plane_ns.to_string(),
            namespaces: HashMap::default(),
            subscriptions: HashMap::default(),
        }))
    }

    /// Subscribes to updates for the targets that match `selection`.
    ///
    /// The returned receiver's current value reflects the index's current
    /// state.
    pub fn subscribe(&mut self, selection: &ResourceSelection) -> TargetsRx {
        if let Some(tx) = self.subscriptions.get(selection) {
            if !tx.is_closed() {
                return tx.subscribe();
            }
        }

        let (tx, rx) = watch::channel(Arc::new(self.targets(selection)));
        tracing::debug!(%selection, "new subscription");
        self.subscriptions.insert(selection.clone(), tx);
        rx
    }

    /// Computes the current set of targets for `selection`.
    pub fn targets(&self, selection: &ResourceSelection) -> TargetSet {
        let Some(ns) = self.namespaces.get(&selection.namespace) else {
            return TargetSet::default();
        };

        ns.pods
            .iter()
            .filter(|(name, pod)| {
                ns.selects(selection, name, pod) && selection.selector.matches(&pod.labels)
            })
            .filter_map(|(name, pod)| {
                let ip = pod.ready_ip?;
                let id = TargetId::new(&selection.namespace, name);
                let target = Target {
                    id: id.clone(),
                    addr: (ip, self.tap_port).into(),
                };
                Some((id, target))
            })
            .collect()
    }

    fn ns_or_default(&mut self, ns: String) -> &mut Namespace {
        self.namespaces.entry(ns).or_default()
    }

    /// Recomputes every subscription in `namespace`, publishing changes and
    /// dropping subscriptions that no longer have receivers.
    fn reindex(&mut self, namespace: &str) {
        self.subscriptions.retain(|_, tx| !tx.is_closed());

        let updates = self
            .subscriptions
            .keys()
            .filter(|sel| sel.namespace == namespace)
            .map(|sel| (sel.clone(), self.targets(sel)))
            .collect::<Vec<_>>();

        for (sel, targets) in updates {
            if let Some(tx) = self.subscriptions.get(&sel) {
                tx.send_if_modified(|current| {
                    if **current == targets {
                        return false;
                    }
                    tracing::debug!(selection = %sel, targets = targets.len(), "updated");
                    *current = Arc::new(targets);
                    true
                });
            }
        }

        if let Some(ns) = self.namespaces.get(namespace) {
            if ns.pods.is_empty() && ns.workloads.is_empty() {
                self.namespaces.remove(namespace);
            }
        }
    }
}

// === impl Namespace ===

impl Namespace {
    /// Returns true if the pod named `name` belongs to the selection's resource.
    fn selects(&self, selection: &ResourceSelection, name: &str, pod: &Pod) -> bool {
        match (selection.kind, selection.name.as_deref()) {
            (ResourceKind::Namespace, _) | (ResourceKind::Pod, None) => true,
            (ResourceKind::Pod, Some(pod_name)) => pod_name == name,
            (kind, Some(workload)) => self
                .workloads
                .get(&WorkloadRef::new(kind, workload))
                .and_then(Option::as_ref)
                .map(|sel| sel.matches(&pod.labels))
                .unwrap_or(false),
            (kind, None) => self.workloads.iter().any(|(wref, sel)| {
                wref.kind == kind
                    && sel
                        .as_ref()
                        .map(|sel| sel.matches(&pod.labels))
                        .unwrap_or(false)
            }),
        }
    }
}
