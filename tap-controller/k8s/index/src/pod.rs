use crate::Index;
use k8s_openapi::api::core::v1 as k8s;
use kube::ResourceExt;
use linkerd_tap_controller_core::{labels::Labels, CONTROL_PLANE_NS_LABEL};
use std::net::IpAddr;

/// The tap-relevant state of a pod.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Pod {
    pub(crate) labels: Labels,

    /// Set when the pod is running with an IP, i.e. when its proxy can be
    /// tapped.
    pub(crate) ready_ip: Option<IpAddr>,
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().expect("pod must have a namespace");
        let name = pod.name_unchecked();
        let _span = tracing::info_span!("apply", ns = %namespace, %name).entered();

        // Pods meshed by another control plane are not ours to tap.
        if pod.labels().get(CONTROL_PLANE_NS_LABEL) != Some(&self.control_plane_ns) {
            tracing::debug!("ignoring pod outside of this control plane's mesh");
            <Self as kubert::index::IndexNamespacedResource<k8s::Pod>>::delete(
                self, namespace, name,
            );
            return;
        }

        let ready_ip = pod
            .status
            .as_ref()
            .filter(|status| status.phase.as_deref() == Some("Running"))
            .and_then(|status| status.pod_ip.as_deref())
            .and_then(|ip| match ip.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(error) => {
                    tracing::warn!(%error, ip, "invalid pod IP");
                    None
                }
            });

        let new = Pod {
            labels: pod.metadata.labels.into(),
            ready_ip,
        };

        let ns = self.ns_or_default(namespace.clone());
        if ns.pods.get(&name) == Some(&new) {
            tracing::trace!("unchanged");
            return;
        }
        tracing::debug!(ip = ?new.ready_ip, "indexed");
        ns.pods.insert(name, new);
        self.reindex(&namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let removed = self
            .namespaces
            .get_mut(&namespace)
            .and_then(|ns| ns.pods.remove(&name));
        if removed.is_some() {
            tracing::debug!(ns = %namespace, %name, "pod deleted");
            self.reindex(&namespace);
        }
    }
}
