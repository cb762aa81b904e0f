use crate::{labels::Selector, Error};

/// The kinds of resources a tap may be scoped to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Namespace,
    Pod,
    Service,
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    ReplicaSet,
    ReplicationController,
}

/// Identifies a set of pods by resource.
///
/// When `name` is set, the selection refers to exactly one object of `kind`;
/// otherwise it refers to every object of `kind` in the namespace. In both
/// cases the resulting pods are further filtered by `selector`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceSelection {
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: Option<String>,
    pub selector: Selector,
}

// === impl ResourceKind ===

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::Pod => "pod",
            Self::Service => "service",
            Self::Deployment => "deployment",
            Self::StatefulSet => "statefulset",
            Self::DaemonSet => "daemonset",
            Self::Job => "job",
            Self::ReplicaSet => "replicaset",
            Self::ReplicationController => "replicationcontroller",
        }
    }

    /// The proxy metadata label that names a resource of this kind, if any.
    pub fn destination_label(&self) -> &'static str {
        self.as_str()
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ns" | "namespace" | "namespaces" => Ok(Self::Namespace),
            "po" | "pod" | "pods" => Ok(Self::Pod),
            "svc" | "service" | "services" => Ok(Self::Service),
            "deploy" | "deployment" | "deployments" => Ok(Self::Deployment),
            "sts" | "statefulset" | "statefulsets" => Ok(Self::StatefulSet),
            "ds" | "daemonset" | "daemonsets" => Ok(Self::DaemonSet),
            "job" | "jobs" => Ok(Self::Job),
            "rs" | "replicaset" | "replicasets" => Ok(Self::ReplicaSet),
            "rc" | "replicationcontroller" | "replicationcontrollers" => {
                Ok(Self::ReplicationController)
            }
            _ => Err(Error::invalid(format_args!("unsupported resource kind: {s}"))),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl ResourceSelection ===

impl ResourceSelection {
    pub fn new(namespace: impl ToString, kind: ResourceKind, name: Option<String>) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind,
            name,
            selector: Selector::default(),
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }
}

impl std::fmt::Display for ResourceSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}/{}.{}", self.kind, name, self.namespace),
            None => write!(f, "{}/*.{}", self.kind, self.namespace),
        }
    }
}
