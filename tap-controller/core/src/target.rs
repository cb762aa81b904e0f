use std::{collections::BTreeMap, net::SocketAddr};

/// Identifies a tapped pod.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId {
    pub namespace: String,
    pub name: String,
}

/// A proxy tap endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    pub id: TargetId,
    pub addr: SocketAddr,
}

pub type TargetSet = BTreeMap<TargetId, Target>;

/// The lifecycle of a target within a session.
///
/// `Pending -> Streaming -> {Failed, Removed}`. A target may also fail or be
/// removed before it begins streaming.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetState {
    Pending,
    Streaming,
    Failed,
    Removed,
}

// === impl TargetId ===

impl TargetId {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl TargetState ===

impl TargetState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Removed)
    }
}
