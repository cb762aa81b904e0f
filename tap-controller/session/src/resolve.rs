use futures::{prelude::*, stream::SelectAll};
use linkerd_tap_controller_core::{
    Criteria, DiscoverTargets, Error, ResourceSelection, Target, TargetId, TargetSet,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    pin::Pin,
    sync::Arc,
};

/// Resolves a session's criteria to the set of targets that must be tapped.
#[derive(Clone, Debug)]
pub(crate) struct Resolver<D> {
    discover: D,
}

/// A target and the clauses that selected it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Member {
    pub(crate) target: Target,
    pub(crate) clauses: BTreeSet<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Change {
    Added(Member),
    Removed(TargetId),
}

/// Holds a session's discovery subscriptions.
///
/// Membership is the union of every subscription's targets. Dropping or
/// releasing the resolution releases all subscriptions.
pub(crate) struct Resolution {
    /// The clauses served by each subscription.
    clauses: Vec<BTreeSet<usize>>,

    /// The most recent target set for each subscription.
    snapshots: Vec<Arc<TargetSet>>,

    members: BTreeMap<TargetId, Member>,

    /// Yields `(subscription, snapshot)` updates; a `None` snapshot indicates
    /// that the subscription ended.
    updates: SelectAll<Updates>,
}

type Updates = Pin<Box<dyn Stream<Item = (usize, Option<Arc<TargetSet>>)> + Send + 'static>>;

// === impl Resolver ===

impl<D: DiscoverTargets> Resolver<D> {
    pub(crate) fn new(discover: D) -> Self {
        Self { discover }
    }

    /// Subscribes to each distinct tapped selection in `criteria` and waits
    /// for the initial state of each.
    ///
    /// Clauses that tap the same selection share a subscription. A selection
    /// that matches no targets is not an error.
    pub(crate) async fn resolve(&self, criteria: &Criteria) -> Result<Resolution, Error> {
        let mut by_selection = BTreeMap::<&ResourceSelection, BTreeSet<usize>>::new();
        for (i, clause) in criteria.clauses().iter().enumerate() {
            by_selection.entry(&clause.tapped).or_default().insert(i);
        }

        let mut clauses = Vec::with_capacity(by_selection.len());
        let mut snapshots = Vec::with_capacity(by_selection.len());
        let mut updates = SelectAll::new();
        for (selection, selected) in by_selection {
            let mut stream = self.discover.watch_targets(selection).await?;
            let initial = stream.next().await.ok_or_else(|| {
                Error::Discovery(anyhow::anyhow!(
                    "discovery ended before resolving {selection}"
                ))
            })?;
            tracing::debug!(%selection, targets = initial.len(), "resolved");

            let i = clauses.len();
            clauses.push(selected);
            snapshots.push(initial);
            updates.push(Box::pin(
                stream
                    .map(Some)
                    .chain(stream::once(future::ready(None)))
                    .map(move |update| (i, update)),
            ) as Updates);
        }

        let members = union(&clauses, &snapshots);
        Ok(Resolution {
            clauses,
            snapshots,
            members,
            updates,
        })
    }
}

// === impl Resolution ===

impl Resolution {
    pub(crate) fn members(&self) -> &BTreeMap<TargetId, Member> {
        &self.members
    }

    /// Waits for membership to change.
    ///
    /// Returns `None` if any subscription ends, after which membership can no
    /// longer be tracked. This method is cancel-safe.
    pub(crate) async fn changes(&mut self) -> Option<Vec<Change>> {
        loop {
            let (i, snapshot) = self.updates.next().await?;
            let Some(snapshot) = snapshot else {
                tracing::warn!(subscription = i, "discovery subscription ended");
                return None;
            };
            self.snapshots[i] = snapshot;

            let members = union(&self.clauses, &self.snapshots);
            let changes = diff(&self.members, &members);
            self.members = members;
            if !changes.is_empty() {
                return Some(changes);
            }
        }
    }

    /// Releases all discovery subscriptions.
    pub(crate) fn release(self) {
        tracing::debug!(subscriptions = self.clauses.len(), "releasing");
        drop(self.updates);
    }
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("clauses", &self.clauses)
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

fn union(clauses: &[BTreeSet<usize>], snapshots: &[Arc<TargetSet>]) -> BTreeMap<TargetId, Member> {
    let mut members = BTreeMap::<TargetId, Member>::new();
    for (selected, snapshot) in clauses.iter().zip(snapshots) {
        for (id, target) in snapshot.iter() {
            members
                .entry(id.clone())
                .and_modify(|m| {
                    m.target = target.clone();
                    m.clauses.extend(selected.iter().copied());
                })
                .or_insert_with(|| Member {
                    target: target.clone(),
                    clauses: selected.clone(),
                });
        }
    }
    members
}

/// Describes how to get from `old` to `new`. A member whose address or
/// clauses changed is removed and added again.
fn diff(old: &BTreeMap<TargetId, Member>, new: &BTreeMap<TargetId, Member>) -> Vec<Change> {
    let mut changes = Vec::new();
    for id in old.keys() {
        if !new.contains_key(id) {
            changes.push(Change::Removed(id.clone()));
        }
    }
    for (id, member) in new {
        match old.get(id) {
            None => changes.push(Change::Added(member.clone())),
            Some(prior) if prior != member => {
                changes.push(Change::Removed(id.clone()));
                changes.push(Change::Added(member.clone()));
            }
            Some(_) => {}
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_tap_controller_core::{Clause, ResourceKind, TapRequest, TargetStream};
    use parking_lot::Mutex;
    use tokio::sync::watch;
    use tokio_stream::wrappers::WatchStream;

    #[derive(Clone, Default)]
    struct Discover(Arc<Mutex<BTreeMap<ResourceSelection, watch::Sender<Arc<TargetSet>>>>>);

    #[async_trait::async_trait]
    impl DiscoverTargets for Discover {
        async fn watch_targets(
            &self,
            selection: &ResourceSelection,
        ) -> anyhow::Result<TargetStream> {
            let rx = self
                .0
                .lock()
                .entry(selection.clone())
                .or_insert_with(|| watch::channel(Default::default()).0)
                .subscribe();
            Ok(Box::pin(WatchStream::new(rx)))
        }
    }

    impl Discover {
        fn set(&self, selection: &ResourceSelection, targets: &[(&str, [u8; 4])]) {
            let targets = targets
                .iter()
                .map(|(name, ip)| {
                    let id = TargetId::new(&selection.namespace, name);
                    let target = Target {
                        id: id.clone(),
                        addr: (*ip, 4190).into(),
                    };
                    (id, target)
                })
                .collect::<TargetSet>();
            self.0
                .lock()
                .entry(selection.clone())
                .or_insert_with(|| watch::channel(Default::default()).0)
                .send_replace(Arc::new(targets));
        }

        fn end(&self, selection: &ResourceSelection) {
            self.0.lock().remove(selection);
        }

        fn subscriptions(&self) -> usize {
            self.0
                .lock()
                .values()
                .map(|tx| tx.receiver_count())
                .sum()
        }
    }

    fn deploy(name: &str) -> linkerd_tap_controller_core::Resource {
        linkerd_tap_controller_core::Resource {
            namespace: "ns".to_string(),
            kind: "deploy".to_string(),
            name: Some(name.to_string()),
            label_selector: String::new(),
        }
    }

    fn criteria(sources: &[&str]) -> Criteria {
        TapRequest {
            clauses: sources
                .iter()
                .map(|name| Clause {
                    source: Some(deploy(name)),
                    ..Default::default()
                })
                .collect(),
            max_rps: 100.0,
            limit: 0,
        }
        .validate(100)
        .expect("criteria must be valid")
    }

    fn selection(name: &str) -> ResourceSelection {
        ResourceSelection::new("ns", ResourceKind::Deployment, Some(name.to_string()))
    }

    #[tokio::test]
    async fn resolves_union_of_clauses() {
        let discover = Discover::default();
        discover.set(&selection("web"), &[("web-0", [10, 0, 0, 1]), ("shared", [10, 0, 0, 9])]);
        discover.set(&selection("api"), &[("api-0", [10, 0, 0, 2]), ("shared", [10, 0, 0, 9])]);

        let resolution = Resolver::new(discover.clone())
            .resolve(&criteria(&["web", "api", "web"]))
            .await
            .expect("must resolve");

        // Overlapping clauses share a subscription.
        assert_eq!(discover.subscriptions(), 2);

        let members = resolution.members();
        assert_eq!(members.len(), 3);
        assert_eq!(
            members[&TargetId::new("ns", "web-0")].clauses,
            BTreeSet::from([0, 2])
        );
        assert_eq!(
            members[&TargetId::new("ns", "shared")].clauses,
            BTreeSet::from([0, 1, 2])
        );

        resolution.release();
        assert_eq!(discover.subscriptions(), 0);
    }

    #[tokio::test]
    async fn empty_selection_is_not_an_error() {
        let discover = Discover::default();
        let resolution = Resolver::new(discover)
            .resolve(&criteria(&["web"]))
            .await
            .expect("must resolve");
        assert!(resolution.members().is_empty());
    }

    #[tokio::test]
    async fn reports_membership_changes() {
        let discover = Discover::default();
        discover.set(&selection("web"), &[("web-0", [10, 0, 0, 1]), ("web-1", [10, 0, 0, 2])]);
        let mut resolution = Resolver::new(discover.clone())
            .resolve(&criteria(&["web"]))
            .await
            .expect("must resolve");

        // web-0 is deleted, web-1 is rescheduled, and web-2 is added.
        discover.set(&selection("web"), &[("web-1", [10, 0, 0, 3]), ("web-2", [10, 0, 0, 4])]);
        let changes = resolution.changes().await.expect("must change");
        let member = |name: &str, ip: [u8; 4]| Member {
            target: Target {
                id: TargetId::new("ns", name),
                addr: (ip, 4190).into(),
            },
            clauses: [0].into_iter().collect(),
        };
        assert_eq!(
            changes,
            vec![
                Change::Removed(TargetId::new("ns", "web-0")),
                Change::Removed(TargetId::new("ns", "web-1")),
                Change::Added(member("web-1", [10, 0, 0, 3])),
                Change::Added(member("web-2", [10, 0, 0, 4])),
            ]
        );

        discover.end(&selection("web"));
        assert_eq!(resolution.changes().await, None);
    }
}
