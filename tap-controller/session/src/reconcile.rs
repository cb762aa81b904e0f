use crate::{
    client::{Open, Report, TargetHandle},
    metrics::SessionMetrics,
    resolve::{Change, Member, Resolution},
    Config,
};
use futures::{future::BoxFuture, prelude::*, stream::FuturesUnordered};
use linkerd_tap_controller_core::{
    Criteria, ObserveRequest, ObserveTarget, TapEvent, Target, TargetId, TargetState,
};
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// A point-in-time view of a session's targets.
pub type Snapshot = BTreeMap<TargetId, TargetStatus>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TargetStatus {
    pub addr: SocketAddr,
    pub state: TargetState,
}

/// Owns a session's target set.
///
/// All membership and lifecycle transitions are applied by a single task, so
/// that readers always observe a consistent snapshot.
pub(crate) struct Reconciler<O> {
    criteria: Arc<Criteria>,
    observe: O,
    config: Arc<Config>,
    events: mpsc::Sender<TapEvent>,
    reports_tx: mpsc::UnboundedSender<Report>,
    reports_rx: mpsc::UnboundedReceiver<Report>,
    targets: BTreeMap<TargetId, Entry>,

    /// Streams for removed targets that are still being closed.
    closing: FuturesUnordered<BoxFuture<'static, ()>>,
    snapshot: watch::Sender<Arc<Snapshot>>,
    generation: u64,
    metrics: SessionMetrics,
}

struct Entry {
    target: Target,
    generation: u64,
    state: TargetState,
    handle: TargetHandle,
}

// === impl Reconciler ===

impl<O> Reconciler<O>
where
    O: ObserveTarget + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        criteria: Arc<Criteria>,
        observe: O,
        config: Arc<Config>,
        events: mpsc::Sender<TapEvent>,
        snapshot: watch::Sender<Arc<Snapshot>>,
        metrics: SessionMetrics,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            criteria,
            observe,
            config,
            events,
            reports_tx,
            reports_rx,
            targets: BTreeMap::new(),
            closing: FuturesUnordered::new(),
            snapshot,
            generation: 0,
            metrics,
        }
    }

    /// Opens a stream to each resolved target and applies membership changes
    /// until the session is cancelled.
    ///
    /// Returns early if discovery fails. Every target stream is closed and all
    /// discovery subscriptions are released before this returns.
    pub(crate) async fn run(mut self, mut resolution: Resolution, cancel: CancellationToken) {
        let initial = resolution.members().values().cloned().collect::<Vec<_>>();
        for member in initial {
            self.add(member, &cancel);
        }
        self.publish();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(report) = self.reports_rx.recv() => self.report(report),

                Some(()) = self.closing.next(), if !self.closing.is_empty() => {}

                changes = resolution.changes() => match changes {
                    Some(changes) => self.apply(changes, &cancel),
                    None => {
                        tracing::error!("target discovery failed; ending session");
                        break;
                    }
                },
            }

            self.publish();
        }

        self.close_all().await;
        resolution.release();
    }

    fn add(&mut self, Member { target, clauses }: Member, cancel: &CancellationToken) {
        let matches = self.criteria.match_for(&clauses);
        let request = ObserveRequest {
            matches: matches.pushdown(),
            limit: 0,
        };
        let local = matches.has_regex().then_some(matches);

        self.generation += 1;
        let handle = Open {
            observe: self.observe.clone(),
            target: target.clone(),
            generation: self.generation,
            request,
            local,
            connect_timeout: self.config.connect_timeout,
            close_timeout: self.config.close_timeout,
            events: self.events.clone(),
            reports: self.reports_tx.clone(),
            metrics: self.metrics.clone(),
        }
        .spawn(cancel);

        tracing::debug!(target = %target.id, addr = %target.addr, "added");
        let prior = self.targets.insert(
            target.id.clone(),
            Entry {
                target,
                generation: self.generation,
                state: TargetState::Pending,
                handle,
            },
        );
        debug_assert!(prior.is_none(), "targets must be removed before being replaced");
    }

    /// Applies a batch of membership changes. Removed targets are closed in
    /// the background so that the batch never waits on a slow stream.
    fn apply(&mut self, changes: Vec<Change>, cancel: &CancellationToken) {
        for change in changes {
            match change {
                Change::Added(member) => self.add(member, cancel),
                Change::Removed(id) => self.remove(&id),
            }
        }
    }

    fn remove(&mut self, id: &TargetId) {
        if let Some(mut entry) = self.targets.remove(id) {
            entry.state = TargetState::Removed;
            tracing::debug!(target = %id, "removed");
            self.closing.push(
                async move {
                    entry.handle.close().await;
                }
                .boxed(),
            );
        }
    }

    fn report(&mut self, report: Report) {
        match report {
            Report::Opened { id, generation } => {
                if self.transition(&id, generation, TargetState::Streaming) {
                    self.metrics.target_opened();
                }
            }
            Report::Failed {
                id,
                generation,
                error,
            } => {
                if self.transition(&id, generation, TargetState::Failed) {
                    self.metrics.target_failed(error.as_str());
                    tracing::warn!(target = %id, %error, "target stream failed; continuing without it");
                }
            }
        }
    }

    /// Moves a target to `state` if it has not been replaced since the given
    /// generation was opened. Only pending targets may begin streaming.
    fn transition(&mut self, id: &TargetId, generation: u64, state: TargetState) -> bool {
        let Some(entry) = self
            .targets
            .get_mut(id)
            .filter(|entry| entry.generation == generation)
        else {
            return false;
        };
        if state == TargetState::Streaming && entry.state != TargetState::Pending {
            return false;
        }
        entry.state = state;
        true
    }

    async fn close_all(&mut self) {
        let removed = std::mem::take(&mut self.closing);
        future::join(
            future::join_all(
                self.targets
                    .values_mut()
                    .map(|entry| entry.handle.close()),
            ),
            removed.collect::<()>(),
        )
        .await;

        for entry in self.targets.values_mut() {
            entry.state = TargetState::Removed;
        }
        self.publish();
        tracing::debug!(targets = self.targets.len(), "closed");
        self.targets.clear();
    }

    fn publish(&self) {
        let snapshot = self
            .targets
            .iter()
            .map(|(id, entry)| {
                let status = TargetStatus {
                    addr: entry.target.addr,
                    state: entry.state,
                };
                (id.clone(), status)
            })
            .collect();
        self.snapshot.send_replace(Arc::new(snapshot));
    }
}
