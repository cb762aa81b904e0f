//! Runs tap sessions.
//!
//! A session resolves its criteria to a set of proxies, opens a tap stream on
//! each, and merges their events into a single bounded, rate-limited output.
//! Target membership is tracked for the life of the session: streams are
//! opened as targets appear and closed as they disappear. A failure on one
//! target never ends the session.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
pub mod metrics;
mod mux;
mod output;
mod reconcile;
pub mod registry;
mod resolve;

pub use self::{
    metrics::SessionMetrics,
    reconcile::{Snapshot, TargetStatus},
    registry::{Registry, SessionId},
};
use self::{mux::Multiplexer, reconcile::Reconciler, resolve::Resolver};
use futures::prelude::*;
use linkerd_tap_controller_core::{
    DiscoverTargets, End, Error, ObserveTarget, TapEvent, TapRequest,
};
use std::{
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Duration,
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::Instrument;

#[derive(Clone, Debug)]
pub struct Config {
    /// The maximum number of concurrently active sessions.
    pub max_sessions: usize,

    /// The maximum number of events a session may deliver. Requests without a
    /// limit are bounded by this value.
    pub max_limit: u32,

    /// The number of events buffered for each caller. When a caller does not
    /// keep up, its oldest buffered events are dropped.
    pub event_buffer: usize,

    /// The number of events buffered between a session's targets and its
    /// multiplexer.
    pub fan_in_capacity: usize,

    pub connect_timeout: Duration,
    pub close_timeout: Duration,

    /// How long shutdown waits for sessions to end before aborting them.
    pub shutdown_grace: Duration,
}

/// Starts tap sessions.
#[derive(Clone, Debug)]
pub struct Sessions<D, O> {
    config: Arc<Config>,
    resolver: Resolver<D>,
    observe: O,
    registry: Registry,
    metrics: SessionMetrics,
}

/// The output of a running session.
///
/// Yields tap events followed by exactly one [`Update::End`]. Dropping it
/// cancels the session.
#[derive(Debug)]
pub struct TapEvents {
    id: SessionId,
    events: output::Receiver,
    end: Option<oneshot::Receiver<End>>,
    targets: watch::Receiver<Arc<Snapshot>>,
    metrics: SessionMetrics,
}

#[derive(Debug)]
pub enum Update {
    Event(TapEvent),
    End(End),
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            max_limit: 10_000,
            event_buffer: 1_000,
            fan_in_capacity: 1_000,
            connect_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

// === impl Sessions ===

impl<D, O> Sessions<D, O>
where
    D: DiscoverTargets + Send + Sync,
    O: ObserveTarget + Clone + Send + Sync + 'static,
{
    pub fn new(config: Config, discover: D, observe: O, metrics: SessionMetrics) -> Self {
        let registry = Registry::new(config.max_sessions, metrics.clone());
        Self {
            config: Arc::new(config),
            resolver: Resolver::new(discover),
            observe,
            registry,
            metrics,
        }
    }

    /// Validates the request, resolves its targets, and begins streaming.
    ///
    /// Fails without side effects if the criteria are invalid, if too many
    /// sessions are active, if the server is shutting down, or if targets
    /// cannot be resolved. Once started, a session only ends by reporting an
    /// [`End`].
    pub async fn start(&self, req: &TapRequest) -> Result<TapEvents, Error> {
        let criteria = req
            .validate(self.config.max_limit)
            .inspect_err(|_| self.metrics.session_rejected("invalid"))?;
        let registration = self.registry.register()?;
        let id = registration.id();
        let span = tracing::info_span!("session", %id);

        let resolution = self
            .resolver
            .resolve(&criteria)
            .instrument(span.clone())
            .await
            .inspect_err(|error| {
                tracing::warn!(session = %id, %error, "failed to resolve tap targets");
                self.metrics.session_rejected("discovery");
            })?;
        let initial = resolution.members().len();

        let (fan_in_tx, fan_in_rx) = mpsc::channel(self.config.fan_in_capacity);
        let (events_tx, events_rx) = output::channel(self.config.event_buffer);
        let (targets_tx, targets_rx) = watch::channel(Arc::new(Snapshot::new()));
        let (end_tx, end_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let criteria = Arc::new(criteria);
        let reconciler = Reconciler::new(
            criteria.clone(),
            self.observe.clone(),
            self.config.clone(),
            fan_in_tx,
            targets_tx,
            self.metrics.clone(),
        );
        let reconciler = AbortOnDropHandle::new(tokio::spawn(
            reconciler
                .run(resolution, cancel.clone())
                .instrument(span.clone()),
        ));

        let mux = Multiplexer::new(
            fan_in_rx,
            events_tx,
            criteria.max_rps(),
            criteria.limit(),
            self.metrics.clone(),
        );
        let task = tokio::spawn(
            mux.run(registration, reconciler, cancel, end_tx)
                .instrument(span),
        );
        self.registry.track(id, task.abort_handle());

        self.metrics.session_started();
        tracing::info!(
            session = %id,
            clauses = criteria.clauses().len(),
            targets = initial,
            max_rps = criteria.max_rps(),
            limit = criteria.limit(),
            "tap session started"
        );

        Ok(TapEvents {
            id,
            events: events_rx,
            end: Some(end_rx),
            targets: targets_rx,
            metrics: self.metrics.clone(),
        })
    }

    /// Ends all sessions and rejects new ones.
    pub async fn shutdown(&self) {
        self.registry.shutdown(self.config.shutdown_grace).await
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

// === impl TapEvents ===

impl TapEvents {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Watches the state of each of the session's targets.
    pub fn targets(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.targets.clone()
    }
}

impl Stream for TapEvents {
    type Item = Update;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Update>> {
        let this = self.get_mut();

        // The session closes its event channel before reporting its end, so
        // every delivered event precedes the end.
        if let Some(ev) = ready!(this.events.poll_recv(cx)) {
            this.metrics.event_emitted();
            return Poll::Ready(Some(Update::Event(ev)));
        }

        let Some(end) = this.end.as_mut() else {
            return Poll::Ready(None);
        };
        // If the session's task was aborted, it was abandoned during shutdown.
        let end = ready!(end.poll_unpin(cx)).unwrap_or(End::ServerShutdown);
        this.end = None;
        Poll::Ready(Some(Update::End(end)))
    }
}
