#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error;
pub mod event;
pub mod labels;
pub mod match_;
pub mod request;
pub mod selection;
mod target;

pub use self::{
    error::{BoxError, End, Error, TargetError},
    event::{Direction, Eos, EventKind, StreamId, TapEvent},
    match_::{HttpMatch, Match, StringMatch},
    request::{Clause, ClauseMatch, Criteria, Predicate, Resource, TapRequest},
    selection::{ResourceKind, ResourceSelection},
    target::{Target, TargetId, TargetSet, TargetState},
};
use futures::prelude::*;
use std::{pin::Pin, sync::Arc};

/// Models a stream of target-set snapshots for a single resource selection.
///
/// The first item reflects the selection's state when the watch was
/// established. Dropping the stream releases the subscription.
pub type TargetStream = Pin<Box<dyn Stream<Item = Arc<TargetSet>> + Send + 'static>>;

/// Models the decoded event feed from a single proxy tap stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<TapEvent, TargetError>> + Send + 'static>>;

/// The label set on meshed pods that names their control plane namespace.
pub const CONTROL_PLANE_NS_LABEL: &str = "linkerd.io/control-plane-ns";

/// Parameters sent to a proxy when a tap stream is opened.
#[derive(Clone, Debug, PartialEq)]
pub struct ObserveRequest {
    /// Predicates the proxy evaluates before emitting events. `None` taps
    /// everything.
    pub matches: Option<Match>,

    /// The number of requests the proxy may tap before ending the stream.
    /// Zero leaves the stream unbounded.
    pub limit: u32,
}

/// Resolves resource selections to live sets of tap targets.
#[async_trait::async_trait]
pub trait DiscoverTargets {
    async fn watch_targets(&self, selection: &ResourceSelection) -> anyhow::Result<TargetStream>;
}

/// Opens a tap stream on a single proxy.
#[async_trait::async_trait]
pub trait ObserveTarget {
    async fn observe(
        &self,
        target: &Target,
        req: ObserveRequest,
    ) -> Result<EventStream, TargetError>;
}
