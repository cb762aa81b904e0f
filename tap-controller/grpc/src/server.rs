use crate::{
    api::public::{
        self as api, tap_by_resource_request,
        tap_server::{Tap, TapServer},
    },
    event,
    metrics::{GrpcServerMetricsFamily, ResponseObserver, StreamMetrics},
};
use futures::prelude::*;
use linkerd_tap_controller_core::{
    Clause, DiscoverTargets, End, Error, ObserveTarget, Predicate, Resource, TapEvent, TapRequest,
};
use linkerd_tap_controller_session::{Sessions, TapEvents, Update};

/// Serves tap sessions to CLI and dashboard clients.
#[derive(Clone, Debug)]
pub struct ResourceTapServer<D, O> {
    sessions: Sessions<D, O>,
    drain: drain::Watch,
    metrics: StreamMetrics,
}

type BoxTapStream =
    std::pin::Pin<Box<dyn Stream<Item = Result<api::TapByResourceResponse, tonic::Status>> + Send>>;

impl<D, O> ResourceTapServer<D, O>
where
    D: DiscoverTargets + Clone + Send + Sync + 'static,
    O: ObserveTarget + Clone + Send + Sync + 'static,
{
    pub fn new(
        sessions: Sessions<D, O>,
        drain: drain::Watch,
        metrics: GrpcServerMetricsFamily,
    ) -> Self {
        Self {
            sessions,
            drain,
            metrics: metrics.server_stream_rpc("linkerd2.tap.Tap", "TapByResource"),
        }
    }

    pub fn svc(self) -> TapServer<Self> {
        TapServer::new(self)
    }
}

#[async_trait::async_trait]
impl<D, O> Tap for ResourceTapServer<D, O>
where
    D: DiscoverTargets + Clone + Send + Sync + 'static,
    O: ObserveTarget + Clone + Send + Sync + 'static,
{
    type TapByResourceStream = BoxTapStream;

    async fn tap_by_resource(
        &self,
        req: tonic::Request<api::TapByResourceRequest>,
    ) -> Result<tonic::Response<BoxTapStream>, tonic::Status> {
        let metrics = self.metrics.start();
        let req = request_from_proto(req.into_inner());

        let events = match self.sessions.start(&req).await {
            Ok(events) => events,
            Err(error) => {
                let status = to_status(error);
                metrics.end(status.code());
                return Err(status);
            }
        };

        Ok(tonic::Response::new(response_stream(
            self.drain.clone(),
            events,
            metrics,
        )))
    }
}

fn response_stream(
    drain: drain::Watch,
    mut events: TapEvents,
    metrics: ResponseObserver,
) -> BoxTapStream {
    Box::pin(async_stream::try_stream! {
        // Server shutdown waits for the stream to complete. Sessions end
        // themselves when the server shuts down.
        let _drain = drain;

        while let Some(update) = events.next().await {
            match update {
                Update::Event(ev) => {
                    metrics.msg_sent();
                    yield event_to_proto(ev);
                }
                Update::End(end) => {
                    match end_status(end) {
                        Some(status) => {
                            metrics.end(status.code());
                            Err::<(), _>(status)?;
                        }
                        None if end == End::LimitReached => {
                            metrics.msg_sent();
                            yield end_to_proto();
                        }
                        None => {}
                    }
                    return;
                }
            }
        }
    })
}

/// Sessions that end because of a server-side condition fail the call.
fn end_status(end: End) -> Option<tonic::Status> {
    match end {
        End::ServerShutdown => Some(tonic::Status::unavailable("tap server is shutting down")),
        End::ResolverFailed => Some(tonic::Status::internal("tap target discovery failed")),
        End::LimitReached | End::ClientCancelled => None,
    }
}

fn to_status(error: Error) -> tonic::Status {
    let msg = error.to_string();
    match error {
        Error::InvalidCriteria(_) => tonic::Status::invalid_argument(msg),
        Error::TooManyActiveSessions { .. } => tonic::Status::resource_exhausted(msg),
        Error::ServerShutdown => tonic::Status::unavailable(msg),
        Error::Discovery(_) => tonic::Status::internal(msg),
    }
}

fn request_from_proto(req: api::TapByResourceRequest) -> TapRequest {
    TapRequest {
        clauses: req.clauses.into_iter().map(clause_from_proto).collect(),
        max_rps: req.max_rps,
        limit: req.limit,
    }
}

fn clause_from_proto(clause: tap_by_resource_request::Clause) -> Clause {
    let non_empty = |s: String| Some(s).filter(|s| !s.is_empty());
    Clause {
        source: clause.source.map(resource_from_proto),
        destination: clause.destination.map(resource_from_proto),
        scheme: non_empty(clause.scheme),
        method: non_empty(clause.method),
        authority: clause.authority.and_then(predicate_from_proto),
        path: clause.path.and_then(predicate_from_proto),
    }
}

fn resource_from_proto(res: api::Resource) -> Resource {
    Resource {
        namespace: res.namespace,
        kind: res.r#type,
        name: Some(res.name).filter(|n| !n.is_empty()),
        label_selector: res.label_selector,
    }
}

fn predicate_from_proto(m: api::StringMatch) -> Option<Predicate> {
    use api::string_match::Match;
    match m.r#match? {
        Match::Exact(s) => Some(Predicate::Exact(s)),
        Match::Prefix(s) => Some(Predicate::Prefix(s)),
        Match::Regex(s) => Some(Predicate::Regex(s)),
    }
}

fn event_to_proto(ev: TapEvent) -> api::TapByResourceResponse {
    let namespace = ev.target.namespace.clone();
    let pod = ev.target.name.clone();
    api::TapByResourceResponse {
        kind: Some(api::tap_by_resource_response::Kind::Event(api::Event {
            namespace,
            pod,
            event: Some(event::to_proto(ev)),
        })),
    }
}

fn end_to_proto() -> api::TapByResourceResponse {
    api::TapByResourceResponse {
        kind: Some(api::tap_by_resource_response::Kind::End(api::End {
            reason: api::end::Reason::LimitReached.into(),
        })),
    }
}
