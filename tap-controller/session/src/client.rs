use crate::metrics::{DropReason, SessionMetrics};
use futures::prelude::*;
use linkerd_tap_controller_core::{
    Eos, EventKind, Match, ObserveRequest, ObserveTarget, StreamId, TapEvent, Target, TargetError,
    TargetId,
};
use std::collections::BTreeSet;
use tokio::{
    sync::mpsc,
    time::{self, Duration},
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::Instrument;

/// The maximum number of in-flight requests a local filter tracks per target.
const MAX_ADMITTED: usize = 10_000;

/// Owns a target's tap stream task.
///
/// The task is aborted if the handle is dropped without being closed.
#[derive(Debug)]
pub(crate) struct TargetHandle {
    cancel: CancellationToken,
    task: Option<AbortOnDropHandle<()>>,
    close_timeout: Duration,
}

/// Lifecycle notifications from a target's stream task.
#[derive(Debug)]
pub(crate) enum Report {
    Opened {
        id: TargetId,
        generation: u64,
    },
    Failed {
        id: TargetId,
        generation: u64,
        error: TargetError,
    },
}

/// Parameters for a single target stream.
#[derive(Debug)]
pub(crate) struct Open<O> {
    pub(crate) observe: O,
    pub(crate) target: Target,

    /// Distinguishes this stream from earlier streams to the same target.
    pub(crate) generation: u64,
    pub(crate) request: ObserveRequest,

    /// Predicates that must be evaluated locally because the proxy cannot.
    pub(crate) local: Option<Match>,
    pub(crate) connect_timeout: Duration,
    pub(crate) close_timeout: Duration,
    pub(crate) events: mpsc::Sender<TapEvent>,
    pub(crate) reports: mpsc::UnboundedSender<Report>,
    pub(crate) metrics: SessionMetrics,
}

/// Tracks requests admitted by a local filter so that their subsequent
/// events are forwarded.
///
/// A request is forgotten when its response ends, when it is reset before a
/// response, or when too many newer requests are in flight.
#[derive(Debug)]
struct LocalFilter {
    matches: Match,
    admitted: BTreeSet<StreamId>,
}

// === impl Open ===

impl<O> Open<O>
where
    O: ObserveTarget + Send + Sync + 'static,
{
    /// Spawns the stream task. The task ends when `cancel` fires, when the
    /// stream fails, or when the handle is closed.
    pub(crate) fn spawn(self, cancel: &CancellationToken) -> TargetHandle {
        let cancel = cancel.child_token();
        let close_timeout = self.close_timeout;
        let span = tracing::info_span!("target", id = %self.target.id, addr = %self.target.addr);
        let task = tokio::spawn(self.run(cancel.clone()).instrument(span));
        TargetHandle {
            cancel,
            task: Some(AbortOnDropHandle::new(task)),
            close_timeout,
        }
    }

    async fn run(self, cancel: CancellationToken) {
        let Self {
            observe,
            target,
            generation,
            request,
            local,
            connect_timeout,
            events,
            reports,
            metrics,
            ..
        } = self;

        let connect = time::timeout(connect_timeout, observe.observe(&target, request));
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            res = connect => res.unwrap_or_else(|elapsed| Err(TargetError::dial(target.addr, elapsed))),
        };
        let mut stream = match res {
            Ok(stream) => stream,
            Err(error) => {
                let _ = reports.send(Report::Failed {
                    id: target.id,
                    generation,
                    error,
                });
                return;
            }
        };
        tracing::debug!("streaming");
        let _ = reports.send(Report::Opened {
            id: target.id.clone(),
            generation,
        });

        let mut filter = local.map(LocalFilter::new);
        let error = loop {
            let ev = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("closed");
                    return;
                }
                next = stream.next() => match next {
                    Some(Ok(ev)) => ev,
                    Some(Err(error)) => break error,
                    None => break TargetError::broken("tap stream closed by proxy"),
                },
            };

            if let Some(filter) = filter.as_mut() {
                if !filter.admit(&ev) {
                    continue;
                }
            }

            // Tap never applies backpressure to proxies; the event is dropped
            // when the session cannot keep up.
            match events.try_send(ev) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics.event_dropped(DropReason::FanInFull);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        };

        let _ = reports.send(Report::Failed {
            id: target.id,
            generation,
            error,
        });
    }
}

// === impl TargetHandle ===

impl TargetHandle {
    /// Stops the stream and waits for its connection to be released.
    ///
    /// If the task does not complete within the close timeout, it is aborted.
    /// Closing an already-closed handle does nothing.
    pub(crate) async fn close(&mut self) {
        self.cancel.cancel();
        let Some(mut task) = self.task.take() else {
            return;
        };

        if time::timeout(self.close_timeout, &mut task).await.is_err() {
            tracing::warn!(timeout = ?self.close_timeout, "target stream did not close in time; aborting");
            task.abort();
            let _ = task.await;
        }
    }
}

#[cfg(test)]
impl TargetHandle {
    /// A handle whose stream ignores cancellation.
    pub(crate) fn stalled(close_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            task: Some(AbortOnDropHandle::new(tokio::spawn(future::pending()))),
            close_timeout,
        }
    }
}

// === impl LocalFilter ===

impl LocalFilter {
    fn new(matches: Match) -> Self {
        Self {
            matches,
            admitted: BTreeSet::new(),
        }
    }

    fn admit(&mut self, ev: &TapEvent) -> bool {
        match &ev.kind {
            EventKind::RequestInit { id, .. } => {
                if !self.matches.matches(ev) {
                    return false;
                }
                self.admitted.insert(*id);
                if self.admitted.len() > MAX_ADMITTED {
                    self.admitted.pop_first();
                }
                true
            }
            EventKind::RequestEnd {
                id,
                eos: Some(Eos::ResetErrorCode(_)),
                ..
            }
            | EventKind::ResponseEnd { id, .. } => self.admitted.remove(id),
            kind => self.admitted.contains(&kind.stream_id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_tap_controller_core::{Direction, HttpMatch, StringMatch};
    use std::time::SystemTime;

    fn event(kind: EventKind) -> TapEvent {
        TapEvent {
            target: TargetId::new("ns", "pod-0"),
            source: ([10, 0, 0, 1], 5000).into(),
            source_meta: Default::default(),
            destination: ([10, 0, 0, 2], 8080).into(),
            destination_meta: Default::default(),
            direction: Direction::Inbound,
            timestamp: SystemTime::UNIX_EPOCH,
            kind,
        }
    }

    fn request_init(stream: u64, path: &str) -> TapEvent {
        event(EventKind::RequestInit {
            id: StreamId { base: 0, stream },
            method: http::Method::GET,
            scheme: None,
            authority: "web".to_string(),
            path: path.to_string(),
            headers: vec![],
        })
    }

    fn response_init(stream: u64) -> TapEvent {
        event(EventKind::ResponseInit {
            id: StreamId { base: 0, stream },
            since_request_init: Duration::from_millis(1),
            http_status: 200,
            headers: vec![],
        })
    }

    fn response_end(stream: u64) -> TapEvent {
        event(EventKind::ResponseEnd {
            id: StreamId { base: 0, stream },
            since_request_init: Duration::from_millis(2),
            since_response_init: Duration::from_millis(1),
            response_bytes: 10,
            eos: None,
        })
    }

    #[test]
    fn local_filter_follows_admitted_requests() {
        let mut filter = LocalFilter::new(Match::Http(HttpMatch::Path(StringMatch::Regex(
            re("^/keep"),
        ))));

        assert!(filter.admit(&request_init(1, "/keep/1")));
        assert!(!filter.admit(&request_init(2, "/drop/2")));
        assert!(filter.admit(&response_init(1)));
        assert!(!filter.admit(&response_init(2)));
        assert!(filter.admit(&response_end(1)));
        assert!(!filter.admit(&response_end(2)));

        // Once a response ends, the request is forgotten.
        assert!(!filter.admit(&response_init(1)));
    }

    #[test]
    fn local_filter_forgets_reset_requests() {
        let mut filter = LocalFilter::new(Match::Http(HttpMatch::Path(StringMatch::Regex(
            re("^/keep"),
        ))));

        assert!(filter.admit(&request_init(1, "/keep/1")));
        assert!(filter.admit(&request_init(2, "/keep/2")));
        assert!(filter.admit(&request_end(1, Some(Eos::ResetErrorCode(8)))));
        assert!(filter.admit(&request_end(2, None)));
        assert_eq!(
            filter.admitted.iter().map(|id| id.stream).collect::<Vec<_>>(),
            vec![2]
        );
        assert!(!filter.admit(&response_init(1)));
        assert!(filter.admit(&response_init(2)));
    }

    #[test]
    fn local_filter_bounds_in_flight_requests() {
        let mut filter = LocalFilter::new(Match::Http(HttpMatch::Path(StringMatch::Regex(
            re("^/keep"),
        ))));

        for stream in 0..(MAX_ADMITTED as u64 + 10) {
            assert!(filter.admit(&request_init(stream, "/keep")));
        }
        assert_eq!(filter.admitted.len(), MAX_ADMITTED);

        // The oldest requests are forgotten first.
        assert!(!filter.admit(&response_init(0)));
        assert!(filter.admit(&response_init(MAX_ADMITTED as u64 + 9)));
    }

    fn request_end(stream: u64, eos: Option<Eos>) -> TapEvent {
        event(EventKind::RequestEnd {
            id: StreamId { base: 0, stream },
            since_request_init: Duration::from_millis(1),
            request_bytes: 0,
            eos,
        })
    }

    fn re(s: &str) -> regex::Regex {
        regex::Regex::new(s).expect("regex must compile")
    }
}
