use crate::{
    api::proxy::{self as proto, observe_request, tap_client::TapClient},
    event,
};
use futures::prelude::*;
use linkerd_tap_controller_core::{
    Direction, EventStream, HttpMatch, Match, ObserveRequest, ObserveTarget, StringMatch, Target,
    TargetError,
};
use std::time::Duration;
use tonic::transport::Endpoint;

/// Opens tap streams on proxies' tap servers.
#[derive(Clone, Debug)]
pub struct ProxyTap {
    connect_timeout: Duration,
}

impl ProxyTap {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait::async_trait]
impl ObserveTarget for ProxyTap {
    async fn observe(
        &self,
        target: &Target,
        req: ObserveRequest,
    ) -> Result<EventStream, TargetError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", target.addr))
            .map_err(|e| TargetError::dial(target.addr, e))?
            .connect_timeout(self.connect_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| TargetError::dial(target.addr, e))?;

        let rsp = TapClient::new(channel)
            .observe(to_proto(req))
            .await
            .map_err(|status| TargetError::dial(target.addr, status))?;
        tracing::debug!(target = %target.id, "opened tap stream");

        let id = target.id.clone();
        let events = rsp.into_inner().filter_map(move |res| {
            let ev = match res {
                Ok(ev) => match event::from_proto(&id, ev) {
                    Ok(ev) => Some(Ok(ev)),
                    Err(error) => {
                        tracing::debug!(target = %id, error, "ignoring malformed tap event");
                        None
                    }
                },
                Err(status) => Some(Err(TargetError::broken(status))),
            };
            future::ready(ev)
        });
        Ok(Box::pin(events))
    }
}

fn to_proto(req: ObserveRequest) -> proto::ObserveRequest {
    proto::ObserveRequest {
        limit: req.limit,
        r#match: req.matches.as_ref().map(match_to_proto),
    }
}

fn match_to_proto(m: &Match) -> observe_request::Match {
    use observe_request::r#match::{self as pb, http};

    let seq = |ms: &[Match]| pb::Seq {
        matches: ms.iter().map(match_to_proto).collect(),
    };
    let string = |m: &StringMatch| {
        let m = match m {
            StringMatch::Exact(s) => http::string_match::Match::Exact(s.clone()),
            StringMatch::Prefix(s) => http::string_match::Match::Prefix(s.clone()),
            // Proxies cannot evaluate regular expressions; they are stripped
            // before requests are sent.
            StringMatch::Regex(_) => return None,
        };
        Some(http::StringMatch { r#match: Some(m) })
    };

    let m = match m {
        Match::All(ms) => Some(pb::Match::All(seq(ms))),
        Match::Any(ms) => Some(pb::Match::Any(seq(ms))),
        Match::Direction(dir) => {
            let dir = match dir {
                Direction::Inbound => proto::Direction::Inbound,
                Direction::Outbound => proto::Direction::Outbound,
            };
            Some(pb::Match::Direction(dir.into()))
        }
        Match::DestinationLabel { key, value } => Some(pb::Match::DestinationLabel(pb::Label {
            key: key.clone(),
            value: value.clone(),
        })),
        Match::Http(h) => {
            let m = match h {
                HttpMatch::Scheme(s) => Some(http::Match::Scheme(s.clone())),
                HttpMatch::Method(m) => Some(http::Match::Method(m.to_string())),
                HttpMatch::Authority(m) => string(m).map(http::Match::Authority),
                HttpMatch::Path(m) => string(m).map(http::Match::Path),
            };
            m.map(|m| pb::Match::Http(pb::Http { r#match: Some(m) }))
        }
    };
    observe_request::Match { r#match: m }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_match_trees() {
        let m = Match::All(vec![
            Match::Direction(Direction::Outbound),
            Match::Any(vec![
                Match::Http(HttpMatch::Method(::http::Method::POST)),
                Match::Http(HttpMatch::Path(StringMatch::Prefix("/api".to_string()))),
            ]),
        ]);
        let req = to_proto(ObserveRequest {
            matches: Some(m),
            limit: 0,
        });
        assert_eq!(req.limit, 0);

        use observe_request::r#match::{self as pb, http};
        let Some(observe_request::Match {
            r#match: Some(pb::Match::All(all)),
        }) = req.r#match
        else {
            panic!("expected a conjunction");
        };
        assert_eq!(
            all.matches[0].r#match,
            Some(pb::Match::Direction(proto::Direction::Outbound.into()))
        );
        let Some(pb::Match::Any(any)) = &all.matches[1].r#match else {
            panic!("expected a disjunction");
        };
        assert_eq!(
            any.matches[0].r#match,
            Some(pb::Match::Http(pb::Http {
                r#match: Some(http::Match::Method("POST".to_string())),
            }))
        );
        assert_eq!(
            any.matches[1].r#match,
            Some(pb::Match::Http(pb::Http {
                r#match: Some(http::Match::Path(http::StringMatch {
                    r#match: Some(http::string_match::Match::Prefix("/api".to_string())),
                })),
            }))
        );
    }

    #[test]
    fn unconstrained_requests_have_no_match() {
        let req = to_proto(ObserveRequest {
            matches: None,
            limit: 10,
        });
        assert_eq!(req.limit, 10);
        assert!(req.r#match.is_none());
    }
}
