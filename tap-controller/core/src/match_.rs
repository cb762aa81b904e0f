use crate::{Direction, EventKind, TapEvent};
use regex::Regex;

/// A predicate tree over tap events.
///
/// Proxies evaluate these trees before emitting events. Regular expressions
/// are not understood by proxies, so trees containing them are evaluated
/// locally as well.
#[derive(Clone, Debug, PartialEq)]
pub enum Match {
    Any(Vec<Match>),
    All(Vec<Match>),
    Direction(Direction),
    DestinationLabel { key: String, value: String },
    Http(HttpMatch),
}

#[derive(Clone, Debug, PartialEq)]
pub enum HttpMatch {
    Scheme(String),
    Method(http::Method),
    Authority(StringMatch),
    Path(StringMatch),
}

#[derive(Clone, Debug)]
pub enum StringMatch {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

// === impl Match ===

impl Match {
    /// Evaluates the tree against a request's initial event.
    ///
    /// HTTP predicates only hold for `RequestInit` events, since that is the
    /// only event that carries request metadata.
    pub fn matches(&self, ev: &TapEvent) -> bool {
        match self {
            Match::Any(any) => any.iter().any(|m| m.matches(ev)),
            Match::All(all) => all.iter().all(|m| m.matches(ev)),
            Match::Direction(dir) => ev.direction == *dir,
            Match::DestinationLabel { key, value } => ev.destination_meta.get(key) == Some(value),
            Match::Http(http) => http.matches(&ev.kind),
        }
    }

    pub fn has_regex(&self) -> bool {
        match self {
            Match::Any(ms) | Match::All(ms) => ms.iter().any(Match::has_regex),
            Match::Http(HttpMatch::Authority(StringMatch::Regex(_)))
            | Match::Http(HttpMatch::Path(StringMatch::Regex(_))) => true,
            _ => false,
        }
    }

    /// Returns a tree that proxies can evaluate.
    ///
    /// Regular expression predicates are replaced by an unconstrained match,
    /// so the result selects a superset of what `self` selects. `None` means
    /// the proxy should emit every event.
    pub fn pushdown(&self) -> Option<Match> {
        match self {
            Match::All(all) => {
                let all = all.iter().filter_map(Match::pushdown).collect::<Vec<_>>();
                match all.len() {
                    0 => None,
                    1 => all.into_iter().next(),
                    _ => Some(Match::All(all)),
                }
            }
            Match::Any(any) => {
                let mut pushed = Vec::with_capacity(any.len());
                for m in any {
                    // Any unconstrained branch makes the whole disjunction unconstrained.
                    pushed.push(m.pushdown()?);
                }
                match pushed.len() {
                    0 => None,
                    1 => pushed.into_iter().next(),
                    _ => Some(Match::Any(pushed)),
                }
            }
            Match::Http(HttpMatch::Authority(StringMatch::Regex(_)))
            | Match::Http(HttpMatch::Path(StringMatch::Regex(_))) => None,
            m => Some(m.clone()),
        }
    }
}

// === impl HttpMatch ===

impl HttpMatch {
    fn matches(&self, ev: &EventKind) -> bool {
        let EventKind::RequestInit {
            method,
            scheme,
            authority,
            path,
            ..
        } = ev
        else {
            return false;
        };

        match self {
            HttpMatch::Scheme(s) => scheme
                .as_deref()
                .map(|scheme| scheme.eq_ignore_ascii_case(s))
                .unwrap_or(false),
            HttpMatch::Method(m) => method == m,
            HttpMatch::Authority(m) => m.matches(authority),
            HttpMatch::Path(m) => m.matches(path),
        }
    }
}

// === impl StringMatch ===

impl StringMatch {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            StringMatch::Exact(s) => value == s,
            StringMatch::Prefix(s) => value.starts_with(s.as_str()),
            StringMatch::Regex(re) => re.is_match(value),
        }
    }
}

impl PartialEq for StringMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) | (Self::Prefix(a), Self::Prefix(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StreamId, TargetId};
    use maplit::btreemap;
    use std::time::SystemTime;

    fn request(authority: &str, path: &str) -> TapEvent {
        TapEvent {
            target: TargetId::new("ns", "web-0"),
            source: ([10, 0, 0, 1], 5000).into(),
            source_meta: Default::default(),
            destination: ([10, 0, 0, 2], 8080).into(),
            destination_meta: btreemap! {
                "namespace".to_string() => "ns".to_string(),
                "service".to_string() => "api".to_string(),
            },
            direction: Direction::Outbound,
            timestamp: SystemTime::UNIX_EPOCH,
            kind: EventKind::RequestInit {
                id: StreamId { base: 1, stream: 1 },
                method: http::Method::GET,
                scheme: Some("http".to_string()),
                authority: authority.to_string(),
                path: path.to_string(),
                headers: vec![],
            },
        }
    }

    fn regex(s: &str) -> StringMatch {
        StringMatch::Regex(Regex::new(s).expect("regex must compile"))
    }

    #[test]
    fn evaluates_trees() {
        let ev = request("api.ns.svc.cluster.local:8080", "/users/7");

        let m = Match::All(vec![
            Match::Direction(Direction::Outbound),
            Match::DestinationLabel {
                key: "service".into(),
                value: "api".into(),
            },
            Match::Http(HttpMatch::Method(http::Method::GET)),
            Match::Http(HttpMatch::Scheme("HTTP".into())),
            Match::Http(HttpMatch::Path(regex("^/users/[0-9]+$"))),
        ]);
        assert!(m.matches(&ev));

        let m = Match::All(vec![
            Match::Direction(Direction::Inbound),
            Match::Http(HttpMatch::Path(StringMatch::Prefix("/users".into()))),
        ]);
        assert!(!m.matches(&ev));

        let m = Match::Any(vec![
            Match::Http(HttpMatch::Path(StringMatch::Exact("/".into()))),
            Match::Http(HttpMatch::Authority(StringMatch::Prefix("api.".into()))),
        ]);
        assert!(m.matches(&ev));

        assert!(Match::All(vec![]).matches(&ev));
        assert!(!Match::Any(vec![]).matches(&ev));
    }

    #[test]
    fn http_predicates_require_request_init() {
        let mut ev = request("api", "/");
        ev.kind = EventKind::ResponseInit {
            id: StreamId { base: 1, stream: 1 },
            since_request_init: Default::default(),
            http_status: 200,
            headers: vec![],
        };
        assert!(!Match::Http(HttpMatch::Method(http::Method::GET)).matches(&ev));
        assert!(Match::Direction(Direction::Outbound).matches(&ev));
    }

    #[test]
    fn pushdown_drops_regexes() {
        let m = Match::All(vec![
            Match::Direction(Direction::Inbound),
            Match::Http(HttpMatch::Path(regex("^/a"))),
        ]);
        assert!(m.has_regex());
        assert_eq!(m.pushdown(), Some(Match::Direction(Direction::Inbound)));

        let m = Match::Any(vec![
            Match::Direction(Direction::Inbound),
            Match::Http(HttpMatch::Authority(regex("a"))),
        ]);
        assert_eq!(m.pushdown(), None);

        let m = Match::Any(vec![
            Match::Direction(Direction::Inbound),
            Match::Http(HttpMatch::Authority(StringMatch::Exact("a".into()))),
        ]);
        assert!(!m.has_regex());
        assert_eq!(m.pushdown(), Some(m.clone()));
    }
}
