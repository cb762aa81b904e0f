use crate::{
    labels::Selector, Direction, Error, HttpMatch, Match, ResourceKind, ResourceSelection,
    StringMatch,
};
use std::collections::BTreeSet;

/// A caller's request to tap traffic.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TapRequest {
    /// An ordered disjunction of match clauses.
    pub clauses: Vec<Clause>,

    /// The maximum number of events delivered per second.
    pub max_rps: f64,

    /// The maximum number of events delivered before the session ends. Zero
    /// defers to the server's ceiling.
    pub limit: u32,
}

/// A conjunction of predicates.
///
/// When `source` is set, the source's pods are tapped and their outbound
/// traffic is observed. Otherwise the destination's pods are tapped and their
/// inbound traffic is observed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Clause {
    pub source: Option<Resource>,
    pub destination: Option<Resource>,
    pub scheme: Option<String>,
    pub method: Option<String>,
    pub authority: Option<Predicate>,
    pub path: Option<Predicate>,
}

/// An unvalidated resource reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resource {
    pub namespace: String,
    pub kind: String,
    pub name: Option<String>,
    pub label_selector: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    Exact(String),
    Prefix(String),
    Regex(String),
}

/// A validated tap request.
#[derive(Clone, Debug)]
pub struct Criteria {
    clauses: Vec<ClauseMatch>,
    max_rps: f64,
    limit: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClauseMatch {
    /// The pods whose proxies are tapped for this clause.
    pub tapped: ResourceSelection,

    /// The predicates each tapped proxy's events must satisfy.
    pub matches: Match,
}

// === impl TapRequest ===

impl TapRequest {
    /// Validates the request against the server's limit ceiling.
    pub fn validate(&self, max_limit: u32) -> Result<Criteria, Error> {
        if self.clauses.is_empty() {
            return Err(Error::invalid("at least one match clause is required"));
        }

        if !(self.max_rps.is_finite() && self.max_rps > 0.0) {
            return Err(Error::invalid(format_args!(
                "max_rps must be positive; got {}",
                self.max_rps
            )));
        }

        let limit = match self.limit {
            0 if max_limit == 0 => {
                return Err(Error::invalid("the server does not permit any events"))
            }
            0 => max_limit,
            l if l > max_limit => {
                return Err(Error::invalid(format_args!(
                    "limit {l} exceeds the server maximum of {max_limit}"
                )))
            }
            l => l,
        };

        let clauses = self
            .clauses
            .iter()
            .enumerate()
            .map(|(i, c)| {
                c.validate()
                    .map_err(|e| Error::invalid(format_args!("clause {i}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Criteria {
            clauses,
            max_rps: self.max_rps,
            limit,
        })
    }
}

// === impl Clause ===

impl Clause {
    fn validate(&self) -> Result<ClauseMatch, String> {
        let source = self.source.as_ref().map(Resource::validate).transpose()?;
        let destination = self
            .destination
            .as_ref()
            .map(Resource::validate)
            .transpose()?;

        let mut all = Vec::new();
        let tapped = match (source, destination) {
            (None, None) => return Err("a source or destination resource is required".into()),
            (Some(src), dst) => {
                all.push(Match::Direction(Direction::Outbound));
                if let Some(dst) = dst {
                    all.extend(destination_labels(&dst)?);
                }
                src
            }
            (None, Some(dst)) => {
                all.push(Match::Direction(Direction::Inbound));
                dst
            }
        };

        if let Some(scheme) = self.scheme.as_deref().filter(|s| !s.is_empty()) {
            all.push(Match::Http(HttpMatch::Scheme(scheme.to_ascii_lowercase())));
        }

        if let Some(method) = self.method.as_deref().filter(|m| !m.is_empty()) {
            let method = http::Method::from_bytes(method.as_bytes())
                .map_err(|_| format!("invalid HTTP method: {method}"))?;
            all.push(Match::Http(HttpMatch::Method(method)));
        }

        if let Some(authority) = self.authority.as_ref() {
            all.push(Match::Http(HttpMatch::Authority(authority.validate()?)));
        }

        if let Some(path) = self.path.as_ref() {
            all.push(Match::Http(HttpMatch::Path(path.validate()?)));
        }

        Ok(ClauseMatch {
            tapped,
            matches: Match::All(all),
        })
    }
}

/// Destination predicates that proxies can evaluate from their discovery
/// metadata.
///
/// Proxies only know the namespace and owning resource names of a
/// destination, so a destination that can't be expressed as those labels is
/// rejected rather than widened.
fn destination_labels(dst: &ResourceSelection) -> Result<Vec<Match>, String> {
    if !dst.selector.is_empty() {
        return Err("destination label selectors are not supported with a source".into());
    }

    let mut labels = vec![Match::DestinationLabel {
        key: ResourceKind::Namespace.destination_label().to_string(),
        value: dst.namespace.clone(),
    }];
    match (dst.kind, dst.name.as_ref()) {
        (ResourceKind::Namespace, _) => {}
        (kind, Some(name)) => labels.push(Match::DestinationLabel {
            key: kind.destination_label().to_string(),
            value: name.clone(),
        }),
        (kind, None) => {
            return Err(format!(
                "{kind} destinations must be named when a source is set"
            ))
        }
    }
    Ok(labels)
}

// === impl Resource ===

impl Resource {
    fn validate(&self) -> Result<ResourceSelection, String> {
        let kind = self
            .kind
            .parse::<ResourceKind>()
            .map_err(|_| format!("unsupported resource kind: {}", self.kind))?;
        let selector = self
            .label_selector
            .parse::<Selector>()
            .map_err(|e| e.to_string())?;
        let name = self.name.clone().filter(|n| !n.is_empty());

        // A namespace is selected by name; it selects every pod within it.
        let (namespace, name) = match (kind, name) {
            (ResourceKind::Namespace, Some(ns)) => (ns, None),
            (_, name) => (self.namespace.clone(), name),
        };
        if namespace.is_empty() {
            return Err(format!("{kind} resources require a namespace"));
        }

        Ok(ResourceSelection {
            namespace,
            kind,
            name,
            selector,
        })
    }
}

// === impl Predicate ===

impl Predicate {
    fn validate(&self) -> Result<StringMatch, String> {
        match self {
            Predicate::Exact(s) => Ok(StringMatch::Exact(s.clone())),
            Predicate::Prefix(s) => Ok(StringMatch::Prefix(s.clone())),
            Predicate::Regex(s) => regex::Regex::new(s)
                .map(StringMatch::Regex)
                .map_err(|e| format!("invalid regex {s:?}: {e}")),
        }
    }
}

// === impl Criteria ===

impl Criteria {
    pub fn clauses(&self) -> &[ClauseMatch] {
        &self.clauses
    }

    pub fn max_rps(&self) -> f64 {
        self.max_rps
    }

    /// The number of events after which the session ends.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Builds the predicates for a target selected by the given clauses.
    pub fn match_for(&self, clauses: &BTreeSet<usize>) -> Match {
        let mut ms = clauses
            .iter()
            .filter_map(|i| self.clauses.get(*i))
            .map(|c| c.matches.clone())
            .collect::<Vec<_>>();
        if ms.len() == 1 {
            return ms.remove(0);
        }
        Match::Any(ms)
    }
}
