use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A Kubernetes label selector.
///
/// Selectors are parsed from the same string syntax `kubectl` accepts, e.g.
/// `app=web,tier notin (db),!canary`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Default)]
pub struct Selector {
    match_labels: Map,
    match_expressions: Expressions,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid label selector {selector:?}: {reason}")]
pub struct ParseError {
    selector: String,
    reason: &'static str,
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: Map::default(),
            match_expressions: exprs,
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: map,
            match_expressions: Expressions::default(),
        }
    }

    /// Returns true if the selector has no requirements and selects everything.
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in &self.match_expressions {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        for (k, v) in &self.match_labels {
            if labels.0.get(k) != Some(v) {
                return false;
            }
        }

        true
    }

    /// Adds all requirements of `other` to this selector.
    pub fn and(mut self, other: Selector) -> Self {
        self.match_labels.extend(other.match_labels);
        self.match_expressions.extend(other.match_expressions);
        self
    }
}

impl std::str::FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseError {
            selector: s.to_string(),
            reason,
        };

        let mut selector = Selector::default();
        for term in split_terms(s).map_err(err)? {
            let term = term.trim();
            if term.is_empty() {
                return Err(err("empty requirement"));
            }

            if let Some(key) = term.strip_prefix('!') {
                let key = parse_key(key).map_err(err)?;
                selector.match_expressions.push(Expression::new(
                    key,
                    Operator::DoesNotExist,
                    None::<String>,
                ));
            } else if let Some((key, value)) = term.split_once("!=") {
                let key = parse_key(key).map_err(err)?;
                let value = parse_value(value).map_err(err)?;
                selector
                    .match_expressions
                    .push(Expression::new(key, Operator::NotIn, Some(value)));
            } else if let Some((key, value)) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
            {
                let key = parse_key(key).map_err(err)?;
                let value = parse_value(value).map_err(err)?;
                selector.match_labels.insert(key, value);
            } else if let Some((key, op, values)) = parse_set_term(term) {
                let key = parse_key(key).map_err(err)?;
                let values = values
                    .split(',')
                    .map(parse_value)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(err)?;
                selector
                    .match_expressions
                    .push(Expression::new(key, op, values));
            } else {
                let key = parse_key(term).map_err(err)?;
                selector
                    .match_expressions
                    .push(Expression::new(key, Operator::Exists, None::<String>));
            }
        }

        Ok(selector)
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

/// Splits a selector on commas that are not enclosed in a value set.
fn split_terms(s: &str) -> Result<Vec<&str>, &'static str> {
    if s.trim().is_empty() {
        return Ok(vec![]);
    }

    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or("unbalanced parentheses")?,
            ',' if depth == 0 => {
                terms.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced parentheses");
    }
    terms.push(&s[start..]);
    Ok(terms)
}

fn parse_set_term(term: &str) -> Option<(&str, Operator, &str)> {
    let open = term.find('(')?;
    let values = term[open + 1..].strip_suffix(')')?;
    let mut head = term[..open].split_whitespace();
    let key = head.next()?;
    let op = match head.next()? {
        "in" => Operator::In,
        "notin" => Operator::NotIn,
        _ => return None,
    };
    if head.next().is_some() {
        return None;
    }
    Some((key, op, values))
}

fn parse_key(key: &str) -> Result<String, &'static str> {
    let key = key.trim();
    if key.is_empty() {
        return Err("empty key");
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err("invalid character in key");
    }
    Ok(key.to_string())
}

fn parse_value(value: &str) -> Result<String, &'static str> {
    let value = value.trim();
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("invalid character in value");
    }
    Ok(value.to_string())
}

// === Labels ===

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    pub fn new(
        key: impl ToString,
        operator: Operator,
        values: impl IntoIterator<Item = impl ToString>,
    ) -> Self {
        Self {
            key: key.to_string(),
            operator,
            values: values.into_iter().map(|v| v.to_string()).collect(),
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .map(|v| self.values.contains(v))
                .unwrap_or(false),
            Operator::NotIn => labels
                .get(&self.key)
                .map(|v| !self.values.contains(v))
                .unwrap_or(true),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}
