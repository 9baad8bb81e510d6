//! Node placement constraints for cached copies
//!
//! A constraint is a small boolean expression over node labels. Evaluation
//! is total: every constraint answers yes or no for any label set.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{NodeSelector, NodeSelectorRequirement, NodeSelectorTerm};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

use crate::Error;

/// Maximum nesting of `and`/`or`/`not`
pub const MAX_CONSTRAINT_DEPTH: usize = 16;

const MAX_LABEL_NAME_LEN: usize = 63;
const MAX_LABEL_PREFIX_LEN: usize = 253;

/// Hard constraint on which nodes may hold cached copies
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheableNodeAffinity {
    /// Expression a node's labels must satisfy; absent means any node.
    /// Also accepts a Kubernetes `NodeSelector` (`nodeSelectorTerms`), which
    /// is converted on decode.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_required"
    )]
    #[schemars(schema_with = "super::raw_object_schema")]
    pub required: Option<NodeConstraint>,
}

/// Accepted shapes of `required`
#[derive(Deserialize)]
#[serde(untagged)]
enum RequiredWire {
    Constraint(NodeConstraint),
    Selector(SelectorWire),
}

/// `NodeSelector` with `nodeSelectorTerms` mandatory, so a constraint map
/// never decodes as an empty selector
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectorWire {
    node_selector_terms: Vec<NodeSelectorTerm>,
}

fn deserialize_required<'de, D>(deserializer: D) -> Result<Option<NodeConstraint>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RequiredWire>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RequiredWire::Constraint(c)) => Ok(Some(c)),
        Some(RequiredWire::Selector(wire)) => {
            let selector = NodeSelector {
                node_selector_terms: wire.node_selector_terms,
            };
            CacheableNodeAffinity::from_node_selector(&selector)
                .map(|affinity| affinity.required)
                .map_err(serde::de::Error::custom)
        }
    }
}

impl CacheableNodeAffinity {
    /// Affinity requiring `constraint`
    pub fn requiring(constraint: NodeConstraint) -> Self {
        Self {
            required: Some(constraint),
        }
    }

    /// Whether a node with `labels` may host cached copies
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.required.as_ref().map_or(true, |c| c.matches(labels))
    }

    /// Syntactic validation; satisfiability is not checked
    pub fn validate(&self) -> Result<(), Error> {
        match &self.required {
            Some(c) => c.validate_at("spec.nodeAffinity.required", 1),
            None => Ok(()),
        }
    }

    /// Convert a Kubernetes `NodeSelector` (terms OR-ed, expressions AND-ed)
    /// and validate the result
    pub fn from_node_selector(selector: &NodeSelector) -> Result<Self, Error> {
        let affinity = NodeConstraint::try_from(selector).map(Self::requiring)?;
        affinity.validate()?;
        Ok(affinity)
    }
}

/// Boolean expression over node labels
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NodeConstraint {
    /// Label is present, any value
    Exists {
        /// Label key
        key: String,
    },
    /// Label has exactly this value
    Equals {
        /// Label key
        key: String,
        /// Required value
        value: String,
    },
    /// Label value is one of the set
    In {
        /// Label key
        key: String,
        /// Accepted values (non-empty)
        values: Vec<String>,
    },
    /// All sub-constraints hold
    And(Vec<NodeConstraint>),
    /// At least one sub-constraint holds
    Or(Vec<NodeConstraint>),
    /// Sub-constraint does not hold
    Not(Box<NodeConstraint>),
}

impl NodeConstraint {
    /// Shorthand for `Exists`
    pub fn exists(key: impl Into<String>) -> Self {
        Self::Exists { key: key.into() }
    }

    /// Shorthand for `Equals`
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Shorthand for `In`
    pub fn one_of<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::In {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Negate a constraint
    pub fn negate(inner: NodeConstraint) -> Self {
        Self::Not(Box::new(inner))
    }

    /// Evaluate against a node's labels
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Exists { key } => labels.contains_key(key),
            Self::Equals { key, value } => labels.get(key) == Some(value),
            Self::In { key, values } => labels.get(key).is_some_and(|v| values.contains(v)),
            Self::And(all) => all.iter().all(|c| c.matches(labels)),
            Self::Or(any) => any.iter().any(|c| c.matches(labels)),
            Self::Not(inner) => !inner.matches(labels),
        }
    }

    fn validate_at(&self, path: &str, depth: usize) -> Result<(), Error> {
        if depth > MAX_CONSTRAINT_DEPTH {
            return Err(Error::invalid_spec_field(
                path,
                format!("node constraint nested deeper than {}", MAX_CONSTRAINT_DEPTH),
            ));
        }
        match self {
            Self::Exists { key } => validate_label_key(path, key),
            Self::Equals { key, value } => {
                validate_label_key(path, key)?;
                validate_label_value(path, value)
            }
            Self::In { key, values } => {
                validate_label_key(path, key)?;
                if values.is_empty() {
                    return Err(Error::invalid_spec_field(
                        format!("{}.in.values", path),
                        format!("'in' for key '{}' needs at least one value", key),
                    ));
                }
                values.iter().try_for_each(|v| validate_label_value(path, v))
            }
            Self::And(list) | Self::Or(list) => {
                let op = if matches!(self, Self::And(_)) { "and" } else { "or" };
                if list.is_empty() {
                    return Err(Error::invalid_spec_field(
                        format!("{}.{}", path, op),
                        format!("'{}' needs at least one constraint", op),
                    ));
                }
                list.iter().enumerate().try_for_each(|(i, c)| {
                    c.validate_at(&format!("{}.{}[{}]", path, op, i), depth + 1)
                })
            }
            Self::Not(inner) => inner.validate_at(&format!("{}.not", path), depth + 1),
        }
    }
}

fn is_label_name(s: &str) -> bool {
    let bytes = s.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            s.len() <= MAX_LABEL_NAME_LEN
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        }
        _ => false,
    }
}

fn is_dns_subdomain(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_LABEL_PREFIX_LEN
        && s.split('.').all(|part| {
            !part.is_empty()
                && part.len() <= MAX_LABEL_NAME_LEN
                && part.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
                && part.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}

/// Kubernetes label key: `[prefix/]name`
pub fn is_valid_label_key(key: &str) -> bool {
    match key.split_once('/') {
        Some((prefix, name)) => is_dns_subdomain(prefix) && is_label_name(name),
        None => is_label_name(key),
    }
}

/// Kubernetes label value: empty or a label name
pub fn is_valid_label_value(value: &str) -> bool {
    value.is_empty() || is_label_name(value)
}

fn validate_label_key(path: &str, key: &str) -> Result<(), Error> {
    if is_valid_label_key(key) {
        Ok(())
    } else {
        Err(Error::invalid_spec_field(
            path,
            format!("invalid label key '{}'", key),
        ))
    }
}

fn validate_label_value(path: &str, value: &str) -> Result<(), Error> {
    if is_valid_label_value(value) {
        Ok(())
    } else {
        Err(Error::invalid_spec_field(
            path,
            format!("invalid label value '{}'", value),
        ))
    }
}

fn requirement_to_constraint(req: &NodeSelectorRequirement) -> Result<NodeConstraint, Error> {
    let values = req.values.clone().unwrap_or_default();
    let in_set = |key: &str, values: Vec<String>| match values.as_slice() {
        [single] => NodeConstraint::equals(key, single.clone()),
        _ => NodeConstraint::In {
            key: key.to_string(),
            values,
        },
    };
    match req.operator.as_str() {
        "In" => Ok(in_set(&req.key, values)),
        "NotIn" => Ok(NodeConstraint::negate(in_set(&req.key, values))),
        "Exists" => Ok(NodeConstraint::exists(&req.key)),
        "DoesNotExist" => Ok(NodeConstraint::negate(NodeConstraint::exists(&req.key))),
        other => Err(Error::invalid_spec_field(
            "spec.nodeAffinity.required",
            format!("unsupported node selector operator '{}'", other),
        )),
    }
}

fn collapse(mut list: Vec<NodeConstraint>, wrap: fn(Vec<NodeConstraint>) -> NodeConstraint) -> NodeConstraint {
    if list.len() == 1 {
        list.remove(0)
    } else {
        wrap(list)
    }
}

impl TryFrom<&NodeSelector> for NodeConstraint {
    type Error = Error;

    fn try_from(selector: &NodeSelector) -> Result<Self, Self::Error> {
        if selector.node_selector_terms.is_empty() {
            return Err(Error::invalid_spec_field(
                "spec.nodeAffinity.required",
                "node selector has no terms",
            ));
        }

        let mut terms = Vec::with_capacity(selector.node_selector_terms.len());
        for term in &selector.node_selector_terms {
            if term.match_fields.as_ref().is_some_and(|f| !f.is_empty()) {
                return Err(Error::invalid_spec_field(
                    "spec.nodeAffinity.required",
                    "matchFields is not supported",
                ));
            }
            let exprs = term.match_expressions.as_deref().unwrap_or_default();
            if exprs.is_empty() {
                return Err(Error::invalid_spec_field(
                    "spec.nodeAffinity.required",
                    "node selector term has no matchExpressions",
                ));
            }
            let all = exprs
                .iter()
                .map(requirement_to_constraint)
                .collect::<Result<Vec<_>, _>>()?;
            terms.push(collapse(all, NodeConstraint::And));
        }

        Ok(collapse(terms, NodeConstraint::Or))
    }
}
