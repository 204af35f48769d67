//! Resource flavors and the label/taint matching they are admitted against
//!
//! A flavor is a named pool of capacity described by node labels and taints.
//! Admission ties every requested resource to a flavor, so the matching here
//! only ever runs against the labels and taints carried on the flavor
//! itself, never against live nodes.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use crate::Error;

/// The implicit label every namespace carries with its own name
pub const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// A named pool of capacity with the node labels and taints that gate it
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ResourceFlavor {
    /// The name of this flavor
    pub name: String,
    /// The node labels that describe this pool
    #[serde(default)]
    pub node_labels: HashMap<String, String>,
    /// The node taints workloads must tolerate to use this pool
    #[serde(default)]
    pub node_taints: Vec<Taint>,
}

impl ResourceFlavor {
    /// Create a new flavor with no labels or taints
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this flavor
    pub fn new<T: Into<String>>(name: T) -> Self {
        ResourceFlavor {
            name: name.into(),
            node_labels: HashMap::default(),
            node_taints: Vec::default(),
        }
    }
}

/// The effect a taint has on pods that do not tolerate it
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaintEffect {
    /// New pods will not be scheduled onto this pool
    NoSchedule,
    /// The scheduler will try to avoid this pool but may still use it
    PreferNoSchedule,
    /// Running pods that do not tolerate this taint are evicted
    NoExecute,
}

impl Display for TaintEffect {
    /// Write our taint effect to this formatter
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TaintEffect::NoSchedule => write!(f, "NoSchedule"),
            TaintEffect::PreferNoSchedule => write!(f, "PreferNoSchedule"),
            TaintEffect::NoExecute => write!(f, "NoExecute"),
        }
    }
}

/// A taint on a flavors backing nodes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Taint {
    /// The key of this taint
    pub key: String,
    /// The value of this taint if one is set
    #[serde(default)]
    pub value: String,
    /// What happens to pods that do not tolerate this taint
    pub effect: TaintEffect,
}

impl Taint {
    /// Create a new taint
    ///
    /// # Arguments
    ///
    /// * `key` - The key of this taint
    /// * `value` - The value of this taint
    /// * `effect` - What happens to pods that do not tolerate this taint
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V, effect: TaintEffect) -> Self {
        Taint {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }
}

impl Display for Taint {
    /// Write our taint in key=value:effect form
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}:{}", self.key, self.effect)
        } else {
            write!(f, "{}={}:{}", self.key, self.value, self.effect)
        }
    }
}

/// How a tolerations key and value are compared against a taint
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TolerationOperator {
    /// The taints value must equal the tolerations value
    #[default]
    Equal,
    /// The taint just has to exist regardless of value
    Exists,
}

/// A pods tolerance for a specific taint
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Toleration {
    /// The taint key to tolerate where an empty key with Exists matches all taints
    #[serde(default)]
    pub key: String,
    /// How to compare this tolerations value against the taints
    #[serde(default)]
    pub operator: TolerationOperator,
    /// The taint value to compare against when the operator is Equal
    #[serde(default)]
    pub value: String,
    /// The taint effect to tolerate where None matches all effects
    #[serde(default)]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// Check whether this toleration tolerates a taint
    ///
    /// # Arguments
    ///
    /// * `taint` - The taint to check against
    #[must_use]
    pub fn tolerates(&self, taint: &Taint) -> bool {
        // an effect bound toleration only covers taints with that effect
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        // an empty key with Exists tolerates every taint
        if self.key.is_empty() {
            return self.operator == TolerationOperator::Exists;
        }
        if self.key != taint.key {
            return false;
        }
        match self.operator {
            TolerationOperator::Exists => true,
            TolerationOperator::Equal => self.value == taint.value,
        }
    }
}

/// Find the first NoSchedule/NoExecute taint that is not tolerated
///
/// # Arguments
///
/// * `taints` - The taints on the flavor
/// * `tolerations` - The tolerations carried by the pod
#[must_use]
pub fn find_untolerated_taint<'a>(
    taints: &'a [Taint],
    tolerations: &[Toleration],
) -> Option<&'a Taint> {
    taints
        .iter()
        .filter(|taint| {
            matches!(taint.effect, TaintEffect::NoSchedule | TaintEffect::NoExecute)
        })
        .find(|taint| !tolerations.iter().any(|tol| tol.tolerates(taint)))
}

/// How a selector requirement compares a label against its values
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorOperator {
    /// The label must exist with one of the listed values
    In,
    /// The label must be absent or have none of the listed values
    NotIn,
    /// The label must exist with any value
    Exists,
    /// The label must be absent
    DoesNotExist,
}

/// A single requirement within a node selector term
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeSelectorRequirement {
    /// The label key this requirement checks
    pub key: String,
    /// How to compare the label against our values
    pub operator: SelectorOperator,
    /// The values to compare against
    #[serde(default)]
    pub values: Vec<String>,
}

impl NodeSelectorRequirement {
    /// Check whether a set of labels satisfies this requirement
    ///
    /// Returns an error when the requirement itself is malformed so callers
    /// can surface it as a hard per pod set failure.
    ///
    /// # Arguments
    ///
    /// * `labels` - The labels to check against
    pub fn matches(&self, labels: &HashMap<String, String>) -> Result<bool, Error> {
        match self.operator {
            SelectorOperator::In => {
                if self.values.is_empty() {
                    return Err(Error::new(format!(
                        "selector requirement for {} uses In with no values",
                        self.key
                    )));
                }
                Ok(labels
                    .get(&self.key)
                    .is_some_and(|value| self.values.contains(value)))
            }
            SelectorOperator::NotIn => {
                if self.values.is_empty() {
                    return Err(Error::new(format!(
                        "selector requirement for {} uses NotIn with no values",
                        self.key
                    )));
                }
                Ok(labels
                    .get(&self.key)
                    .is_none_or(|value| !self.values.contains(value)))
            }
            SelectorOperator::Exists => {
                if !self.values.is_empty() {
                    return Err(Error::new(format!(
                        "selector requirement for {} uses Exists with values",
                        self.key
                    )));
                }
                Ok(labels.contains_key(&self.key))
            }
            SelectorOperator::DoesNotExist => {
                if !self.values.is_empty() {
                    return Err(Error::new(format!(
                        "selector requirement for {} uses DoesNotExist with values",
                        self.key
                    )));
                }
                Ok(!labels.contains_key(&self.key))
            }
        }
    }
}

/// A node selector term whose requirements are ANDed together
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NodeSelectorTerm {
    /// The requirements a node must satisfy to match this term
    #[serde(default)]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

impl NodeSelectorTerm {
    /// Check whether a set of labels satisfies every requirement in this term
    ///
    /// # Arguments
    ///
    /// * `labels` - The labels to check against
    pub fn matches(&self, labels: &HashMap<String, String>) -> Result<bool, Error> {
        for requirement in &self.match_expressions {
            if !requirement.matches(labels)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// A label selector with both exact matches and expressions
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LabelSelector {
    /// The labels that must match exactly
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
    /// The expressions that must all be satisfied
    #[serde(default)]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

impl LabelSelector {
    /// Check whether a set of labels satisfies this selector
    ///
    /// # Arguments
    ///
    /// * `labels` - The labels to check against
    pub fn matches(&self, labels: &HashMap<String, String>) -> Result<bool, Error> {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
        for requirement in &self.match_expressions {
            if !requirement.matches(labels)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerations_cover_taints() {
        let taint = Taint::new("instance", "spot", TaintEffect::NoSchedule);
        // an equal toleration on the right key and value tolerates the taint
        let equal = Toleration {
            key: "instance".into(),
            operator: TolerationOperator::Equal,
            value: "spot".into(),
            effect: Some(TaintEffect::NoSchedule),
        };
        assert!(equal.tolerates(&taint));
        // a wrong value does not
        let wrong = Toleration {
            value: "on-demand".into(),
            ..equal.clone()
        };
        assert!(!wrong.tolerates(&taint));
        // an empty key with Exists tolerates everything
        let blanket = Toleration {
            key: String::new(),
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect: None,
        };
        assert!(blanket.tolerates(&taint));
    }

    #[test]
    fn only_hard_taints_block() {
        let soft = Taint::new("zone", "a", TaintEffect::PreferNoSchedule);
        let hard = Taint::new("zone", "b", TaintEffect::NoExecute);
        let taints = vec![soft, hard.clone()];
        // no tolerations still passes the soft taint but trips on the hard one
        let found = find_untolerated_taint(&taints, &[]).unwrap();
        assert_eq!(found, &hard);
    }

    #[test]
    fn selector_requirements_match_labels() {
        let labels = [("type".to_owned(), "two".to_owned())]
            .into_iter()
            .collect::<HashMap<String, String>>();
        let matching = NodeSelectorRequirement {
            key: "type".into(),
            operator: SelectorOperator::In,
            values: vec!["two".into(), "three".into()],
        };
        assert!(matching.matches(&labels).unwrap());
        let absent = NodeSelectorRequirement {
            key: "other".into(),
            operator: SelectorOperator::NotIn,
            values: vec!["two".into()],
        };
        assert!(absent.matches(&labels).unwrap());
    }

    #[test]
    fn malformed_requirements_error() {
        let labels = HashMap::default();
        let malformed = NodeSelectorRequirement {
            key: "type".into(),
            operator: SelectorOperator::In,
            values: Vec::default(),
        };
        assert!(malformed.matches(&labels).is_err());
    }
}
