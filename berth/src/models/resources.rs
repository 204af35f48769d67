//! Resource names and the integer quantity math used by admission decisions
//!
//! All quantities in Berth are integers: cpu is tracked in milli-units,
//! memory, ephemeral storage, and hugepages in bytes, and every other
//! resource in its natural unit.

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A map of quantities by flavor and then resource name
pub type FlavorResourceQuantities = HashMap<String, HashMap<ResourceName, i64>>;

/// The name of a resource a pod can request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceName {
    /// Cpu cores tracked in milli-units
    Cpu,
    /// Memory tracked in bytes
    Memory,
    /// Ephemeral storage tracked in bytes
    EphemeralStorage,
    /// The number of pods in a pod set
    Pods,
    /// Hugepages of a specific size tracked in bytes
    HugePages(String),
    /// Any other extended resource in its natural unit
    Custom(String),
}

impl ResourceName {
    /// Build a custom resource name
    ///
    /// # Arguments
    ///
    /// * `name` - The raw name of this resource
    pub fn custom<T: Into<String>>(name: T) -> Self {
        ResourceName::Custom(name.into())
    }
}

impl Display for ResourceName {
    /// Write our resource name to this formatter
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceName::Cpu => write!(f, "cpu"),
            ResourceName::Memory => write!(f, "memory"),
            ResourceName::EphemeralStorage => write!(f, "ephemeral-storage"),
            ResourceName::Pods => write!(f, "pods"),
            ResourceName::HugePages(name) | ResourceName::Custom(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for ResourceName {
    type Err = std::convert::Infallible;

    /// Cast a str to a `ResourceName`
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let name = match raw {
            "cpu" => ResourceName::Cpu,
            "memory" => ResourceName::Memory,
            "ephemeral-storage" => ResourceName::EphemeralStorage,
            "pods" => ResourceName::Pods,
            _ if raw.starts_with("hugepages-") => ResourceName::HugePages(raw.to_owned()),
            _ => ResourceName::Custom(raw.to_owned()),
        };
        Ok(name)
    }
}

impl serde::Serialize for ResourceName {
    /// Serialize our resource name as its raw string
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ResourceName {
    /// Deserialize a resource name from its raw string
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        // the cast from a str is infallible
        Ok(ResourceName::from_str(&raw).unwrap())
    }
}

/// Format an integer quantity in the unit humans expect for this resource
///
/// Cpu renders in cores when whole and milli-units otherwise, byte backed
/// resources render with the largest whole binary suffix, and everything
/// else renders as a plain integer.
///
/// # Arguments
///
/// * `name` - The resource this quantity is for
/// * `value` - The quantity to format
#[must_use]
pub fn format_quantity(name: &ResourceName, value: i64) -> String {
    match name {
        ResourceName::Cpu => {
            if value % 1000 == 0 {
                format!("{}", value / 1000)
            } else {
                format!("{value}m")
            }
        }
        ResourceName::Memory | ResourceName::EphemeralStorage | ResourceName::HugePages(_) => {
            // find the largest binary suffix that divides this value evenly
            for (suffix, scale) in [
                ("Ti", 1i64 << 40),
                ("Gi", 1i64 << 30),
                ("Mi", 1i64 << 20),
                ("Ki", 1i64 << 10),
            ] {
                if value != 0 && value % scale == 0 {
                    return format!("{}{suffix}", value / scale);
                }
            }
            format!("{value}")
        }
        ResourceName::Pods | ResourceName::Custom(_) => format!("{value}"),
    }
}

/// The integer quantities a pod or pod set requests by resource name
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Requests(pub HashMap<ResourceName, i64>);

impl Requests {
    /// Get the requested quantity for a resource, defaulting to 0
    ///
    /// # Arguments
    ///
    /// * `name` - The resource to get the quantity for
    #[must_use]
    pub fn get(&self, name: &ResourceName) -> i64 {
        self.0.get(name).copied().unwrap_or_default()
    }

    /// Set the requested quantity for a resource
    ///
    /// # Arguments
    ///
    /// * `name` - The resource to set the quantity for
    /// * `value` - The quantity to set
    pub fn set(&mut self, name: ResourceName, value: i64) {
        self.0.insert(name, value);
    }

    /// Add another set of requests to ours resource by resource
    ///
    /// # Arguments
    ///
    /// * `other` - The requests to add onto ours
    pub fn add(&mut self, other: &Requests) {
        for (name, value) in &other.0 {
            *self.0.entry(name.clone()).or_default() += value;
        }
    }

    /// Multiply every requested quantity by a pod count
    ///
    /// # Arguments
    ///
    /// * `count` - The number of pods to scale by
    pub fn scale(&mut self, count: i64) {
        for value in self.0.values_mut() {
            *value *= count;
        }
    }

    /// Build the requests restricted to an allowed set of resources
    ///
    /// # Arguments
    ///
    /// * `allowed` - The resources to keep
    #[must_use]
    pub fn restrict(&self, allowed: &HashSet<ResourceName>) -> Requests {
        let filtered = self
            .0
            .iter()
            .filter(|(name, _)| allowed.contains(name))
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        Requests(filtered)
    }

    /// Iterate over the requested resources and their quantities
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceName, &i64)> {
        self.0.iter()
    }

    /// The resource names requested in sorted order
    #[must_use]
    pub fn sorted_names(&self) -> Vec<ResourceName> {
        let mut names = self.0.keys().cloned().collect::<Vec<ResourceName>>();
        names.sort();
        names
    }

    /// Check if no resources are requested
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of distinct resources requested
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(ResourceName, i64)> for Requests {
    /// Collect resource/quantity pairs into a requests map
    fn from_iter<I: IntoIterator<Item = (ResourceName, i64)>>(iter: I) -> Self {
        Requests(iter.into_iter().collect())
    }
}
