//! Locality attributes and replication policies.
//!
//! Log servers carry an opaque bag of locality attributes (zone, data hall,
//! machine, ...). A [`ReplicationPolicy`] is a predicate over a set of
//! localities ("spread across three zones"); the [`LocalitySet`] evaluator
//! answers whether a set satisfies a policy and can pick a minimal set of
//! additional servers to make it satisfied. The engine never interprets
//! localities itself; everything goes through this crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

mod policy;
mod set;

pub use policy::ReplicationPolicy;
pub use set::{validate_all_combinations, LocalityEntry, LocalitySet};

/// Well-known locality attribute keys.
pub mod keys {
    /// Failure-isolation zone (usually one machine or one rack).
    pub const ZONE_ID: &str = "zoneid";
    /// Datacenter.
    pub const DC_ID: &str = "dcid";
    /// Data hall within a datacenter.
    pub const DATA_HALL: &str = "data_hall";
    /// Physical machine.
    pub const MACHINE_ID: &str = "machineid";
    /// Individual process.
    pub const PROCESS_ID: &str = "processid";
}

/// An opaque attribute bag describing where a server runs.
///
/// Attributes are ordered by key so that serialized forms and evaluator
/// decisions are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalityData {
    attributes: BTreeMap<String, String>,
}

impl LocalityData {
    /// An empty locality (matches nothing attribute-specific).
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style attribute insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Look up an attribute value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Shorthand for the zone attribute.
    pub fn zone_id(&self) -> Option<&str> {
        self.get(keys::ZONE_ID)
    }

    /// Shorthand for the data hall attribute.
    pub fn data_hall(&self) -> Option<&str> {
        self.get(keys::DATA_HALL)
    }

    /// Iterate all attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Describe the distinct values of `key` across `localities`, for logging.
pub fn describe_values<'a, I>(localities: I, key: &str) -> String
where
    I: IntoIterator<Item = &'a LocalityData>,
{
    let mut values: Vec<&str> = localities
        .into_iter()
        .map(|l| l.get(key).unwrap_or("[unset]"))
        .collect();
    values.sort_unstable();
    values.dedup();
    values.join(",")
}
