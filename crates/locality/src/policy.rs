//! Replication policy predicates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::set::LocalityEntry;

/// A predicate over a set of server localities.
///
/// Policies form a small closed grammar: `One` is satisfied by any non-empty
/// set, `Across` requires `count` distinct values of an attribute each of
/// which satisfies an inner policy, and `And` requires every sub-policy to
/// hold. `Across("zoneid", 3, One)` is the usual triple-replication policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationPolicy {
    /// Satisfied by any non-empty set.
    One,
    /// Requires `count` distinct values of `attribute`, each group
    /// satisfying `inner`.
    Across {
        /// Locality attribute key to spread across.
        attribute: String,
        /// Number of distinct attribute values required.
        count: usize,
        /// Policy each value group must satisfy.
        inner: Box<ReplicationPolicy>,
    },
    /// Requires all sub-policies to hold simultaneously.
    And(Vec<ReplicationPolicy>),
}

impl ReplicationPolicy {
    /// `Across(attribute, count, One)`, the common case.
    pub fn across(attribute: impl Into<String>, count: usize) -> Self {
        ReplicationPolicy::Across {
            attribute: attribute.into(),
            count,
            inner: Box::new(ReplicationPolicy::One),
        }
    }

    /// True iff `entries` satisfies this policy.
    pub fn validate(&self, entries: &[LocalityEntry]) -> bool {
        match self {
            ReplicationPolicy::One => !entries.is_empty(),
            ReplicationPolicy::Across {
                attribute,
                count,
                inner,
            } => {
                let satisfied = group_by(entries, attribute)
                    .values()
                    .filter(|group| inner.validate(group))
                    .count();
                satisfied >= *count
            }
            ReplicationPolicy::And(policies) => policies.iter().all(|p| p.validate(entries)),
        }
    }

    /// Pick a minimal set of additional entries from `candidates` so that
    /// `also` plus the additions satisfies this policy.
    ///
    /// Chosen keys are appended to `out`. Returns false (leaving `out` with
    /// whatever partial progress was made) if the policy cannot be satisfied
    /// from the given candidates. Selection is deterministic for a given
    /// input: groups and entries are considered in key order.
    pub fn select_replicas(
        &self,
        candidates: &[LocalityEntry],
        also: &BTreeSet<usize>,
        out: &mut Vec<usize>,
    ) -> bool {
        match self {
            ReplicationPolicy::One => {
                if !also.is_empty() {
                    return true;
                }
                match candidates.iter().find(|e| !also.contains(&e.key)) {
                    Some(entry) => {
                        out.push(entry.key);
                        true
                    }
                    None => false,
                }
            }
            ReplicationPolicy::Across {
                attribute,
                count,
                inner,
            } => {
                let groups = group_by(candidates, attribute);
                let mut satisfied = 0usize;
                let mut open = Vec::new();
                for (_, group) in &groups {
                    let members: Vec<LocalityEntry> = group
                        .iter()
                        .filter(|e| also.contains(&e.key))
                        .cloned()
                        .collect();
                    if inner.validate(&members) {
                        satisfied += 1;
                    } else {
                        open.push(group);
                    }
                }
                for group in open {
                    if satisfied >= *count {
                        break;
                    }
                    let group_also: BTreeSet<usize> = group
                        .iter()
                        .map(|e| e.key)
                        .filter(|k| also.contains(k))
                        .collect();
                    let mut chosen = Vec::new();
                    if inner.select_replicas(group, &group_also, &mut chosen) {
                        out.extend(chosen);
                        satisfied += 1;
                    }
                }
                satisfied >= *count
            }
            ReplicationPolicy::And(policies) => {
                let mut also = also.clone();
                for policy in policies {
                    let mut chosen = Vec::new();
                    if !policy.select_replicas(candidates, &also, &mut chosen) {
                        return false;
                    }
                    also.extend(chosen.iter().copied());
                    out.extend(chosen);
                }
                true
            }
        }
    }
}

impl fmt::Display for ReplicationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationPolicy::One => write!(f, "One()"),
            ReplicationPolicy::Across {
                attribute,
                count,
                inner,
            } => write!(f, "Across({attribute},{count},{inner})"),
            ReplicationPolicy::And(policies) => {
                write!(f, "And(")?;
                for (i, p) in policies.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Group entries by the value of `attribute`, in value order. Entries
/// missing the attribute are excluded; a server with no zone cannot count
/// toward zone diversity.
fn group_by<'a>(
    entries: &'a [LocalityEntry],
    attribute: &str,
) -> BTreeMap<&'a str, Vec<LocalityEntry>> {
    let mut groups: BTreeMap<&'a str, Vec<LocalityEntry>> = BTreeMap::new();
    for entry in entries {
        if let Some(value) = entry.locality.get(attribute) {
            groups.entry(value).or_default().push(entry.clone());
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keys, LocalityData};

    fn zoned(key: usize, zone: &str) -> LocalityEntry {
        LocalityEntry {
            key,
            locality: LocalityData::new().with(keys::ZONE_ID, zone),
        }
    }

    #[test]
    fn one_accepts_any_nonempty_set() {
        let policy = ReplicationPolicy::One;
        assert!(!policy.validate(&[]));
        assert!(policy.validate(&[zoned(0, "z0")]));
    }

    #[test]
    fn across_counts_distinct_values() {
        let policy = ReplicationPolicy::across(keys::ZONE_ID, 3);
        let two_zones = [zoned(0, "z0"), zoned(1, "z1"), zoned(2, "z1")];
        assert!(!policy.validate(&two_zones));
        let three_zones = [zoned(0, "z0"), zoned(1, "z1"), zoned(2, "z2")];
        assert!(policy.validate(&three_zones));
    }

    #[test]
    fn across_ignores_entries_without_the_attribute() {
        let policy = ReplicationPolicy::across(keys::ZONE_ID, 2);
        let entries = [
            zoned(0, "z0"),
            LocalityEntry {
                key: 1,
                locality: LocalityData::new(),
            },
        ];
        assert!(!policy.validate(&entries));
    }

    #[test]
    fn select_fills_missing_zones() {
        let policy = ReplicationPolicy::across(keys::ZONE_ID, 3);
        let candidates = [
            zoned(0, "z0"),
            zoned(1, "z0"),
            zoned(2, "z1"),
            zoned(3, "z2"),
        ];
        let also: BTreeSet<usize> = [0].into_iter().collect();
        let mut out = Vec::new();
        assert!(policy.select_replicas(&candidates, &also, &mut out));
        assert_eq!(out, vec![2, 3]);
    }

    #[test]
    fn select_reports_unsatisfiable() {
        let policy = ReplicationPolicy::across(keys::ZONE_ID, 3);
        let candidates = [zoned(0, "z0"), zoned(1, "z0"), zoned(2, "z1")];
        let mut out = Vec::new();
        assert!(!policy.select_replicas(&candidates, &BTreeSet::new(), &mut out));
    }

    #[test]
    fn and_selects_for_every_branch() {
        let policy = ReplicationPolicy::And(vec![
            ReplicationPolicy::across(keys::ZONE_ID, 2),
            ReplicationPolicy::One,
        ]);
        let candidates = [zoned(0, "z0"), zoned(1, "z1")];
        let mut out = Vec::new();
        assert!(policy.select_replicas(&candidates, &BTreeSet::new(), &mut out));
        assert_eq!(out, vec![0, 1]);
    }
}
