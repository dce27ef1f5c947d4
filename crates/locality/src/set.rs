//! Indexed locality sets and combination checking.

use std::collections::BTreeSet;

use crate::{LocalityData, ReplicationPolicy};

/// One member of a [`LocalitySet`]: a caller-meaningful key (typically the
/// server's index in its epoch) plus its locality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalityEntry {
    /// Caller-side identity of this entry.
    pub key: usize,
    /// The entry's locality attributes.
    pub locality: LocalityData,
}

/// An ordered collection of servers with localities, the domain over which
/// policies are evaluated.
#[derive(Debug, Clone, Default)]
pub struct LocalitySet {
    entries: Vec<LocalityEntry>,
}

impl LocalitySet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set keyed by position from a slice of localities.
    pub fn from_localities(localities: &[LocalityData]) -> Self {
        let mut set = Self::new();
        for (key, locality) in localities.iter().enumerate() {
            set.add(key, locality.clone());
        }
        set
    }

    /// Append an entry. Keys are expected to be unique; the evaluator does
    /// not police duplicates.
    pub fn add(&mut self, key: usize, locality: LocalityData) {
        self.entries.push(LocalityEntry { key, locality });
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the set holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, in insertion order.
    pub fn entries(&self) -> &[LocalityEntry] {
        &self.entries
    }

    /// True iff the whole set satisfies `policy`.
    pub fn validate(&self, policy: &ReplicationPolicy) -> bool {
        policy.validate(&self.entries)
    }

    /// Choose additional members so that `also` (keys already committed to)
    /// plus the additions satisfies `policy`.
    ///
    /// On success the chosen keys are appended to `out` and true is
    /// returned; failure to satisfy is reported as false, never silently.
    pub fn select_replicas(
        &self,
        policy: &ReplicationPolicy,
        also: &[usize],
        out: &mut Vec<usize>,
    ) -> bool {
        let also: BTreeSet<usize> = also.iter().copied().collect();
        policy.select_replicas(&self.entries, &also, out)
    }
}

/// Check every `combination_size`-combination of `available` against the
/// policy when joined with `unresponsive`.
///
/// With `check_if_valid = false` this answers: could some subset of
/// `combination_size` available servers (e.g. a write anti-quorum that never
/// received a commit) together with the unresponsive servers form a complete
/// policy-satisfying replica set? If so the combination is appended to
/// `offending` and false is returned, because a replica set made entirely of
/// stale or unreachable servers could then exist. With
/// `check_if_valid = true` the polarity flips: every combination must
/// validate.
///
/// Returns true when there are no combinations to check.
pub fn validate_all_combinations(
    offending: &mut Vec<Vec<usize>>,
    unresponsive: &LocalitySet,
    policy: &ReplicationPolicy,
    available: &[LocalityEntry],
    combination_size: usize,
    check_if_valid: bool,
) -> bool {
    if combination_size > available.len() {
        return true;
    }

    let mut valid = true;
    let mut indices: Vec<usize> = (0..combination_size).collect();
    loop {
        let mut probe = unresponsive.clone();
        for &i in &indices {
            probe.add(available[i].key, available[i].locality.clone());
        }
        if probe.validate(policy) != check_if_valid {
            offending.push(indices.iter().map(|&i| available[i].key).collect());
            valid = false;
        }
        if !next_combination(&mut indices, available.len()) {
            break;
        }
    }
    valid
}

/// Advance `indices` to the next lexicographic combination drawn from
/// `0..n`. Returns false once exhausted.
fn next_combination(indices: &mut [usize], n: usize) -> bool {
    let k = indices.len();
    if k == 0 {
        return false;
    }
    let mut i = k;
    while i > 0 {
        i -= 1;
        if indices[i] < n - (k - i) {
            indices[i] += 1;
            for j in i + 1..k {
                indices[j] = indices[j - 1] + 1;
            }
            return true;
        }
    }
    false
}
