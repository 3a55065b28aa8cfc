//! The three-way diff between desired state, last-applied state, and the
//! live database view.

use std::collections::BTreeSet;

use crate::model::UserMap;

/// Result of diffing desired usernames against the live user set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDiff {
    /// `desired \ live` — users to create.
    pub to_create: BTreeSet<String>,
    /// `live \ desired` — candidates for deletion, before orphan-protection
    /// restriction to owned users.
    pub to_delete: BTreeSet<String>,
    /// `desired ∩ live` — users that already exist and may need a role update.
    pub to_update: BTreeSet<String>,
}

/// Computes `(to_create, to_delete, to_update)` as defined in SPEC_FULL.md §8
/// testable property 4: the three sets are pairwise disjoint and their union
/// is `desired ∪ live`.
#[must_use]
pub fn detect_drift(desired: &UserMap, live_users: &BTreeSet<String>) -> UserDiff {
    let desired_keys: BTreeSet<String> = desired.keys().cloned().collect();

    let to_create = desired_keys.difference(live_users).cloned().collect();
    let to_delete = live_users.difference(&desired_keys).cloned().collect();
    let to_update = desired_keys.intersection(live_users).cloned().collect();

    UserDiff {
        to_create,
        to_delete,
        to_update,
    }
}

/// Restricts a raw deletion candidate set to users the controller previously
/// owned — orphan protection (invariant 3 in SPEC_FULL.md §3).
#[must_use]
pub fn restrict_to_owned(to_delete: &BTreeSet<String>, last_applied: &UserMap) -> BTreeSet<String> {
    to_delete
        .iter()
        .filter(|u| last_applied.contains_key(*u))
        .cloned()
        .collect()
}

/// The set of group roles needed by `desired` but absent from `live_groups`.
#[must_use]
pub fn missing_groups(desired: &UserMap, live_groups: &BTreeSet<String>) -> BTreeSet<String> {
    let needed: BTreeSet<String> = desired.values().flat_map(|r| r.roles.iter().cloned()).collect();
    needed.difference(live_groups).cloned().collect()
}
