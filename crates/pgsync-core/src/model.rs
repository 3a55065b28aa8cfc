//! Domain model for the desired spec and last-applied state.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// The fixed set of PostgreSQL built-in and cloud-provider roles the controller
/// must never create, drop, or grant.
pub const SYSTEM_ROLE_DENYLIST: &[&str] = &[
    "postgres",
    "pg_monitor",
    "pg_read_all_settings",
    "pg_read_all_stats",
    "pg_stat_scan_tables",
    "pg_read_server_files",
    "pg_write_server_files",
    "pg_execute_server_program",
    "pg_signal_backend",
    "rds_superuser",
];

/// Privilege keywords the controller will emit unquoted in a `GRANT`/`REVOKE`.
/// Anything outside this list is rejected rather than passed through.
pub const ALLOWED_PRIVILEGES: &[&str] = &[
    "SELECT",
    "INSERT",
    "UPDATE",
    "DELETE",
    "TRUNCATE",
    "REFERENCES",
    "TRIGGER",
    "EXECUTE",
    "USAGE",
    "CREATE",
    "CONNECT",
    "ALL",
];

/// Returns `true` if `role` is one of the built-in roles the controller must
/// never mutate.
#[must_use]
pub fn is_denylisted(role: &str) -> bool {
    SYSTEM_ROLE_DENYLIST.contains(&role)
}

/// A single desired PostgreSQL user, as declared in the operator's spec.
///
/// Role sets and privilege object keys are stored in `BTreeSet`/`BTreeMap` so
/// that two records built from differently-ordered YAML compare and hash
/// equal — see [`UserRecord`]'s value-equality note in the design docs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    /// Database granted via `CONNECT` at creation. Empty when the spec
    /// omitted it; the spec source is responsible for substituting the
    /// controller's configured default database before the record reaches
    /// the reconciler.
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub privileges: BTreeMap<String, BTreeSet<String>>,
}

impl UserRecord {
    /// Checks `username` against the identifier grammar used across the
    /// controller: `[A-Za-z_][A-Za-z0-9_]*`.
    #[must_use]
    pub fn is_valid_identifier(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

/// Mapping from username to [`UserRecord`]. Used for both the desired spec
/// and the last-applied state — they share a shape by design (§3).
pub type UserMap = BTreeMap<String, UserRecord>;
