//! Narrow capability traits for the Reconciler's four collaborators.
//!
//! Each has exactly one production implementation (in `pgsync-k8s` or
//! `pgsync-db` or `pgsync-state`) and fakes for tests — no class hierarchy,
//! following the teacher's `StorageBackend` shape (one trait, sibling
//! implementations).

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::ReconcileError;
use crate::model::{UserMap, UserRecord};

/// Fetches the operator-declared desired spec.
#[async_trait]
pub trait SpecSource: Send + Sync {
    /// Returns `Ok(None)` on a definitive "not found" response. Transient
    /// fetch failures should already have been retried internally by the
    /// implementation before this returns `Err`.
    async fn fetch_desired(&self) -> Result<Option<UserMap>, ReconcileError>;
}

/// Resolves per-user passwords on demand.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Returns `Ok(None)` if no secret exists for `username` — a soft error
    /// the caller turns into a skip-with-log, not a cycle abort.
    async fn password_for(&self, username: &str) -> Result<Option<String>, ReconcileError>;
}

/// Pooled, privileged access to the target PostgreSQL cluster.
#[async_trait]
pub trait DbGateway: Send + Sync {
    /// All roles with `LOGIN` capability, minus the denylist.
    async fn list_users(&self) -> Result<BTreeSet<String>, ReconcileError>;

    /// All roles without `LOGIN` capability, minus the denylist.
    async fn list_groups(&self) -> Result<BTreeSet<String>, ReconcileError>;

    /// The set of group roles granted directly to `username`.
    async fn user_roles(&self, username: &str) -> Result<BTreeSet<String>, ReconcileError>;

    /// `CREATE ROLE <name> NOLOGIN` in autocommit.
    async fn create_group(&self, name: &str) -> Result<(), ReconcileError>;

    /// `DROP ROLE IF EXISTS <name>` in autocommit.
    async fn drop_group(&self, name: &str) -> Result<(), ReconcileError>;

    /// Creates a login user and issues its initial grants in one transaction.
    async fn create_user(&self, record: &UserRecord, password: &str) -> Result<(), ReconcileError>;

    /// Revokes `current \ desired` then grants `desired \ current` in one
    /// transaction.
    async fn update_user_roles(
        &self,
        username: &str,
        current: &BTreeSet<String>,
        desired: &BTreeSet<String>,
    ) -> Result<(), ReconcileError>;

    /// Reassigns and drops everything owned by `username`, then drops the
    /// role itself, in one transaction.
    async fn drop_user(&self, username: &str) -> Result<(), ReconcileError>;
}

/// Persists the last-applied desired spec across process restarts.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns an empty map on an absent or malformed file.
    async fn load(&self) -> Result<UserMap, ReconcileError>;

    /// Atomically replaces the persisted state with `desired`.
    async fn save(&self, desired: &UserMap) -> Result<(), ReconcileError>;
}
