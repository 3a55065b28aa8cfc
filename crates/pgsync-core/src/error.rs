//! Error types for the reconciliation engine.
//!
//! One enum for the whole reconcile boundary, not one per collaborator —
//! the [`crate::reconciler::Reconciler`] is the sole place that inspects and
//! dispatches on error kind, so splitting further would just relocate the
//! `match`.

/// Errors observed during one reconciliation cycle.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The desired spec document does not exist. Aborts the cycle; no state
    /// mutation is attempted.
    #[error("desired spec not found")]
    ConfigMissing,

    /// The desired spec document exists but failed to parse. The cycle
    /// proceeds as if the spec were empty.
    #[error("desired spec malformed: {reason}")]
    ConfigMalformed { reason: String },

    /// No password is available for a user slated for creation.
    #[error("no secret available for user '{username}'")]
    SecretMissing { username: String },

    /// A connection-level failure (reset, timeout). Retryable by the caller
    /// on the next cycle; aborts the current one.
    #[error("transient database error: {reason}")]
    DbTransient { reason: String },

    /// A statement-level failure (syntax, permission, constraint). Logged
    /// and counted; the cycle continues with the next item.
    #[error("database error on '{identifier}': {reason}")]
    DbPermanent { identifier: String, reason: String },

    /// The last-applied state file could not be read or written.
    #[error("state store IO error: {reason}")]
    StateIo { reason: String },

    /// Pool initialization or cluster config bootstrap exhausted its
    /// retries. The process should exit nonzero.
    #[error("fatal startup error: {reason}")]
    FatalStartup { reason: String },

    /// A privilege-object key does not conform to the identifier grammar
    /// this controller accepts.
    #[error("invalid privilege object '{object}': must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidPrivilegeObject { object: String },

    /// A privilege keyword is outside the documented allow-list.
    #[error("privilege keyword '{keyword}' is not in the allow-list")]
    DisallowedPrivilege { keyword: String },

    /// A username or role name fails the identifier grammar.
    #[error("invalid identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },
}

impl ReconcileError {
    /// `true` for errors that should abort the whole cycle rather than just
    /// the item currently being processed.
    #[must_use]
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(
            self,
            ReconcileError::ConfigMissing | ReconcileError::DbTransient { .. }
        )
    }
}
