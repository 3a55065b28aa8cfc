//! The reconciliation engine: one cycle, start to finish.
//!
//! Grounded on `vaultrs-core::lease::LeaseManager::find_expired`/`revoke_prefix`
//! for the "one pass over a collection, log-and-skip the offending item, never
//! let one item's failure abort the whole pass" shape, generalized from lease
//! expiry scanning to the ten-step user/role sync described in the design
//! docs' Reconciler section.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::diff::{detect_drift, missing_groups, restrict_to_owned};
use crate::error::ReconcileError;
use crate::ident::{validate_privilege, validate_privilege_object};
use crate::model::{is_denylisted, UserMap, UserRecord};
use crate::traits::{DbGateway, SecretSource, SpecSource, StateStore};

/// Timing and counters for a single cycle, folded into the metrics sink at
/// the end of the cycle.
#[derive(Debug, Clone)]
pub struct ReconciliationStats {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub drift_count: u64,
    pub error_count: u64,
}

impl ReconciliationStats {
    #[must_use]
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            start_time: now,
            end_time: None,
            drift_count: 0,
            error_count: 0,
        }
    }

    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.end_time = Some(now);
    }

    #[must_use]
    pub fn duration_seconds(&self) -> Option<i64> {
        self.end_time.map(|end| (end - self.start_time).num_seconds())
    }
}

/// Orchestrates one reconciliation cycle over its four collaborators.
/// Generic over the trait objects rather than the structs that implement
/// them, so tests can swap in in-memory fakes without a `Box<dyn _>` at
/// every call site.
pub struct Reconciler<S, K, D, T>
where
    S: SpecSource,
    K: SecretSource,
    D: DbGateway,
    T: StateStore,
{
    spec_source: Arc<S>,
    secret_source: Arc<K>,
    db: Arc<D>,
    state: Arc<T>,
    dry_run: bool,
}

impl<S, K, D, T> Reconciler<S, K, D, T>
where
    S: SpecSource,
    K: SecretSource,
    D: DbGateway,
    T: StateStore,
{
    pub fn new(spec_source: Arc<S>, secret_source: Arc<K>, db: Arc<D>, state: Arc<T>, dry_run: bool) -> Self {
        Self {
            spec_source,
            secret_source,
            db,
            state,
            dry_run,
        }
    }

    /// Runs one full cycle: fetch, validate, diff, apply, persist. Returns
    /// the stats for this cycle along with the post-cycle group-role count,
    /// for the metrics sink.
    ///
    /// Per-item failures (a single record failing validation, or a single
    /// user's create/update/drop) are logged and counted, never abort the
    /// cycle. Only [`ReconcileError::is_cycle_fatal`] failures — an absent
    /// or unreachable spec source, a database connection failure — abort
    /// everything after the step that raised them.
    /// Returns `(stats, users_managed, roles_managed)` for the metrics sink.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<(ReconciliationStats, usize, usize), ReconcileError> {
        let mut stats = ReconciliationStats::start(now);

        // 1. Fetch desired state.
        let desired = match self.spec_source.fetch_desired().await {
            Ok(Some(desired)) => desired,
            Ok(None) => {
                warn!("desired spec not found; skipping cycle");
                stats.finish(now);
                return Err(ReconcileError::ConfigMissing);
            }
            Err(ReconcileError::ConfigMalformed { reason }) => {
                warn!(reason, "desired spec malformed; treating as empty for this cycle");
                UserMap::new()
            }
            Err(err) => {
                stats.finish(now);
                return Err(err);
            }
        };

        let desired = self.validate_spec(desired, &mut stats);

        // 2. Load last-applied state.
        let last_applied = self.state.load().await?;

        // 3. Fetch the live database view.
        let live_users = self.db.list_users().await?;
        let live_groups = self.db.list_groups().await?;

        // 4. Reconcile group roles: create any group desired but absent.
        for group in missing_groups(&desired, &live_groups) {
            if is_denylisted(&group) {
                continue;
            }
            if self.dry_run {
                info!(group, "dry-run: would create group role");
                continue;
            }
            if let Err(err) = self.db.create_group(&group).await {
                warn!(group, error = %err, "failed to create group role");
                stats.error_count += 1;
            }
        }

        // 5. Diff users.
        let diff = detect_drift(&desired, &live_users);
        let to_delete = restrict_to_owned(&diff.to_delete, &last_applied);

        stats.drift_count += (diff.to_create.len() + to_delete.len()) as u64;

        // 6. Deletions first, so a username can be recreated with new
        // attributes inside the same cycle.
        for username in &to_delete {
            if is_denylisted(username) {
                continue;
            }
            if self.dry_run {
                info!(username, "dry-run: would drop user");
                continue;
            }
            if let Err(err) = self.db.drop_user(username).await {
                warn!(username, error = %err, "failed to drop user");
                stats.error_count += 1;
            }
        }

        // 7. Creations.
        for username in &diff.to_create {
            if let Err(err) = self.create_one(username, &desired, &mut stats).await {
                warn!(username, error = %err, "failed to create user");
                stats.error_count += 1;
            }
        }

        // 8. Updates: reconcile role membership for users that already exist.
        for username in &diff.to_update {
            if let Err(err) = self.update_one(username, &desired, &mut stats).await {
                warn!(username, error = %err, "failed to update user roles");
                stats.error_count += 1;
            }
        }

        // 9. Persist state, unless running in dry-run mode.
        if !self.dry_run {
            self.state.save(&desired).await?;
        } else {
            debug!("dry-run: state store write suppressed");
        }

        // 10. Gauges reflect post-cycle live state: re-query rather than
        // project from the pre-cycle view, so a role whose `create_group`
        // failed above is not counted as if it existed.
        let post_cycle_groups = self.db.list_groups().await?.len();

        stats.finish(now);
        Ok((stats, desired.len(), post_cycle_groups))
    }

    /// Validates each record in `desired` independently, dropping (and
    /// counting as an error) any record that fails — a bad record anywhere
    /// in the spec must never abort the cycle for every other user, per
    /// testable property 3: the only hard requirement is that no DDL ever
    /// targets a denylisted or malformed identifier.
    fn validate_spec(&self, desired: UserMap, stats: &mut ReconciliationStats) -> UserMap {
        desired
            .into_iter()
            .filter(|(_, record)| match Self::validate_record(record) {
                Ok(()) => true,
                Err(err) => {
                    warn!(username = %record.username, error = %err, "rejecting invalid record from desired spec");
                    stats.error_count += 1;
                    false
                }
            })
            .collect()
    }

    fn validate_record(record: &UserRecord) -> Result<(), ReconcileError> {
        if !UserRecord::is_valid_identifier(&record.username) {
            return Err(ReconcileError::InvalidIdentifier {
                name: record.username.clone(),
                reason: "must match [A-Za-z_][A-Za-z0-9_]*".to_owned(),
            });
        }
        if is_denylisted(&record.username) {
            return Err(ReconcileError::InvalidIdentifier {
                name: record.username.clone(),
                reason: "username is a reserved system role".to_owned(),
            });
        }
        for role in &record.roles {
            if !UserRecord::is_valid_identifier(role) {
                return Err(ReconcileError::InvalidIdentifier {
                    name: role.clone(),
                    reason: "must match [A-Za-z_][A-Za-z0-9_]*".to_owned(),
                });
            }
        }
        for (object, privileges) in &record.privileges {
            validate_privilege_object(object)?;
            for privilege in privileges {
                validate_privilege(privilege)?;
            }
        }
        Ok(())
    }

    async fn create_one(
        &self,
        username: &str,
        desired: &UserMap,
        stats: &mut ReconciliationStats,
    ) -> Result<(), ReconcileError> {
        let Some(record) = desired.get(username) else {
            return Ok(());
        };

        let password = match self.secret_source.password_for(username).await? {
            Some(password) => password,
            None => {
                warn!(username, "no secret available; skipping creation this cycle");
                stats.error_count += 1;
                return Ok(());
            }
        };

        if self.dry_run {
            info!(username, "dry-run: would create user");
            return Ok(());
        }

        self.db.create_user(record, &password).await
    }

    async fn update_one(
        &self,
        username: &str,
        desired: &UserMap,
        _stats: &mut ReconciliationStats,
    ) -> Result<(), ReconcileError> {
        let Some(record) = desired.get(username) else {
            return Ok(());
        };

        let current: BTreeSet<String> = self.db.user_roles(username).await?;
        if current == record.roles {
            return Ok(());
        }

        if self.dry_run {
            info!(username, "dry-run: would update role membership");
            return Ok(());
        }

        self.db.update_user_roles(username, &current, &record.roles).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct FakeSpec(UserMap);
    #[async_trait]
    impl SpecSource for FakeSpec {
        async fn fetch_desired(&self) -> Result<Option<UserMap>, ReconcileError> {
            Ok(Some(self.0.clone()))
        }
    }

    struct FakeSecrets;
    #[async_trait]
    impl SecretSource for FakeSecrets {
        async fn password_for(&self, _username: &str) -> Result<Option<String>, ReconcileError> {
            Ok(Some("hunter2".to_owned()))
        }
    }

    #[derive(Default)]
    struct FakeDb {
        users: Mutex<BTreeSet<String>>,
        groups: Mutex<BTreeSet<String>>,
        roles: Mutex<BTreeMap<String, BTreeSet<String>>>,
        created: Mutex<Vec<String>>,
        dropped: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DbGateway for FakeDb {
        async fn list_users(&self) -> Result<BTreeSet<String>, ReconcileError> {
            Ok(self.users.lock().unwrap().clone())
        }
        async fn list_groups(&self) -> Result<BTreeSet<String>, ReconcileError> {
            Ok(self.groups.lock().unwrap().clone())
        }
        async fn user_roles(&self, username: &str) -> Result<BTreeSet<String>, ReconcileError> {
            Ok(self.roles.lock().unwrap().get(username).cloned().unwrap_or_default())
        }
        async fn create_group(&self, name: &str) -> Result<(), ReconcileError> {
            self.groups.lock().unwrap().insert(name.to_owned());
            Ok(())
        }
        async fn drop_group(&self, name: &str) -> Result<(), ReconcileError> {
            self.groups.lock().unwrap().remove(name);
            Ok(())
        }
        async fn create_user(&self, record: &UserRecord, _password: &str) -> Result<(), ReconcileError> {
            self.users.lock().unwrap().insert(record.username.clone());
            self.roles
                .lock()
                .unwrap()
                .insert(record.username.clone(), record.roles.clone());
            self.created.lock().unwrap().push(record.username.clone());
            Ok(())
        }
        async fn update_user_roles(
            &self,
            username: &str,
            _current: &BTreeSet<String>,
            desired: &BTreeSet<String>,
        ) -> Result<(), ReconcileError> {
            self.roles.lock().unwrap().insert(username.to_owned(), desired.clone());
            Ok(())
        }
        async fn drop_user(&self, username: &str) -> Result<(), ReconcileError> {
            self.users.lock().unwrap().remove(username);
            self.roles.lock().unwrap().remove(username);
            self.dropped.lock().unwrap().push(username.to_owned());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeState(Mutex<UserMap>);
    #[async_trait]
    impl StateStore for FakeState {
        async fn load(&self) -> Result<UserMap, ReconcileError> {
            Ok(self.0.lock().unwrap().clone())
        }
        async fn save(&self, desired: &UserMap) -> Result<(), ReconcileError> {
            *self.0.lock().unwrap() = desired.clone();
            Ok(())
        }
    }

    /// Wraps a [`FakeDb`] but fails `create_group` for a fixed set of names,
    /// to exercise the gauge re-query against a live view that really
    /// doesn't contain the role the creation attempt failed for.
    #[derive(Default)]
    struct FlakyGroupDb {
        inner: FakeDb,
        fail_groups: BTreeSet<String>,
    }

    #[async_trait]
    impl DbGateway for FlakyGroupDb {
        async fn list_users(&self) -> Result<BTreeSet<String>, ReconcileError> {
            self.inner.list_users().await
        }
        async fn list_groups(&self) -> Result<BTreeSet<String>, ReconcileError> {
            self.inner.list_groups().await
        }
        async fn user_roles(&self, username: &str) -> Result<BTreeSet<String>, ReconcileError> {
            self.inner.user_roles(username).await
        }
        async fn create_group(&self, name: &str) -> Result<(), ReconcileError> {
            if self.fail_groups.contains(name) {
                return Err(ReconcileError::DbPermanent {
                    identifier: name.to_owned(),
                    reason: "simulated failure".to_owned(),
                });
            }
            self.inner.create_group(name).await
        }
        async fn drop_group(&self, name: &str) -> Result<(), ReconcileError> {
            self.inner.drop_group(name).await
        }
        async fn create_user(&self, record: &UserRecord, password: &str) -> Result<(), ReconcileError> {
            self.inner.create_user(record, password).await
        }
        async fn update_user_roles(
            &self,
            username: &str,
            current: &BTreeSet<String>,
            desired: &BTreeSet<String>,
        ) -> Result<(), ReconcileError> {
            self.inner.update_user_roles(username, current, desired).await
        }
        async fn drop_user(&self, username: &str) -> Result<(), ReconcileError> {
            self.inner.drop_user(username).await
        }
    }

    fn user(name: &str, roles: &[&str]) -> UserRecord {
        UserRecord {
            username: name.to_owned(),
            database: "app".to_owned(),
            roles: roles.iter().map(|s| (*s).to_owned()).collect(),
            privileges: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn creates_missing_group_and_user_scenario_a() {
        let mut desired = UserMap::new();
        desired.insert("alice".to_owned(), user("alice", &["billing"]));

        let reconciler = Reconciler::new(
            Arc::new(FakeSpec(desired)),
            Arc::new(FakeSecrets),
            Arc::new(FakeDb::default()),
            Arc::new(FakeState::default()),
            false,
        );

        let (stats, _, _) = reconciler.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(stats.error_count, 0);
        assert!(reconciler.db.list_users().await.unwrap().contains("alice"));
        assert!(reconciler.db.list_groups().await.unwrap().contains("billing"));
    }

    #[tokio::test]
    async fn orphan_protection_keeps_unowned_live_user_scenario_b() {
        let desired = UserMap::new();
        let db = FakeDb::default();
        db.users.lock().unwrap().insert("legacy_admin".to_owned());

        let reconciler = Reconciler::new(
            Arc::new(FakeSpec(desired)),
            Arc::new(FakeSecrets),
            Arc::new(db),
            Arc::new(FakeState::default()),
            false,
        );

        reconciler.run_cycle(Utc::now()).await.unwrap();
        assert!(
            reconciler.db.list_users().await.unwrap().contains("legacy_admin"),
            "user never owned by a prior cycle must survive"
        );
    }

    #[tokio::test]
    async fn owned_user_removed_from_spec_is_dropped_scenario_c() {
        let desired = UserMap::new();
        let db = FakeDb::default();
        db.users.lock().unwrap().insert("bob".to_owned());
        let mut last_applied = UserMap::new();
        last_applied.insert("bob".to_owned(), user("bob", &[]));

        let reconciler = Reconciler::new(
            Arc::new(FakeSpec(desired)),
            Arc::new(FakeSecrets),
            Arc::new(db),
            Arc::new(FakeState(Mutex::new(last_applied))),
            false,
        );

        reconciler.run_cycle(Utc::now()).await.unwrap();
        assert!(!reconciler.db.list_users().await.unwrap().contains("bob"));
    }

    #[tokio::test]
    async fn dry_run_mutates_nothing_scenario_d() {
        let mut desired = UserMap::new();
        desired.insert("alice".to_owned(), user("alice", &["billing"]));

        let reconciler = Reconciler::new(
            Arc::new(FakeSpec(desired)),
            Arc::new(FakeSecrets),
            Arc::new(FakeDb::default()),
            Arc::new(FakeState::default()),
            true,
        );

        reconciler.run_cycle(Utc::now()).await.unwrap();
        assert!(reconciler.db.list_users().await.unwrap().is_empty());
        assert!(reconciler.db.list_groups().await.unwrap().is_empty());
        assert!(reconciler.state.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn denylisted_username_in_spec_is_filtered_without_aborting_the_cycle() {
        let mut desired = UserMap::new();
        desired.insert("postgres".to_owned(), user("postgres", &[]));
        desired.insert("alice".to_owned(), user("alice", &[]));

        let reconciler = Reconciler::new(
            Arc::new(FakeSpec(desired)),
            Arc::new(FakeSecrets),
            Arc::new(FakeDb::default()),
            Arc::new(FakeState::default()),
            false,
        );

        let (stats, _, _) = reconciler.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(stats.error_count, 1, "the denylisted record is rejected and counted");
        assert!(
            !reconciler.db.list_users().await.unwrap().contains("postgres"),
            "a denylisted identifier must never reach any DDL"
        );
        assert!(
            reconciler.db.list_users().await.unwrap().contains("alice"),
            "a valid record elsewhere in the same spec is still applied"
        );
    }

    #[tokio::test]
    async fn invalid_role_name_rejects_only_that_record() {
        let mut desired = UserMap::new();
        desired.insert("bob".to_owned(), user("bob", &["not a valid role"]));
        desired.insert("alice".to_owned(), user("alice", &["billing"]));

        let reconciler = Reconciler::new(
            Arc::new(FakeSpec(desired)),
            Arc::new(FakeSecrets),
            Arc::new(FakeDb::default()),
            Arc::new(FakeState::default()),
            false,
        );

        let (stats, _, _) = reconciler.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(stats.error_count, 1);
        assert!(!reconciler.db.list_users().await.unwrap().contains("bob"));
        assert!(reconciler.db.list_users().await.unwrap().contains("alice"));
    }

    #[tokio::test]
    async fn missing_secret_is_skipped_not_fatal_scenario_f() {
        struct NoSecrets;
        #[async_trait]
        impl SecretSource for NoSecrets {
            async fn password_for(&self, _username: &str) -> Result<Option<String>, ReconcileError> {
                Ok(None)
            }
        }

        let mut desired = UserMap::new();
        desired.insert("alice".to_owned(), user("alice", &[]));

        let reconciler = Reconciler::new(
            Arc::new(FakeSpec(desired)),
            Arc::new(NoSecrets),
            Arc::new(FakeDb::default()),
            Arc::new(FakeState::default()),
            false,
        );

        let (stats, _, _) = reconciler.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(stats.error_count, 1);
        assert!(!reconciler.db.list_users().await.unwrap().contains("alice"));
    }

    #[tokio::test]
    async fn roles_managed_gauge_reflects_a_failed_group_creation() {
        let mut desired = UserMap::new();
        desired.insert("alice".to_owned(), user("alice", &["billing"]));

        let db = FlakyGroupDb {
            inner: FakeDb::default(),
            fail_groups: BTreeSet::from(["billing".to_owned()]),
        };

        let reconciler = Reconciler::new(
            Arc::new(FakeSpec(desired)),
            Arc::new(FakeSecrets),
            Arc::new(db),
            Arc::new(FakeState::default()),
            false,
        );

        let (stats, _, roles_managed) = reconciler.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(stats.error_count, 1, "the failed create_group is counted");
        assert_eq!(roles_managed, 0, "the gauge must reflect the live view, not the attempted creation");
    }
}
