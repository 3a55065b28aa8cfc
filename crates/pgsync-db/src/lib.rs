//! PostgreSQL-backed [`DbGateway`] implementation.
//!
//! Grounded on `vaultrs-storage::postgres_backend::PostgresBackend` for pool
//! construction and error mapping, and `zvault-server::cloud::repository` for
//! per-operation query functions and transaction usage. Unlike that
//! repository module, identifiers here can never be bind parameters —
//! PostgreSQL's wire protocol has no placeholder form for role/database
//! names — so every statement is built with [`quote_ident`] and only values
//! (passwords) are ever bound.

use std::time::Duration;

use async_trait::async_trait;
use pgsync_core::ident::{quote_ident, validate_privilege, validate_privilege_object};
use pgsync_core::{DbGateway, ReconcileError, UserRecord};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Maps a `sqlx::Error` from a read-only query to [`ReconcileError::DbTransient`] —
/// these queries have no identifier to scope a permanent error to, so any
/// failure here is treated as connection-level and aborts the cycle.
fn map_connection_error(err: sqlx::Error) -> ReconcileError {
    ReconcileError::DbTransient { reason: err.to_string() }
}

fn map_statement_error(identifier: &str, err: sqlx::Error) -> ReconcileError {
    ReconcileError::DbPermanent {
        identifier: identifier.to_owned(),
        reason: err.to_string(),
    }
}

/// Pooled, privileged access to the target cluster.
#[derive(Clone)]
pub struct PostgresGateway {
    pool: PgPool,
    /// Role that inherits orphaned ownership when a managed user is dropped.
    controller_admin: String,
    /// Database granted via `CONNECT` to every managed user at creation.
    default_database: String,
}

impl std::fmt::Debug for PostgresGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresGateway")
            .field("pool", &"[PgPool]")
            .field("controller_admin", &self.controller_admin)
            .field("default_database", &self.default_database)
            .finish()
    }
}

impl PostgresGateway {
    /// Connects with a bounded pool (min/max size, connect timeout) — no
    /// migration is run here, unlike the storage-crate precedent: this
    /// controller manages roles, not its own schema.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::FatalStartup`] if the pool cannot be built.
    pub async fn connect(
        database_url: &str,
        min_connections: u32,
        max_connections: u32,
        controller_admin: impl Into<String>,
        default_database: impl Into<String>,
    ) -> Result<Self, ReconcileError> {
        let pool = PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| ReconcileError::FatalStartup {
                reason: format!("failed to connect connection pool: {e}"),
            })?;

        Ok(Self {
            pool,
            controller_admin: controller_admin.into(),
            default_database: default_database.into(),
        })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DbGateway for PostgresGateway {
    async fn list_users(&self) -> Result<BTreeSet<String>, ReconcileError> {
        let rows = sqlx::query("SELECT rolname FROM pg_roles WHERE rolcanlogin")
            .fetch_all(&self.pool)
            .await
            .map_err(map_connection_error)?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("rolname"))
            .filter(|name| !pgsync_core::model::is_denylisted(name))
            .collect())
    }

    async fn list_groups(&self) -> Result<BTreeSet<String>, ReconcileError> {
        let rows = sqlx::query("SELECT rolname FROM pg_roles WHERE NOT rolcanlogin")
            .fetch_all(&self.pool)
            .await
            .map_err(map_connection_error)?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("rolname"))
            .filter(|name| !pgsync_core::model::is_denylisted(name))
            .collect())
    }

    async fn user_roles(&self, username: &str) -> Result<BTreeSet<String>, ReconcileError> {
        let rows = sqlx::query(
            "SELECT g.rolname AS group_name \
             FROM pg_auth_members m \
             JOIN pg_roles g ON g.oid = m.roleid \
             JOIN pg_roles u ON u.oid = m.member \
             WHERE u.rolname = $1",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await
        .map_err(map_connection_error)?;

        Ok(rows.into_iter().map(|row| row.get::<String, _>("group_name")).collect())
    }

    async fn create_group(&self, name: &str) -> Result<(), ReconcileError> {
        let sql = format!("CREATE ROLE {} NOLOGIN", quote_ident(name));
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| map_statement_error(name, e))?;
        debug!(group = name, "created group role");
        Ok(())
    }

    async fn drop_group(&self, name: &str) -> Result<(), ReconcileError> {
        let sql = format!("DROP ROLE IF EXISTS {}", quote_ident(name));
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| map_statement_error(name, e))?;
        debug!(group = name, "dropped group role");
        Ok(())
    }

    async fn create_user(&self, record: &UserRecord, password: &str) -> Result<(), ReconcileError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_statement_error(&record.username, e))?;

        let quoted_user = quote_ident(&record.username);

        sqlx::query(&format!("CREATE USER {quoted_user} WITH PASSWORD $1"))
            .bind(password)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_statement_error(&record.username, e))?;

        sqlx::query(&format!(
            "GRANT CONNECT ON DATABASE {} TO {quoted_user}",
            quote_ident(&record.database)
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_statement_error(&record.username, e))?;

        for role in &record.roles {
            sqlx::query(&format!("GRANT {} TO {quoted_user}", quote_ident(role)))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_statement_error(&record.username, e))?;
        }

        for (object, privileges) in &record.privileges {
            let object = validate_privilege_object(object)?;
            for privilege in privileges {
                let privilege = validate_privilege(privilege)?;
                sqlx::query(&format!(
                    "GRANT {privilege} ON SCHEMA {} TO {quoted_user}",
                    quote_ident(object)
                ))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_statement_error(&record.username, e))?;
            }
        }

        tx.commit().await.map_err(|e| map_statement_error(&record.username, e))?;
        debug!(username = %record.username, "created user and issued initial grants");
        Ok(())
    }

    async fn update_user_roles(
        &self,
        username: &str,
        current: &BTreeSet<String>,
        desired: &BTreeSet<String>,
    ) -> Result<(), ReconcileError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_statement_error(username, e))?;

        let quoted_user = quote_ident(username);

        for role in current.difference(desired) {
            sqlx::query(&format!("REVOKE {} FROM {quoted_user}", quote_ident(role)))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_statement_error(username, e))?;
        }

        for role in desired.difference(current) {
            sqlx::query(&format!("GRANT {} TO {quoted_user}", quote_ident(role)))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_statement_error(username, e))?;
        }

        tx.commit().await.map_err(|e| map_statement_error(username, e))?;
        debug!(username, "reconciled role membership");
        Ok(())
    }

    async fn drop_user(&self, username: &str) -> Result<(), ReconcileError> {
        if username == self.controller_admin {
            warn!(username, "refusing to drop the controller's own admin role");
            return Err(ReconcileError::DbPermanent {
                identifier: username.to_owned(),
                reason: "cannot drop the controller's own admin role".to_owned(),
            });
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_statement_error(username, e))?;

        let quoted_user = quote_ident(username);
        let quoted_admin = quote_ident(&self.controller_admin);
        let quoted_db = quote_ident(&self.default_database);

        sqlx::query(&format!("REVOKE ALL ON DATABASE {quoted_db} FROM {quoted_user}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_statement_error(username, e))?;

        sqlx::query(&format!("REASSIGN OWNED BY {quoted_user} TO {quoted_admin}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_statement_error(username, e))?;

        sqlx::query(&format!("DROP OWNED BY {quoted_user}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_statement_error(username, e))?;

        sqlx::query(&format!("DROP USER IF EXISTS {quoted_user}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_statement_error(username, e))?;

        tx.commit().await.map_err(|e| map_statement_error(username, e))?;
        debug!(username, "dropped user and reassigned ownership");
        Ok(())
    }
}
