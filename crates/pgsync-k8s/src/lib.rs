//! Kubernetes-backed [`SpecSource`] and [`SecretSource`] implementations.
//!
//! Grounded on `adolago-rustible`'s `k8s_configmap`/`k8s_secret` modules for
//! the typed `kube::Api` handle scoped to a namespace (the teacher itself
//! carries no Kubernetes client, so this crate enriches from the rest of the
//! retrieval pack). The exponential-backoff retry helper is grounded on the
//! teacher's own `sdks/rust/src/client.rs::sleep_with_jitter`.
//!
//! `ConfigMapSpecSource` substitutes its configured default database for any
//! `UserRecord` whose `database` field came back empty from YAML.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use pgsync_core::{ReconcileError, SecretSource, SpecSource, UserMap, UserRecord};
use serde::Deserialize;
use tracing::{debug, warn};

/// Shape of the YAML blob stored under `data["users.yaml"]`.
#[derive(Debug, Deserialize)]
struct DesiredSpecDoc {
    #[serde(default)]
    users: Vec<UserRecord>,
}

/// Retries `attempt` times (0-indexed) with exponential backoff: delay
/// `base.powi(attempt)` seconds, capped at 30s per attempt.
async fn backoff_sleep(attempt: u32, base: f64) {
    let seconds = base.powi(attempt.try_into().unwrap_or(i32::MAX)).min(30.0);
    tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
}

/// `true` for a definitive "not found" API response.
fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(body) if body.code == 404)
}

/// Runs `op` up to `max_retries + 1` times, sleeping with exponential
/// backoff between attempts. A `404` is never retried — callers check for
/// it with [`is_not_found`] before this runs, or handle it via the returned
/// `Err` when `op` itself surfaces it.
async fn fetch_with_retry<T, F, Fut>(max_retries: u32, backoff_base: f64, mut op: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, kube::Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_not_found(&err) => return Err(err),
            Err(err) if attempt < max_retries => {
                warn!(attempt, error = %err, "transient fetch failure, retrying");
                backoff_sleep(attempt, backoff_base).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Fetches the desired spec from a named `ConfigMap`'s `users.yaml` key.
pub struct ConfigMapSpecSource {
    api: Api<ConfigMap>,
    name: String,
    max_retries: u32,
    backoff_base: f64,
    /// Substituted for any `UserRecord.database` left empty by the spec.
    default_database: String,
}

impl ConfigMapSpecSource {
    #[must_use]
    pub fn new(
        client: kube::Client,
        namespace: &str,
        name: impl Into<String>,
        max_retries: u32,
        backoff_base: f64,
        default_database: impl Into<String>,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
            max_retries,
            backoff_base,
            default_database: default_database.into(),
        }
    }
}

#[async_trait]
impl SpecSource for ConfigMapSpecSource {
    async fn fetch_desired(&self) -> Result<Option<UserMap>, ReconcileError> {
        let name = self.name.clone();
        let result = fetch_with_retry(self.max_retries, self.backoff_base, || {
            let api = &self.api;
            let name = name.clone();
            async move { api.get(&name).await }
        })
        .await;

        let configmap = match result {
            Ok(configmap) => configmap,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => {
                return Err(ReconcileError::ConfigMissing).inspect_err(|_| {
                    warn!(error = %err, "spec source fetch failed after exhausting retries");
                });
            }
        };

        let Some(data) = configmap.data else {
            return Ok(Some(UserMap::new()));
        };
        let Some(yaml) = data.get("users.yaml") else {
            return Ok(Some(UserMap::new()));
        };

        let doc: DesiredSpecDoc = match serde_yaml::from_str(yaml) {
            Ok(doc) => doc,
            Err(err) => {
                return Err(ReconcileError::ConfigMalformed { reason: err.to_string() });
            }
        };

        Ok(Some(
            doc.users
                .into_iter()
                .map(|mut record| {
                    if record.database.is_empty() {
                        record.database.clone_from(&self.default_database);
                    }
                    (record.username.clone(), record)
                })
                .collect(),
        ))
    }
}

/// Resolves per-user passwords from `Secret` objects named
/// `user-<slug>-secret`.
pub struct SecretsSecretSource {
    api: Api<Secret>,
    max_retries: u32,
    backoff_base: f64,
}

impl SecretsSecretSource {
    #[must_use]
    pub fn new(client: kube::Client, namespace: &str, max_retries: u32, backoff_base: f64) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            max_retries,
            backoff_base,
        }
    }

    fn secret_name(username: &str) -> String {
        format!("user-{}-secret", username.replace('_', "-"))
    }
}

#[async_trait]
impl SecretSource for SecretsSecretSource {
    async fn password_for(&self, username: &str) -> Result<Option<String>, ReconcileError> {
        let name = Self::secret_name(username);
        let result = fetch_with_retry(self.max_retries, self.backoff_base, || {
            let api = &self.api;
            let name = name.clone();
            async move { api.get(&name).await }
        })
        .await;

        let secret = match result {
            Ok(secret) => secret,
            Err(err) if is_not_found(&err) => {
                debug!(username, secret = %name, "no secret found for user");
                return Ok(None);
            }
            Err(err) => {
                return Err(ReconcileError::SecretMissing {
                    username: username.to_owned(),
                })
                .inspect_err(|_| warn!(username, error = %err, "secret source fetch failed after exhausting retries"));
            }
        };

        let Some(data) = secret.data else {
            return Ok(None);
        };
        let Some(password_bytes) = data.get("password") else {
            return Ok(None);
        };

        match String::from_utf8(password_bytes.0.clone()) {
            Ok(password) => Ok(Some(password)),
            Err(err) => Err(ReconcileError::SecretMissing {
                username: format!("{username} (non-utf8 password: {err})"),
            }),
        }
    }
}
