//! File-backed [`StateStore`] implementation.
//!
//! Grounded on `zvault-storage`'s dedicated-storage-crate split (one crate
//! per persistence concern). The write-temp-then-rename sequence itself has
//! no direct teacher precedent — the teacher's on-disk backends (RocksDB,
//! redb) delegate durability to their own engines — so it is built from
//! first principles here and called out as novel in the design ledger.

use std::path::PathBuf;

use async_trait::async_trait;
use pgsync_core::{ReconcileError, StateStore, UserMap};
use tracing::{debug, warn};

/// Persists the last-applied [`UserMap`] as a single JSON file.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        let file_name = temp
            .file_name()
            .map(|n| format!(".{}.tmp", n.to_string_lossy()))
            .unwrap_or_else(|| ".state.tmp".to_owned());
        temp.set_file_name(file_name);
        temp
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<UserMap, ReconcileError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => Ok(map),
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "state file malformed; treating as empty");
                    Ok(UserMap::new())
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no prior state file; starting from empty");
                Ok(UserMap::new())
            }
            Err(err) => Err(ReconcileError::StateIo { reason: err.to_string() }),
        }
    }

    async fn save(&self, desired: &UserMap) -> Result<(), ReconcileError> {
        let bytes = serde_json::to_vec_pretty(desired).map_err(|err| ReconcileError::StateIo {
            reason: format!("failed to encode state: {err}"),
        })?;

        let temp_path = self.temp_path();

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| ReconcileError::StateIo { reason: err.to_string() })?;
        }

        tokio::fs::write(&temp_path, &bytes)
            .await
            .map_err(|err| ReconcileError::StateIo { reason: err.to_string() })?;

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|err| ReconcileError::StateIo { reason: err.to_string() })?;

        debug!(path = %self.path.display(), users = desired.len(), "persisted last-applied state");
        Ok(())
    }
}
