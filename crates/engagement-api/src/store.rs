use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use engagement_store_sqlite::SqliteSignalStore;
use parking_lot::Mutex;

use crate::error::{ApiError, ApiResult};

/// Shared `SQLite` access for async callers.
///
/// The primary path reuses one long-lived connection (and its statement cache); the
/// fresh path opens a new connection per call and is used when the primary fails.
/// Both run on the blocking pool.
#[derive(Clone)]
pub struct SignalStoreHandle {
    db_path: PathBuf,
    primary: Arc<Mutex<SqliteSignalStore>>,
}

impl SignalStoreHandle {
    /// # Errors
    /// Returns [`ApiError::StoreUnavailable`] when the database cannot be opened.
    pub fn open(db_path: &Path) -> ApiResult<Self> {
        let store = SqliteSignalStore::open(db_path).map_err(|err| ApiError::store(&err))?;
        Ok(Self { db_path: db_path.to_path_buf(), primary: Arc::new(Mutex::new(store)) })
    }

    /// Pair an already-open primary store with the path fresh connections use.
    #[cfg(test)]
    pub(crate) fn from_parts(db_path: &Path, primary: SqliteSignalStore) -> Self {
        Self { db_path: db_path.to_path_buf(), primary: Arc::new(Mutex::new(primary)) }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) async fn with_primary<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteSignalStore) -> Result<T> + Send + 'static,
    {
        let primary = Arc::clone(&self.primary);
        tokio::task::spawn_blocking(move || {
            let mut store = primary.lock();
            op(&mut *store)
        })
        .await
        .map_err(|err| anyhow!("signal store task failed: {err}"))?
    }

    pub(crate) async fn with_fresh<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteSignalStore) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut store = SqliteSignalStore::open(&db_path)?;
            op(&mut store)
        })
        .await
        .map_err(|err| anyhow!("signal store task failed: {err}"))?
    }
}
