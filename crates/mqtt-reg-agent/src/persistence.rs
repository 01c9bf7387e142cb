//! `SQLite` persistence layer.
//!
//! Persistent registers share one process-wide store unless they are given
//! their own. The shared store is opened on first use and stays open until
//! [`shutdown_default_store`].

use mqtt_reg_core::{KvStore, StoreError};
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Database page size in bytes.
pub const PAGE_SIZE: u32 = 512;

/// Page cache size in pages.
pub const CACHE_PAGES: u32 = 64;

/// Path of the shared store when none is configured.
pub const DEFAULT_DB_PATH: &str = "./regs.db";

/// `SQLite`-backed key-value store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        // Page size only applies to a fresh database and must precede WAL.
        conn.execute_batch(&format!(
            r"
            PRAGMA page_size = {PAGE_SIZE};
            PRAGMA cache_size = {CACHE_PAGES};
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS registers (
                name BLOB PRIMARY KEY,
                value BLOB NOT NULL
            );
            "
        ))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KvStore for SqliteStore {
    fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn()
            .query_row(
                "SELECT value FROM registers WHERE name = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO registers (name, value) VALUES (?1, ?2)",
                (key, value),
            )
            .map_err(backend)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.conn()
            .execute_batch("PRAGMA wal_checkpoint(FULL);")
            .map_err(backend)
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

struct DefaultStore {
    path: Option<PathBuf>,
    store: Option<Arc<SqliteStore>>,
}

static DEFAULT_STORE: Mutex<DefaultStore> = Mutex::new(DefaultStore {
    path: None,
    store: None,
});

fn default_slot() -> MutexGuard<'static, DefaultStore> {
    DEFAULT_STORE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Set the path used when the shared store is first opened.
///
/// Has no effect on a store that is already open.
pub fn configure_default_store(path: impl Into<PathBuf>) {
    let mut slot = default_slot();
    if slot.store.is_some() {
        tracing::warn!("Default store already open, ignoring new path");
        return;
    }
    slot.path = Some(path.into());
}

/// The shared store, opened on first call.
///
/// # Errors
///
/// Returns error if the database cannot be opened.
pub fn default_store() -> Result<Arc<dyn KvStore>, StoreError> {
    let mut slot = default_slot();
    if let Some(store) = &slot.store {
        return Ok(Arc::clone(store) as Arc<dyn KvStore>);
    }

    let path = slot
        .path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
    tracing::info!(path = %path.display(), "Opening register store");

    let store = Arc::new(SqliteStore::open(&path).map_err(backend)?);
    slot.store = Some(Arc::clone(&store));
    Ok(store as Arc<dyn KvStore>)
}

/// Flush and release the shared store. A later [`default_store`] reopens it.
///
/// # Errors
///
/// Returns error if the final flush fails.
pub fn shutdown_default_store() -> Result<(), StoreError> {
    let store = default_slot().store.take();
    if let Some(store) = store {
        tracing::info!("Closing register store");
        store.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt_reg_core::{Register, ServerRegister};
    use serde_json::{json, Value};

    #[test]
    fn sqlite_store_basic_operations() {
        let store = SqliteStore::in_memory().unwrap();

        assert!(!store.contains(b"lamp").unwrap());
        assert_eq!(store.get(b"lamp").unwrap(), None);

        store.set(b"lamp", b"\x01").unwrap();
        store.flush().unwrap();
        assert!(store.contains(b"lamp").unwrap());
        assert_eq!(store.get(b"lamp").unwrap(), Some(vec![1]));

        store.set(b"lamp", b"\x00").unwrap();
        assert_eq!(store.get(b"lamp").unwrap(), Some(vec![0]));
    }

    #[test]
    fn value_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regs.db");

        {
            let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&path).unwrap());
            let register =
                ServerRegister::persistent_float("brightness", Value::Null, 0.5, store).unwrap();
            register.set_value(json!(0.75)).unwrap();
        }

        let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let register =
            ServerRegister::persistent_float("brightness", Value::Null, 0.5, store).unwrap();
        assert_eq!(register.value().unwrap(), json!(0.75));
    }

    #[test]
    fn default_store_is_shared_and_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        configure_default_store(dir.path().join("default.db"));

        let first = default_store().unwrap();
        let second = default_store().unwrap();
        first.set(b"relay", b"\x01").unwrap();
        assert_eq!(second.get(b"relay").unwrap(), Some(vec![1]));

        shutdown_default_store().unwrap();

        let reopened = default_store().unwrap();
        assert_eq!(reopened.get(b"relay").unwrap(), Some(vec![1]));
        shutdown_default_store().unwrap();
    }
}
