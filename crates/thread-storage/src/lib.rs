//! SQLite-backed store for conversation threads, their append-only items, dependency edges
//! between items, and resumable generation streams.

mod config;
mod edges;
mod entity;
mod error;
mod items;
mod record;
mod streams;
mod threads;

pub use config::{is_truthy, StoreConfig, DEFAULT_BUSY_TIMEOUT_MS};
pub use edges::Edges;
pub use entity::{build_conditions, take_first, EntityModel, Filter};
pub use error::StorageError;
pub use items::{ItemQuery, Items};
pub use record::{format_timestamp, Predicate, Record, RecordStore, Updatable};
pub use streams::Streams;
pub use threads::Threads;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use thread_core::{SortOrder, ThreadWithItems};
use tracing::{debug, info};

pub const THREAD_SCHEMA_VERSION: i64 = 1;

pub struct ThreadStore {
    records: RecordStore,
    config: StoreConfig,
}

impl ThreadStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_config(StoreConfig::at_path(path.as_ref()))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open_with_config(StoreConfig::in_memory())
    }

    pub fn open_with_config(config: StoreConfig) -> Result<Self, StorageError> {
        let conn = match config.db_path.as_deref() {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(config.busy_timeout())?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        if config.db_path.is_some() {
            let _mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        }

        let store = Self {
            records: RecordStore::new(conn),
            config,
        };
        store.migrate()?;
        debug!(
            event = "thread_store_opened",
            in_memory = store.config.db_path.is_none(),
            enforce_acyclic_edges = store.config.enforce_acyclic_edges
        );
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > THREAD_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: THREAD_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_thread_schema.sql");
            self.conn().execute_batch(sql)?;
            self.conn()
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            info!(event = "schema_migrated", version = 1);
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn()
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn threads(&self) -> Threads<'_> {
        Threads::new(&self.records)
    }

    pub fn items(&self) -> Items<'_> {
        Items::new(&self.records)
    }

    pub fn edges(&self) -> Edges<'_> {
        Edges::new(&self.records, self.config.enforce_acyclic_edges)
    }

    pub fn streams(&self) -> Streams<'_> {
        Streams::new(&self.records, self.config.default_stream_ttl_ms)
    }

    /// The thread with all of its items in append order, or `None` for an unknown id.
    pub fn get_thread_with_items(
        &self,
        thread_id: &str,
    ) -> Result<Option<ThreadWithItems>, StorageError> {
        let Some(thread) = self.threads().get(thread_id)? else {
            return Ok(None);
        };
        let items = self.items().list_by_thread(thread_id, SortOrder::Asc)?;
        Ok(Some(ThreadWithItems { thread, items }))
    }

    /// Runs several model calls as one unit. Any error rolls every write back.
    pub fn transaction<T, F>(&self, operation: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Self) -> Result<T, StorageError>,
    {
        self.records
            .atomically(TransactionBehavior::Immediate, || operation(self))
    }

    fn conn(&self) -> &Connection {
        self.records.connection()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use thread_core::{ItemRole, NewItem, NewThread};

    #[test]
    fn migration_creates_thread_tables() {
        let db = ThreadStore::open_in_memory().expect("open db");

        for table in ["threads", "thread_items", "thread_edges", "thread_streams"] {
            assert!(db.table_exists(table).expect("table check"));
        }
        assert!(!db.table_exists("raw_events").expect("table check"));

        assert_eq!(
            db.schema_version().expect("schema version"),
            THREAD_SCHEMA_VERSION
        );
        db.migrate().expect("migrating twice is a no-op");
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let conn = Connection::open(file.path()).expect("open raw db");
            conn.execute_batch("PRAGMA user_version = 7;")
                .expect("bump version");
        }

        match ThreadStore::open(file.path()) {
            Err(StorageError::UnsupportedSchemaVersion { found, supported }) => {
                assert_eq!(found, 7);
                assert_eq!(supported, THREAD_SCHEMA_VERSION);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("newer schema should not open"),
        }
    }

    #[test]
    fn thread_with_items_is_absent_for_unknown_thread() {
        let db = ThreadStore::open_in_memory().expect("open db");
        assert_eq!(
            db.get_thread_with_items("01HZZZZZZZZZZZZZZZZZZZZZZZ")
                .expect("lookup"),
            None
        );
    }

    #[test]
    fn thread_with_items_reads_are_stable() {
        let db = ThreadStore::open_in_memory().expect("open db");
        let thread = db.threads().create(NewThread::new("proj1")).expect("thread");
        db.items()
            .append(NewItem::new(&thread.id, ItemRole::User, "r1").with_text("Hello"))
            .expect("item");

        let first = db.get_thread_with_items(&thread.id).expect("first read");
        let second = db.get_thread_with_items(&thread.id).expect("second read");
        assert_eq!(first, second);
        let Some(loaded) = first else {
            panic!("thread should exist");
        };
        assert_eq!(loaded.thread, thread);
        assert_eq!(loaded.items.len(), 1);
    }

    #[test]
    fn transaction_rolls_back_every_write_on_error() {
        let db = ThreadStore::open_in_memory().expect("open db");
        let thread = db.threads().create(NewThread::new("proj1")).expect("thread");

        let result: Result<(), StorageError> = db.transaction(|store| {
            let item = store
                .items()
                .append(NewItem::new(&thread.id, ItemRole::User, "r1"))?;
            store
                .edges()
                .add_dependency(&thread.id, &item.id, "missing-target", "r1")?;
            Err(StorageError::NotFound("abandon".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(db.items().count(&thread.id).expect("count"), 0);
        assert!(db.edges().list_by_thread(&thread.id).expect("edges").is_empty());

        let committed = db
            .transaction(|store| {
                store
                    .items()
                    .append(NewItem::new(&thread.id, ItemRole::User, "r2"))
            })
            .expect("commit");
        assert_eq!(
            db.items().get(&committed.id).expect("get"),
            Some(committed)
        );
    }
}
