use crate::entity::EntityModel;
use crate::error::StorageError;
use crate::record::{
    json_column, json_value, opt_text, text, timestamp_column, timestamp_value, Predicate, Record,
    RecordStore, Updatable,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Row, TransactionBehavior};
use thread_core::{NewThread, Thread, ThreadPatch};
use tracing::debug;

impl Record for Thread {
    const TABLE: &'static str = "threads";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "project_id",
        "scope_type",
        "scope_id",
        "title",
        "metadata_json",
        "created_at",
        "updated_at",
    ];
    const UPDATED_AT_COLUMN: Option<&'static str> = Some("updated_at");

    type Insert = NewThread;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Thread {
            id: row.get(0)?,
            project_id: row.get(1)?,
            scope_type: row.get(2)?,
            scope_id: row.get(3)?,
            title: row.get(4)?,
            metadata: json_column(row, 5)?,
            created_at: timestamp_column(row, 6)?,
            updated_at: timestamp_column(row, 7)?,
        })
    }

    fn insert_values(
        input: &NewThread,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SqlValue>, StorageError> {
        Ok(vec![
            text(id),
            text(&input.project_id),
            opt_text(input.scope_type.as_deref()),
            opt_text(input.scope_id.as_deref()),
            opt_text(input.title.as_deref()),
            json_value(&input.metadata)?,
            timestamp_value(now),
            timestamp_value(now),
        ])
    }
}

impl Updatable for Thread {
    type Patch = ThreadPatch;

    fn patch_values(patch: &ThreadPatch) -> Result<Vec<(&'static str, SqlValue)>, StorageError> {
        let mut assignments = Vec::new();
        if let Some(title) = patch.title.as_deref() {
            assignments.push(("title", text(title)));
        }
        if let Some(metadata) = patch.metadata.as_ref() {
            assignments.push(("metadata_json", json_value(metadata)?));
        }
        Ok(assignments)
    }
}

pub struct Threads<'a> {
    model: EntityModel<'a, Thread>,
}

impl<'a> Threads<'a> {
    pub(crate) fn new(records: &'a RecordStore) -> Self {
        Self {
            model: EntityModel::new(records),
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Thread>, StorageError> {
        self.model.select_by_id(id)
    }

    pub fn create(&self, thread: NewThread) -> Result<Thread, StorageError> {
        let created = self.model.insert_one(thread)?;
        debug!(
            event = "thread_created",
            thread_id = %created.id,
            project_id = %created.project_id
        );
        Ok(created)
    }

    /// Unset scope parts match rows where the column is NULL.
    pub fn find_by_scope(
        &self,
        project_id: &str,
        scope_type: Option<&str>,
        scope_id: Option<&str>,
    ) -> Result<Vec<Thread>, StorageError> {
        self.model.select(&[
            Predicate::eq("project_id", project_id),
            Predicate::eq_nullable("scope_type", scope_type),
            Predicate::eq_nullable("scope_id", scope_id),
        ])
    }

    /// Read and insert share one IMMEDIATE transaction, so two writers racing on the same
    /// scope serialize on the database lock instead of both inserting.
    /// Scope parts and title may be omitted, but any that are given must be non-blank.
    pub fn get_or_create(
        &self,
        project_id: &str,
        scope_type: Option<&str>,
        scope_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<Thread, StorageError> {
        self.model
            .records()
            .atomically(TransactionBehavior::Immediate, || {
                if let Some(existing) = self
                    .find_by_scope(project_id, scope_type, scope_id)?
                    .into_iter()
                    .next()
                {
                    return Ok(existing);
                }
                self.create(NewThread {
                    project_id: project_id.to_string(),
                    scope_type: scope_type.map(str::to_string),
                    scope_id: scope_id.map(str::to_string),
                    title: title.map(str::to_string),
                    ..NewThread::default()
                })
            })
    }

    pub fn list_by_project(&self, project_id: &str) -> Result<Vec<Thread>, StorageError> {
        self.model.select(&[Predicate::eq("project_id", project_id)])
    }

    pub fn update_thread(&self, id: &str, patch: &ThreadPatch) -> Result<Thread, StorageError> {
        self.model.update_by_id(id, patch)
    }
}

#[cfg(test)]
mod tests {
    use crate::{StorageError, ThreadStore};
    use serde_json::json;
    use thread_core::{ContractError, Metadata, NewThread, ThreadPatch};

    #[test]
    fn get_or_create_reuses_the_scope_thread() {
        let store = ThreadStore::open_in_memory().expect("open db");
        let threads = store.threads();

        let first = threads
            .get_or_create("proj1", Some("ticket"), Some("T-101"), Some("Support"))
            .expect("create");
        let second = threads
            .get_or_create("proj1", Some("ticket"), Some("T-101"), Some("Ignored"))
            .expect("reuse");

        assert_eq!(first.id, second.id);
        assert_eq!(second.title.as_deref(), Some("Support"));
        assert_eq!(
            threads
                .find_by_scope("proj1", Some("ticket"), Some("T-101"))
                .expect("find")
                .len(),
            1
        );
    }

    #[test]
    fn find_by_scope_treats_missing_scope_as_null() {
        let store = ThreadStore::open_in_memory().expect("open db");
        let threads = store.threads();
        let unscoped = threads.create(NewThread::new("proj1")).expect("unscoped");
        threads
            .create(NewThread::new("proj1").with_scope("ticket", "T-1"))
            .expect("scoped");

        let found = threads.find_by_scope("proj1", None, None).expect("find");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, unscoped.id);
        assert_eq!(threads.list_by_project("proj1").expect("list").len(), 2);
        assert!(threads.list_by_project("proj2").expect("list").is_empty());
    }

    #[test]
    fn direct_create_does_not_enforce_scope_uniqueness() {
        let store = ThreadStore::open_in_memory().expect("open db");
        let threads = store.threads();
        for _ in 0..2 {
            threads
                .create(NewThread::new("proj1").with_scope("ticket", "T-9"))
                .expect("create");
        }
        assert_eq!(
            threads
                .find_by_scope("proj1", Some("ticket"), Some("T-9"))
                .expect("find")
                .len(),
            2
        );
    }

    #[test]
    fn update_thread_patches_title_and_metadata() {
        let store = ThreadStore::open_in_memory().expect("open db");
        let threads = store.threads();
        let thread = threads
            .create(NewThread::new("proj1").with_title("Draft"))
            .expect("create");

        let mut metadata = Metadata::new();
        metadata.insert("priority".to_string(), json!("high"));
        let updated = threads
            .update_thread(
                &thread.id,
                &ThreadPatch {
                    title: Some("Final".to_string()),
                    metadata: Some(metadata.clone()),
                },
            )
            .expect("update");

        assert_eq!(updated.id, thread.id);
        assert_eq!(updated.title.as_deref(), Some("Final"));
        assert_eq!(updated.metadata, metadata);
        assert!(updated.updated_at >= thread.updated_at);
        assert_eq!(updated.created_at, thread.created_at);
    }

    #[test]
    fn update_thread_reports_missing_ids_and_empty_patches() {
        let store = ThreadStore::open_in_memory().expect("open db");
        let threads = store.threads();

        let missing = threads
            .update_thread(
                "01MISSING",
                &ThreadPatch {
                    title: Some("x".to_string()),
                    metadata: None,
                },
            )
            .expect_err("missing id");
        assert!(missing.is_not_found());

        let thread = threads.create(NewThread::new("proj1")).expect("create");
        let empty = threads
            .update_thread(&thread.id, &ThreadPatch::default())
            .expect_err("empty patch");
        assert!(matches!(
            empty,
            StorageError::Validation(ContractError::EmptyPatch { entity: "thread" })
        ));
    }

    #[test]
    fn invalid_thread_is_rejected_before_insert() {
        let store = ThreadStore::open_in_memory().expect("open db");
        let err = store
            .threads()
            .get_or_create("", Some("ticket"), Some("T-1"), None)
            .expect_err("blank project");
        assert!(matches!(err, StorageError::Validation(_)));
        assert!(store.threads().list_by_project("").expect("list").is_empty());
    }
}
