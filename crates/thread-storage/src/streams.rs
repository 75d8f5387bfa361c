use crate::entity::EntityModel;
use crate::error::StorageError;
use crate::record::{
    enum_column, json_column, json_value, opt_text, optional_timestamp_column, text,
    timestamp_column, timestamp_value, Predicate, Record, RecordStore, Updatable,
};
use chrono::{DateTime, Datelike, Duration, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::Row;
use thread_core::{ContractError, NewStream, Stream, StreamPatch, StreamSnapshot, StreamStatus};
use tracing::{debug, info};

impl Record for Stream {
    const TABLE: &'static str = "thread_streams";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "thread_id",
        "run_id",
        "status",
        "resume_token",
        "last_event_id",
        "snapshot_json",
        "expires_at",
        "created_at",
        "updated_at",
    ];
    const UPDATED_AT_COLUMN: Option<&'static str> = Some("updated_at");

    type Insert = NewStream;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Stream {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            run_id: row.get(2)?,
            status: enum_column(row, 3)?,
            resume_token: row.get(4)?,
            last_event_id: row.get(5)?,
            snapshot: json_column(row, 6)?,
            expires_at: optional_timestamp_column(row, 7)?,
            created_at: timestamp_column(row, 8)?,
            updated_at: timestamp_column(row, 9)?,
        })
    }

    fn insert_values(
        input: &NewStream,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SqlValue>, StorageError> {
        Ok(vec![
            text(id),
            text(&input.thread_id),
            opt_text(input.run_id.as_deref()),
            text(StreamStatus::Active.as_str()),
            SqlValue::Null,
            SqlValue::Null,
            json_value(&StreamSnapshot::default())?,
            input.expires_at.map(timestamp_value).unwrap_or(SqlValue::Null),
            timestamp_value(now),
            timestamp_value(now),
        ])
    }
}

impl Updatable for Stream {
    type Patch = StreamPatch;

    fn patch_values(patch: &StreamPatch) -> Result<Vec<(&'static str, SqlValue)>, StorageError> {
        let mut assignments = Vec::new();
        if let Some(status) = patch.status {
            assignments.push(("status", text(status.as_str())));
        }
        if let Some(token) = patch.resume_token.as_deref() {
            assignments.push(("resume_token", text(token)));
        }
        if let Some(event_id) = patch.last_event_id.as_deref() {
            assignments.push(("last_event_id", text(event_id)));
        }
        if let Some(snapshot) = patch.snapshot.as_ref() {
            assignments.push(("snapshot_json", json_value(snapshot)?));
        }
        Ok(assignments)
    }
}

/// Resumable generation state. Every mutation is a single conditional UPDATE on the current
/// status, so a concurrent sweep and a completion cannot both win.
pub struct Streams<'a> {
    model: EntityModel<'a, Stream>,
    default_ttl_ms: Option<u64>,
}

impl<'a> Streams<'a> {
    pub(crate) fn new(records: &'a RecordStore, default_ttl_ms: Option<u64>) -> Self {
        Self {
            model: EntityModel::new(records),
            default_ttl_ms,
        }
    }

    /// Opens an active stream. Without `expires_in_ms` the store's default TTL applies, and
    /// without either the stream never expires.
    pub fn start(
        &self,
        thread_id: &str,
        run_id: Option<&str>,
        expires_in_ms: Option<u64>,
    ) -> Result<Stream, StorageError> {
        let expires_at = match expires_in_ms.or(self.default_ttl_ms) {
            Some(ttl_ms) => Some(expiry_after(Utc::now(), ttl_ms)?),
            None => None,
        };
        let stream = self.model.insert_one(NewStream {
            thread_id: thread_id.to_string(),
            run_id: run_id.map(str::to_string),
            expires_at,
        })?;
        debug!(
            event = "stream_started",
            stream_id = %stream.id,
            thread_id = %stream.thread_id,
            run_id = stream.run_id.as_deref().unwrap_or("")
        );
        Ok(stream)
    }

    pub fn get(&self, id: &str) -> Result<Option<Stream>, StorageError> {
        self.model.select_by_id(id)
    }

    /// The most recently started active stream of the thread.
    pub fn get_active(&self, thread_id: &str) -> Result<Option<Stream>, StorageError> {
        let streams = self.model.select(&[
            Predicate::eq("thread_id", thread_id),
            Predicate::eq("status", StreamStatus::Active.as_str()),
        ])?;
        Ok(newest(streams))
    }

    pub fn get_by_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<Option<Stream>, StorageError> {
        let streams = self.model.select(&[
            Predicate::eq("thread_id", thread_id),
            Predicate::eq("run_id", run_id),
        ])?;
        Ok(newest(streams))
    }

    pub fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Stream>, StorageError> {
        let mut streams = self.model.select(&[Predicate::eq("thread_id", thread_id)])?;
        streams.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(streams)
    }

    pub fn get_by_resume_token(&self, resume_token: &str) -> Result<Option<Stream>, StorageError> {
        let streams = self
            .model
            .select(&[Predicate::eq("resume_token", resume_token)])?;
        Ok(streams.into_iter().next())
    }

    /// Replaces the snapshot wholesale. Status is left alone.
    pub fn update_snapshot(
        &self,
        id: &str,
        snapshot: StreamSnapshot,
        last_event_id: Option<&str>,
    ) -> Result<Stream, StorageError> {
        self.guarded_update(
            id,
            StreamStatus::Active,
            &StreamPatch {
                snapshot: Some(snapshot),
                last_event_id: last_event_id.map(str::to_string),
                ..StreamPatch::default()
            },
        )
    }

    pub fn set_resume_token(&self, id: &str, resume_token: &str) -> Result<Stream, StorageError> {
        self.guarded_update(
            id,
            StreamStatus::Active,
            &StreamPatch {
                resume_token: Some(resume_token.to_string()),
                ..StreamPatch::default()
            },
        )
    }

    pub fn complete(&self, id: &str) -> Result<Stream, StorageError> {
        self.finish(id, StreamStatus::Completed)
    }

    pub fn abort(&self, id: &str) -> Result<Stream, StorageError> {
        self.finish(id, StreamStatus::Aborted)
    }

    pub fn expire_stale(&self) -> Result<usize, StorageError> {
        self.expire_stale_at(Utc::now())
    }

    /// Marks active streams whose expiry lies strictly before `now` as expired.
    pub fn expire_stale_at(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let expired = self.model.update(
            &[
                Predicate::eq("status", StreamStatus::Active.as_str()),
                Predicate::before("expires_at", now),
            ],
            &StreamPatch {
                status: Some(StreamStatus::Expired),
                ..StreamPatch::default()
            },
        )?;
        if !expired.is_empty() {
            info!(event = "streams_expired", count = expired.len());
        }
        Ok(expired.len())
    }

    pub fn can_resume(&self, id: &str) -> Result<bool, StorageError> {
        self.can_resume_at(id, Utc::now())
    }

    pub fn can_resume_at(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        Ok(self
            .get(id)?
            .is_some_and(|stream| stream.is_resumable_at(now)))
    }

    fn finish(&self, id: &str, target: StreamStatus) -> Result<Stream, StorageError> {
        let stream = self.guarded_update(
            id,
            target,
            &StreamPatch {
                status: Some(target),
                ..StreamPatch::default()
            },
        )?;
        debug!(event = "stream_finished", stream_id = %stream.id, status = target.as_str());
        Ok(stream)
    }

    /// Applies `patch` only while the stream's current status may move to `target`.
    fn guarded_update(
        &self,
        id: &str,
        target: StreamStatus,
        patch: &StreamPatch,
    ) -> Result<Stream, StorageError> {
        let allowed = StreamStatus::ALL
            .into_iter()
            .filter(|current| current.can_transition_to(target))
            .map(|current| current.as_str());
        let updated = self.model.update(
            &[Predicate::eq("id", id), Predicate::one_of("status", allowed)],
            patch,
        )?;
        if let Some(stream) = updated.into_iter().next() {
            return Ok(stream);
        }

        match self.get(id)? {
            None => Err(StorageError::NotFound(format!("stream {id}"))),
            Some(current) => Err(StorageError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: target,
            }),
        }
    }
}

// Four-digit years keep stored timestamps parseable and their text order chronological.
const MAX_EXPIRY_YEAR: i32 = 9999;

fn expiry_after(now: DateTime<Utc>, ttl_ms: u64) -> Result<DateTime<Utc>, StorageError> {
    i64::try_from(ttl_ms)
        .ok()
        .map(Duration::milliseconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .filter(|expires_at| expires_at.year() <= MAX_EXPIRY_YEAR)
        .ok_or_else(|| {
            ContractError::InvalidValue {
                field: "expires_in_ms",
                reason: format!("{ttl_ms}ms is out of range"),
            }
            .into()
        })
}

fn newest(streams: Vec<Stream>) -> Option<Stream> {
    streams.into_iter().max_by(|left, right| left.id.cmp(&right.id))
}
