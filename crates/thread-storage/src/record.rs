//! Generic record access over a single SQLite connection.
//!
//! Every entity table is keyed by a ULID text id. The adapter mints ids, stamps timestamps,
//! and turns predicate lists into parameterized SQL. Column and table names come from
//! `'static` constants on the [`Record`] impls, never from callers.

use crate::error::StorageError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{
    params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use thread_core::{ContractError, Validate};
use tracing::debug;
use ulid::Generator;

/// A table-backed entity.
pub trait Record: Sized {
    const TABLE: &'static str;
    const ID_COLUMN: &'static str = "id";
    /// Column order shared by `from_row` and `insert_values`.
    const COLUMNS: &'static [&'static str];
    const UPDATED_AT_COLUMN: Option<&'static str> = None;

    type Insert: Validate;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    fn insert_values(
        input: &Self::Insert,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SqlValue>, StorageError>;
}

/// Entities with a mutable subset of columns.
pub trait Updatable: Record {
    type Patch: Validate;

    fn patch_values(patch: &Self::Patch) -> Result<Vec<(&'static str, SqlValue)>, StorageError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `NULL` compares with `IS NULL`.
    Eq(&'static str, SqlValue),
    /// Null-safe inequality (`IS NOT`).
    NotEq(&'static str, SqlValue),
    /// An empty list matches nothing.
    In(&'static str, Vec<SqlValue>),
    Before(&'static str, SqlValue),
}

impl Predicate {
    pub fn eq(column: &'static str, value: impl Into<String>) -> Self {
        Predicate::Eq(column, SqlValue::Text(value.into()))
    }

    pub fn eq_nullable(column: &'static str, value: Option<&str>) -> Self {
        Predicate::Eq(column, opt_text(value))
    }

    pub fn not_eq(column: &'static str, value: impl Into<String>) -> Self {
        Predicate::NotEq(column, SqlValue::Text(value.into()))
    }

    pub fn one_of<I, S>(column: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::In(
            column,
            values
                .into_iter()
                .map(|value| SqlValue::Text(value.into()))
                .collect(),
        )
    }

    pub fn before(column: &'static str, timestamp: DateTime<Utc>) -> Self {
        Predicate::Before(column, timestamp_value(timestamp))
    }

    fn render(&self, values: &mut Vec<SqlValue>) -> String {
        match self {
            Predicate::Eq(column, SqlValue::Null) => format!("{column} IS NULL"),
            Predicate::Eq(column, value) => {
                values.push(value.clone());
                format!("{column} = ?")
            }
            Predicate::NotEq(column, SqlValue::Null) => format!("{column} IS NOT NULL"),
            Predicate::NotEq(column, value) => {
                values.push(value.clone());
                format!("{column} IS NOT ?")
            }
            Predicate::In(_, candidates) if candidates.is_empty() => "0 = 1".to_string(),
            Predicate::In(column, candidates) => {
                values.extend(candidates.iter().cloned());
                let placeholders = vec!["?"; candidates.len()].join(", ");
                format!("{column} IN ({placeholders})")
            }
            Predicate::Before(column, value) => {
                values.push(value.clone());
                format!("{column} < ?")
            }
        }
    }
}

const NESTED_SAVEPOINT: &str = "record_store_nested";

/// Shared by every store in the process so ids from different handles on one file still sort
/// in the order they were minted.
static ID_GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();

pub struct RecordStore {
    conn: Connection,
}

impl RecordStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Monotonic within the process: ids minted in the same millisecond still sort in order.
    pub fn next_id(&self) -> Result<String, StorageError> {
        let mut generator = ID_GENERATOR
            .get_or_init(|| Mutex::new(Generator::new()))
            .lock()
            .map_err(|_| StorageError::IdGeneration("id generator lock poisoned".to_string()))?;
        generator
            .generate()
            .map(|id| id.to_string())
            .map_err(|err| StorageError::IdGeneration(err.to_string()))
    }

    pub fn select<R: Record>(&self, predicates: &[Predicate]) -> Result<Vec<R>, StorageError> {
        let mut values = Vec::new();
        let sql = format!(
            "SELECT {} FROM {}{}",
            R::COLUMNS.join(", "),
            R::TABLE,
            where_clause(predicates, &mut values)
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(values), R::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn select_by_id<R: Record>(&self, id: &str) -> Result<Option<R>, StorageError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            R::COLUMNS.join(", "),
            R::TABLE,
            R::ID_COLUMN
        );
        let record = self
            .conn
            .query_row(&sql, [id], R::from_row)
            .optional()?;
        Ok(record)
    }

    pub fn count<R: Record>(&self, predicates: &[Predicate]) -> Result<usize, StorageError> {
        let mut values = Vec::new();
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            R::TABLE,
            where_clause(predicates, &mut values)
        );
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Validates every input before touching the database, then inserts them all in one
    /// transaction.
    pub fn insert<R: Record>(&self, inputs: &[R::Insert]) -> Result<Vec<R>, StorageError> {
        for input in inputs {
            input.validate()?;
        }
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let columns = R::COLUMNS.join(", ");
        let placeholders = vec!["?"; R::COLUMNS.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({columns}) VALUES ({placeholders}) RETURNING {columns}",
            R::TABLE
        );
        let now = Utc::now();

        let records = self.atomically(TransactionBehavior::Deferred, || {
            let mut statement = self.conn.prepare(&sql)?;
            let mut records = Vec::with_capacity(inputs.len());
            for input in inputs {
                let id = self.next_id()?;
                let values = R::insert_values(input, &id, now)?;
                records.push(statement.query_row(params_from_iter(values), R::from_row)?);
            }
            Ok(records)
        })?;

        debug!(event = "records_inserted", table = R::TABLE, count = records.len());
        Ok(records)
    }

    pub fn update<R: Updatable>(
        &self,
        predicates: &[Predicate],
        patch: &R::Patch,
    ) -> Result<Vec<R>, StorageError> {
        patch.validate()?;
        let mut assignments = R::patch_values(patch)?;
        if assignments.is_empty() {
            return Err(ContractError::EmptyPatch { entity: R::TABLE }.into());
        }
        if let Some(column) = R::UPDATED_AT_COLUMN {
            assignments.push((column, timestamp_value(Utc::now())));
        }

        let mut values = Vec::with_capacity(assignments.len());
        let set_clause = assignments
            .into_iter()
            .map(|(column, value)| {
                values.push(value);
                format!("{column} = ?")
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {set_clause}{} RETURNING {}",
            R::TABLE,
            where_clause(predicates, &mut values),
            R::COLUMNS.join(", ")
        );

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(values), R::from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }

        debug!(event = "records_updated", table = R::TABLE, count = records.len());
        Ok(records)
    }

    pub fn delete<R: Record>(&self, predicates: &[Predicate]) -> Result<usize, StorageError> {
        let mut values = Vec::new();
        let sql = format!(
            "DELETE FROM {}{}",
            R::TABLE,
            where_clause(predicates, &mut values)
        );
        let removed = self.conn.execute(&sql, params_from_iter(values))?;
        debug!(event = "records_deleted", table = R::TABLE, count = removed);
        Ok(removed)
    }

    /// Runs `operation` inside a transaction. When one is already open the call nests in a
    /// savepoint instead, so an error undoes only this operation's writes.
    pub fn atomically<T, F>(
        &self,
        behavior: TransactionBehavior,
        operation: F,
    ) -> Result<T, StorageError>
    where
        F: FnOnce() -> Result<T, StorageError>,
    {
        if !self.conn.is_autocommit() {
            return self.within_savepoint(operation);
        }
        let transaction = Transaction::new_unchecked(&self.conn, behavior)?;
        let value = operation()?;
        transaction.commit()?;
        Ok(value)
    }

    fn within_savepoint<T, F>(&self, operation: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> Result<T, StorageError>,
    {
        self.conn.execute_batch(&format!("SAVEPOINT {NESTED_SAVEPOINT}"))?;
        match operation() {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {NESTED_SAVEPOINT}"))?;
                Ok(value)
            }
            Err(err) => {
                self.conn.execute_batch(&format!(
                    "ROLLBACK TO {NESTED_SAVEPOINT}; RELEASE {NESTED_SAVEPOINT}"
                ))?;
                Err(err)
            }
        }
    }
}

fn where_clause(predicates: &[Predicate], values: &mut Vec<SqlValue>) -> String {
    if predicates.is_empty() {
        return String::new();
    }
    let clauses = predicates
        .iter()
        .map(|predicate| predicate.render(values))
        .collect::<Vec<_>>();
    format!(" WHERE {}", clauses.join(" AND "))
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn timestamp_value(timestamp: DateTime<Utc>) -> SqlValue {
    SqlValue::Text(format_timestamp(timestamp))
}

pub(crate) fn text(value: &str) -> SqlValue {
    SqlValue::Text(value.to_string())
}

pub(crate) fn opt_text(value: Option<&str>) -> SqlValue {
    value.map(text).unwrap_or(SqlValue::Null)
}

pub(crate) fn json_value<T: Serialize>(value: &T) -> Result<SqlValue, StorageError> {
    serde_json::to_string(value)
        .map(SqlValue::Text)
        .map_err(|err| StorageError::Serialization(err.to_string()))
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

pub(crate) fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(row.get(index)?).map_err(|err| conversion_failure(index, Type::Text, err))
}

pub(crate) fn optional_timestamp_column(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(index)?
        .map(parse_timestamp)
        .transpose()
        .map_err(|err| conversion_failure(index, Type::Text, err))
}

pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| conversion_failure(index, Type::Text, err))
}

pub(crate) fn enum_column<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(index)?;
    raw.parse().map_err(|message: String| {
        conversion_failure(
            index,
            Type::Text,
            std::io::Error::new(std::io::ErrorKind::InvalidData, message),
        )
    })
}

pub(crate) fn conversion_failure<E>(index: usize, column_type: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, column_type, Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(predicates: &[Predicate]) -> (String, Vec<SqlValue>) {
        let mut values = Vec::new();
        let sql = where_clause(predicates, &mut values);
        (sql, values)
    }

    #[test]
    fn empty_predicates_render_no_where_clause() {
        assert_eq!(render(&[]), (String::new(), Vec::new()));
    }

    #[test]
    fn predicates_render_null_safe_sql_in_order() {
        let (sql, values) = render(&[
            Predicate::eq("thread_id", "t1"),
            Predicate::eq_nullable("scope_id", None),
            Predicate::not_eq("visibility", "archived"),
            Predicate::one_of("status", ["active", "completed"]),
        ]);

        assert_eq!(
            sql,
            " WHERE thread_id = ? AND scope_id IS NULL AND visibility IS NOT ? AND status IN (?, ?)"
        );
        assert_eq!(
            values,
            vec![
                SqlValue::Text("t1".to_string()),
                SqlValue::Text("archived".to_string()),
                SqlValue::Text("active".to_string()),
                SqlValue::Text("completed".to_string()),
            ]
        );
    }

    #[test]
    fn empty_inclusion_matches_nothing() {
        let (sql, values) = render(&[Predicate::one_of("id", Vec::<String>::new())]);
        assert_eq!(sql, " WHERE 0 = 1");
        assert!(values.is_empty());
    }

    #[test]
    fn generated_ids_sort_in_creation_order() {
        let store = RecordStore::new(Connection::open_in_memory().expect("open db"));
        let ids = (0..64)
            .map(|_| store.next_id().expect("next id"))
            .collect::<Vec<_>>();

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert!(ids.iter().all(|id| id.len() == 26));
    }

    #[test]
    fn ids_from_separate_stores_interleave_in_order() {
        let left = RecordStore::new(Connection::open_in_memory().expect("open left"));
        let right = RecordStore::new(Connection::open_in_memory().expect("open right"));
        let ids = (0..128)
            .map(|turn| {
                let store = if turn % 2 == 0 { &left } else { &right };
                store.next_id().expect("next id")
            })
            .collect::<Vec<_>>();

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn nested_failure_rolls_back_to_savepoint_only() {
        let store = RecordStore::new(Connection::open_in_memory().expect("open db"));
        store
            .connection()
            .execute_batch("CREATE TABLE notes (body TEXT NOT NULL);")
            .expect("create table");
        let insert = |body: &str| -> Result<(), StorageError> {
            store
                .connection()
                .execute("INSERT INTO notes (body) VALUES (?1)", [body])?;
            Ok(())
        };

        store
            .atomically(TransactionBehavior::Immediate, || {
                insert("outer")?;
                let nested: Result<(), StorageError> = store
                    .atomically(TransactionBehavior::Deferred, || {
                        insert("inner")?;
                        Err(StorageError::NotFound("abandon".to_string()))
                    });
                assert!(nested.is_err());
                assert!(!store.connection().is_autocommit());
                Ok(())
            })
            .expect("outer commit");

        let bodies = store
            .connection()
            .prepare("SELECT body FROM notes")
            .expect("prepare")
            .query_map([], |row| row.get::<_, String>(0))
            .expect("query")
            .collect::<Result<Vec<_>, _>>()
            .expect("rows");
        assert_eq!(bodies, vec!["outer".to_string()]);
    }

    #[test]
    fn timestamps_format_with_fixed_width() {
        use chrono::TimeZone;
        let timestamp = Utc
            .with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
            .single()
            .expect("valid timestamp");
        assert_eq!(format_timestamp(timestamp), "2026-03-02T09:30:00.000Z");
        assert_eq!(
            parse_timestamp(format_timestamp(timestamp)).expect("parse"),
            timestamp
        );
    }
}
