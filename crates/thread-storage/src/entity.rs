use crate::error::StorageError;
use crate::record::{Predicate, Record, RecordStore, Updatable};
use std::marker::PhantomData;

/// Uniform CRUD surface for one entity type. Concrete models wrap one of these instead of
/// writing their own queries.
pub struct EntityModel<'a, R: Record> {
    records: &'a RecordStore,
    _record: PhantomData<fn() -> R>,
}

impl<'a, R: Record> EntityModel<'a, R> {
    pub fn new(records: &'a RecordStore) -> Self {
        Self {
            records,
            _record: PhantomData,
        }
    }

    pub fn records(&self) -> &'a RecordStore {
        self.records
    }

    pub fn select(&self, predicates: &[Predicate]) -> Result<Vec<R>, StorageError> {
        self.records.select(predicates)
    }

    pub fn select_by_id(&self, id: &str) -> Result<Option<R>, StorageError> {
        self.records.select_by_id(id)
    }

    pub fn count(&self, predicates: &[Predicate]) -> Result<usize, StorageError> {
        self.records.count::<R>(predicates)
    }

    pub fn insert(&self, rows: &[R::Insert]) -> Result<Vec<R>, StorageError> {
        self.records.insert(rows)
    }

    pub fn insert_one(&self, row: R::Insert) -> Result<R, StorageError> {
        let inserted = self.insert(std::slice::from_ref(&row))?;
        if inserted.len() != 1 {
            return Err(StorageError::NotFound(format!(
                "expected one inserted {} row, got {}",
                R::TABLE,
                inserted.len()
            )));
        }
        take_first(inserted, None)
    }

    pub fn delete(&self, predicates: &[Predicate]) -> Result<(), StorageError> {
        self.records.delete::<R>(predicates).map(|_| ())
    }
}

impl<'a, R: Updatable> EntityModel<'a, R> {
    pub fn update(
        &self,
        predicates: &[Predicate],
        patch: &R::Patch,
    ) -> Result<Vec<R>, StorageError> {
        self.records.update(predicates, patch)
    }

    pub fn update_by_id(&self, id: &str, patch: &R::Patch) -> Result<R, StorageError> {
        let updated = self.update(&[Predicate::eq(R::ID_COLUMN, id)], patch)?;
        take_first(updated, Some(&format!("{} {id}", R::TABLE)))
    }
}

pub fn take_first<T>(rows: Vec<T>, message: Option<&str>) -> Result<T, StorageError> {
    rows.into_iter()
        .next()
        .ok_or_else(|| StorageError::NotFound(message.unwrap_or("record").to_string()))
}

/// One optional named filter for [`build_conditions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: &'static str,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new<I, S>(column: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            column,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Absent filters and filters without values are skipped; one value becomes an equality,
/// several become an inclusion.
pub fn build_conditions<I>(filters: I) -> Vec<Predicate>
where
    I: IntoIterator<Item = Option<Filter>>,
{
    filters
        .into_iter()
        .flatten()
        .filter(|filter| !filter.values.is_empty())
        .map(|mut filter| {
            if filter.values.len() == 1 {
                Predicate::eq(filter.column, filter.values.remove(0))
            } else {
                Predicate::one_of(filter.column, filter.values)
            }
        })
        .collect()
}
