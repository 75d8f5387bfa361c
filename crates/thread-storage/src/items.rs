use crate::entity::{build_conditions, take_first, EntityModel, Filter};
use crate::error::StorageError;
use crate::record::{
    conversion_failure, enum_column, json_column, json_value, opt_text, text, timestamp_column,
    timestamp_value, Predicate, Record, RecordStore, Updatable,
};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::Row;
use thread_core::{Item, ItemPatch, ItemRole, NewItem, SortOrder, Visibility};
use tracing::debug;

impl Record for Item {
    const TABLE: &'static str = "thread_items";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "thread_id",
        "role",
        "parts_json",
        "run_id",
        "span_id",
        "parent_id",
        "visibility",
        "attempt",
        "request_id",
        "metadata_json",
        "created_at",
    ];

    type Insert = NewItem;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let attempt: i64 = row.get(8)?;
        Ok(Item {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            role: enum_column(row, 2)?,
            parts: json_column(row, 3)?,
            run_id: row.get(4)?,
            span_id: row.get(5)?,
            parent_id: row.get(6)?,
            visibility: enum_column(row, 7)?,
            attempt: u32::try_from(attempt)
                .map_err(|err| conversion_failure(8, Type::Integer, err))?,
            request_id: row.get(9)?,
            metadata: json_column(row, 10)?,
            created_at: timestamp_column(row, 11)?,
        })
    }

    fn insert_values(
        input: &NewItem,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SqlValue>, StorageError> {
        Ok(vec![
            text(id),
            text(&input.thread_id),
            text(input.role.as_str()),
            json_value(&input.parts)?,
            opt_text(input.run_id.as_deref()),
            opt_text(input.span_id.as_deref()),
            opt_text(input.parent_id.as_deref()),
            text(input.visibility.as_str()),
            SqlValue::Integer(i64::from(input.attempt)),
            text(&input.request_id),
            json_value(&input.metadata)?,
            timestamp_value(now),
        ])
    }
}

impl Updatable for Item {
    type Patch = ItemPatch;

    fn patch_values(patch: &ItemPatch) -> Result<Vec<(&'static str, SqlValue)>, StorageError> {
        Ok(vec![("visibility", text(patch.visibility.as_str()))])
    }
}

/// Optional filters for [`Items::query`]. Unset or empty fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemQuery {
    pub roles: Option<Vec<ItemRole>>,
    pub run_ids: Option<Vec<String>>,
    pub span_ids: Option<Vec<String>>,
    pub visibilities: Option<Vec<Visibility>>,
    pub order: SortOrder,
}

impl ItemQuery {
    fn conditions(&self, thread_id: &str) -> Vec<Predicate> {
        let mut predicates = vec![Predicate::eq("thread_id", thread_id)];
        predicates.extend(build_conditions([
            self.roles
                .as_ref()
                .map(|roles| Filter::new("role", roles.iter().map(ItemRole::as_str))),
            self.run_ids
                .as_ref()
                .map(|ids| Filter::new("run_id", ids.iter().cloned())),
            self.span_ids
                .as_ref()
                .map(|ids| Filter::new("span_id", ids.iter().cloned())),
            self.visibilities.as_ref().map(|visibilities| {
                Filter::new("visibility", visibilities.iter().map(Visibility::as_str))
            }),
        ]));
        predicates
    }
}

pub struct Items<'a> {
    model: EntityModel<'a, Item>,
}

impl<'a> Items<'a> {
    pub(crate) fn new(records: &'a RecordStore) -> Self {
        Self {
            model: EntityModel::new(records),
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Item>, StorageError> {
        self.model.select_by_id(id)
    }

    /// Items in id order, which is append order.
    pub fn list_by_thread(
        &self,
        thread_id: &str,
        order: SortOrder,
    ) -> Result<Vec<Item>, StorageError> {
        let items = self.model.select(&[Predicate::eq("thread_id", thread_id)])?;
        Ok(sorted(items, order))
    }

    pub fn list_by_run(&self, thread_id: &str, run_id: &str) -> Result<Vec<Item>, StorageError> {
        let items = self.model.select(&[
            Predicate::eq("thread_id", thread_id),
            Predicate::eq("run_id", run_id),
        ])?;
        Ok(sorted(items, SortOrder::Asc))
    }

    pub fn list_by_span(&self, thread_id: &str, span_id: &str) -> Result<Vec<Item>, StorageError> {
        let items = self.model.select(&[
            Predicate::eq("thread_id", thread_id),
            Predicate::eq("span_id", span_id),
        ])?;
        Ok(sorted(items, SortOrder::Asc))
    }

    /// What a UI should render.
    pub fn list_visible(&self, thread_id: &str) -> Result<Vec<Item>, StorageError> {
        Ok(self
            .list_by_thread(thread_id, SortOrder::Asc)?
            .into_iter()
            .filter(|item| item.visibility.shown_in_ui())
            .collect())
    }

    /// What an agent should see: hidden items stay in context, archived ones drop out.
    pub fn list_for_context(&self, thread_id: &str) -> Result<Vec<Item>, StorageError> {
        Ok(self
            .list_by_thread(thread_id, SortOrder::Asc)?
            .into_iter()
            .filter(|item| item.visibility.in_agent_context())
            .collect())
    }

    pub fn query(&self, thread_id: &str, query: &ItemQuery) -> Result<Vec<Item>, StorageError> {
        let items = self.model.select(&query.conditions(thread_id))?;
        Ok(sorted(items, query.order))
    }

    pub fn append(&self, item: NewItem) -> Result<Item, StorageError> {
        let appended = self.model.insert_one(item)?;
        debug!(
            event = "item_appended",
            thread_id = %appended.thread_id,
            item_id = %appended.id,
            role = appended.role.as_str()
        );
        Ok(appended)
    }

    /// All or nothing: one invalid item rejects the whole batch.
    pub fn append_many(&self, items: &[NewItem]) -> Result<Vec<Item>, StorageError> {
        self.model.insert(items)
    }

    pub fn set_visibility(&self, id: &str, visibility: Visibility) -> Result<Item, StorageError> {
        self.model.update_by_id(id, &ItemPatch { visibility })
    }

    pub fn archive(&self, id: &str) -> Result<Item, StorageError> {
        self.set_visibility(id, Visibility::Archived)
    }

    pub fn hide(&self, id: &str) -> Result<Item, StorageError> {
        self.set_visibility(id, Visibility::Hidden)
    }

    pub fn get_replies(&self, parent_id: &str) -> Result<Vec<Item>, StorageError> {
        let replies = self.model.select(&[Predicate::eq("parent_id", parent_id)])?;
        Ok(sorted(replies, SortOrder::Asc))
    }

    pub fn get_latest(&self, thread_id: &str) -> Result<Option<Item>, StorageError> {
        let newest_first = self.list_by_thread(thread_id, SortOrder::Desc)?;
        match take_first(newest_first, None) {
            Ok(item) => Ok(Some(item)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn count(&self, thread_id: &str) -> Result<usize, StorageError> {
        self.model.count(&[Predicate::eq("thread_id", thread_id)])
    }
}

fn sorted(mut items: Vec<Item>, order: SortOrder) -> Vec<Item> {
    items.sort_by(|left, right| left.id.cmp(&right.id));
    if order == SortOrder::Desc {
        items.reverse();
    }
    items
}
