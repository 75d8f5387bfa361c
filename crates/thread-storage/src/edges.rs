use crate::entity::EntityModel;
use crate::error::StorageError;
use crate::record::{
    enum_column, text, timestamp_column, timestamp_value, Predicate, Record, RecordStore,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Row, TransactionBehavior};
use std::collections::BTreeSet;
use thread_core::dag;
use thread_core::{DagStructure, Edge, EdgeType, NewEdge};
use tracing::{debug, warn};

// Edges are immutable once written, so there is no `Updatable` impl.
impl Record for Edge {
    const TABLE: &'static str = "thread_edges";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "thread_id",
        "from_item_id",
        "to_item_id",
        "edge_type",
        "request_id",
        "created_at",
    ];

    type Insert = NewEdge;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Edge {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            from_item_id: row.get(2)?,
            to_item_id: row.get(3)?,
            edge_type: enum_column(row, 4)?,
            request_id: row.get(5)?,
            created_at: timestamp_column(row, 6)?,
        })
    }

    fn insert_values(
        input: &NewEdge,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SqlValue>, StorageError> {
        Ok(vec![
            text(id),
            text(&input.thread_id),
            text(&input.from_item_id),
            text(&input.to_item_id),
            text(input.edge_type.as_str()),
            text(&input.request_id),
            timestamp_value(now),
        ])
    }
}

/// Dependency links between items. An edge `from -> to` means `to` waits on `from`.
pub struct Edges<'a> {
    model: EntityModel<'a, Edge>,
    enforce_acyclic: bool,
}

impl<'a> Edges<'a> {
    pub(crate) fn new(records: &'a RecordStore, enforce_acyclic: bool) -> Self {
        Self {
            model: EntityModel::new(records),
            enforce_acyclic,
        }
    }

    pub fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Edge>, StorageError> {
        self.select_ordered(&[Predicate::eq("thread_id", thread_id)])
    }

    /// Edges pointing at `to_item_id`: what it waits on.
    pub fn get_dependencies(&self, to_item_id: &str) -> Result<Vec<Edge>, StorageError> {
        self.select_ordered(&[Predicate::eq("to_item_id", to_item_id)])
    }

    /// Edges leaving `from_item_id`: what waits on it.
    pub fn get_dependents(&self, from_item_id: &str) -> Result<Vec<Edge>, StorageError> {
        self.select_ordered(&[Predicate::eq("from_item_id", from_item_id)])
    }

    pub fn add_dependency(
        &self,
        thread_id: &str,
        from_item_id: &str,
        to_item_id: &str,
        request_id: &str,
    ) -> Result<Edge, StorageError> {
        self.add_edge(
            thread_id,
            from_item_id,
            to_item_id,
            request_id,
            EdgeType::DependsOn,
        )
    }

    pub fn add_edge(
        &self,
        thread_id: &str,
        from_item_id: &str,
        to_item_id: &str,
        request_id: &str,
        edge_type: EdgeType,
    ) -> Result<Edge, StorageError> {
        let edge = NewEdge {
            thread_id: thread_id.to_string(),
            from_item_id: from_item_id.to_string(),
            to_item_id: to_item_id.to_string(),
            edge_type,
            request_id: request_id.to_string(),
        };
        if !self.enforce_acyclic {
            return self.insert_edge(edge);
        }

        self.model
            .records()
            .atomically(TransactionBehavior::Immediate, || {
                let existing = self.list_by_thread(thread_id)?;
                if dag::would_create_cycle(&existing, from_item_id, to_item_id) {
                    warn!(
                        event = "edge_rejected",
                        thread_id,
                        from = from_item_id,
                        to = to_item_id,
                        reason = "cycle"
                    );
                    return Err(StorageError::CycleDetected {
                        from: from_item_id.to_string(),
                        to: to_item_id.to_string(),
                    });
                }
                self.insert_edge(edge)
            })
    }

    pub fn get_dag_structure(&self, thread_id: &str) -> Result<DagStructure, StorageError> {
        Ok(dag::dag_structure(&self.list_by_thread(thread_id)?))
    }

    /// Vacuously true for an item with no dependencies.
    pub fn are_dependencies_satisfied(
        &self,
        to_item_id: &str,
        completed_item_ids: &BTreeSet<String>,
    ) -> Result<bool, StorageError> {
        let dependencies = self.get_dependencies(to_item_id)?;
        Ok(dag::dependencies_satisfied(&dependencies, completed_item_ids))
    }

    pub fn ready_items(
        &self,
        thread_id: &str,
        completed_item_ids: &BTreeSet<String>,
    ) -> Result<Vec<String>, StorageError> {
        Ok(dag::ready_nodes(
            &self.list_by_thread(thread_id)?,
            completed_item_ids,
        ))
    }

    pub fn topological_order(&self, thread_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(dag::topological_order(&self.list_by_thread(thread_id)?)?)
    }

    pub fn remove_dependency(
        &self,
        from_item_id: &str,
        to_item_id: &str,
    ) -> Result<(), StorageError> {
        self.model.delete(&[
            Predicate::eq("from_item_id", from_item_id),
            Predicate::eq("to_item_id", to_item_id),
        ])
    }

    fn insert_edge(&self, edge: NewEdge) -> Result<Edge, StorageError> {
        let created = self.model.insert_one(edge)?;
        debug!(
            event = "edge_added",
            thread_id = %created.thread_id,
            from = %created.from_item_id,
            to = %created.to_item_id,
            edge_type = created.edge_type.as_str()
        );
        Ok(created)
    }

    fn select_ordered(&self, predicates: &[Predicate]) -> Result<Vec<Edge>, StorageError> {
        let mut edges = self.model.select(predicates)?;
        edges.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use crate::{StorageError, StoreConfig, ThreadStore};
    use std::collections::BTreeSet;
    use thread_core::{ContractError, DagEdge, EdgeType, ItemRole, NewItem, NewThread};

    struct Fixture {
        store: ThreadStore,
        thread_id: String,
    }

    impl Fixture {
        fn new(config: StoreConfig) -> Self {
            let store = ThreadStore::open_with_config(config).expect("open db");
            let thread_id = store
                .threads()
                .create(NewThread::new("proj1"))
                .expect("thread")
                .id;
            Self { store, thread_id }
        }

        fn item(&self) -> String {
            self.store
                .items()
                .append(NewItem::new(&self.thread_id, ItemRole::Assistant, "r1"))
                .expect("item")
                .id
        }

        fn depend(&self, from: &str, to: &str) -> Result<(), StorageError> {
            self.store
                .edges()
                .add_dependency(&self.thread_id, from, to, "r1")
                .map(|_| ())
        }
    }

    fn completed(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn fan_in_dependencies_gate_the_target() {
        let fx = Fixture::new(StoreConfig::in_memory());
        let (a, b, c) = (fx.item(), fx.item(), fx.item());
        fx.depend(&a, &c).expect("a -> c");
        fx.depend(&b, &c).expect("b -> c");
        let edges = fx.store.edges();

        assert!(!edges
            .are_dependencies_satisfied(&c, &completed(&[&a]))
            .expect("partial"));
        assert!(edges
            .are_dependencies_satisfied(&c, &completed(&[&a, &b]))
            .expect("all"));
        assert!(edges
            .are_dependencies_satisfied(&a, &completed(&[]))
            .expect("no deps"));
        assert_eq!(edges.get_dependencies(&c).expect("deps").len(), 2);
        assert_eq!(edges.get_dependents(&a).expect("dependents").len(), 1);
    }

    #[test]
    fn dag_structure_lists_endpoints_once() {
        let fx = Fixture::new(StoreConfig::in_memory());
        let (a, b, c) = (fx.item(), fx.item(), fx.item());
        fx.depend(&a, &b).expect("a -> b");
        fx.depend(&b, &c).expect("b -> c");

        let dag = fx.store.edges().get_dag_structure(&fx.thread_id).expect("dag");
        assert_eq!(dag.nodes, vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(
            dag.edges,
            vec![
                DagEdge {
                    from: a.clone(),
                    to: b.clone(),
                    edge_type: EdgeType::DependsOn
                },
                DagEdge {
                    from: b,
                    to: c,
                    edge_type: EdgeType::DependsOn
                },
            ]
        );
    }

    #[test]
    fn ready_items_and_topological_order_follow_the_graph() {
        let fx = Fixture::new(StoreConfig::in_memory());
        let (a, b, c) = (fx.item(), fx.item(), fx.item());
        fx.depend(&a, &c).expect("a -> c");
        fx.depend(&b, &c).expect("b -> c");
        let edges = fx.store.edges();

        assert_eq!(
            edges.ready_items(&fx.thread_id, &completed(&[])).expect("ready"),
            vec![a.clone(), b.clone()]
        );
        assert_eq!(
            edges
                .ready_items(&fx.thread_id, &completed(&[&a, &b]))
                .expect("ready"),
            vec![c.clone()]
        );
        assert_eq!(
            edges.topological_order(&fx.thread_id).expect("order"),
            vec![a, b, c]
        );
    }

    #[test]
    fn cycles_are_stored_unless_enforcement_is_on() {
        let fx = Fixture::new(StoreConfig::in_memory());
        let (a, b) = (fx.item(), fx.item());
        fx.depend(&a, &b).expect("a -> b");
        fx.depend(&b, &a).expect("b -> a stored without guard");

        let edges = fx.store.edges();
        assert!(!edges
            .are_dependencies_satisfied(&a, &completed(&[]))
            .expect("cycle member"));
        let err = edges.topological_order(&fx.thread_id).expect_err("cycle");
        assert!(matches!(
            err,
            StorageError::Validation(ContractError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn enforcement_rejects_closing_edges_and_self_loops() {
        let fx = Fixture::new(StoreConfig {
            enforce_acyclic_edges: true,
            ..StoreConfig::in_memory()
        });
        let (a, b, c) = (fx.item(), fx.item(), fx.item());
        fx.depend(&a, &b).expect("a -> b");
        fx.depend(&b, &c).expect("b -> c");

        let err = fx.depend(&c, &a).expect_err("closes cycle");
        assert!(matches!(err, StorageError::CycleDetected { .. }));
        let err = fx.depend(&b, &b).expect_err("self loop");
        assert!(matches!(err, StorageError::CycleDetected { .. }));
        assert_eq!(fx.store.edges().list_by_thread(&fx.thread_id).expect("edges").len(), 2);

        fx.depend(&a, &c).expect("shortcut keeps the graph acyclic");
    }

    #[test]
    fn remove_dependency_deletes_matching_edges() {
        let fx = Fixture::new(StoreConfig::in_memory());
        let (a, b) = (fx.item(), fx.item());
        fx.depend(&a, &b).expect("a -> b");
        fx.store
            .edges()
            .add_edge(&fx.thread_id, &a, &b, "r2", EdgeType::CausedBy)
            .expect("caused by");

        fx.store.edges().remove_dependency(&a, &b).expect("remove");
        assert!(fx.store.edges().get_dependencies(&b).expect("deps").is_empty());
        fx.store
            .edges()
            .remove_dependency(&a, &b)
            .expect("removing nothing is fine");
    }
}
