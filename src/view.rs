//! Client-side optimistic ordering.
//!
//! `ListView` is a reducer: the UI dispatches a drop, the list is spliced at once and a
//! `PersistOrder` effect is emitted. The outcome of that effect comes back as another
//! action, either confirming the new order or asking for a reload of the authoritative
//! list. `OptimisticList` wires the reducer to an `OrderBackend` for one gesture at a time.

use crate::collections::CollectionKind;
use crate::errors::{AppError, AppResult};
use crate::models::{Item, PartitionSnapshot};
use std::future::Future;
use std::pin::Pin;

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = AppResult<T>> + Send + 'a>>;

pub trait OrderBackend: Send + Sync {
    fn load(&self, collection: CollectionKind, partition: Option<String>) -> BackendFuture<'_, PartitionSnapshot>;

    /// Persists a full ordering and yields the partition's new revision.
    fn persist_order(&self, commit: OrderCommit) -> BackendFuture<'_, i64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderCommit {
    pub ticket: u64,
    pub collection: CollectionKind,
    pub partition: Option<String>,
    pub ordered_ids: Vec<String>,
    pub expected_revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragPhase {
    Idle,
    Dragging { from: usize },
    Dropped { ticket: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    Cancelled,
    Confirmed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewAction {
    Loaded(PartitionSnapshot),
    DragStarted { index: usize },
    DragCancelled,
    Dropped { target: usize },
    ReorderConfirmed { ticket: u64, revision: i64 },
    ReorderFailed { ticket: u64, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEffect {
    None,
    PersistOrder(OrderCommit),
    Reload {
        collection: CollectionKind,
        partition: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ListView {
    collection: CollectionKind,
    partition: Option<String>,
    items: Vec<Item>,
    revision: i64,
    phase: DragPhase,
    next_ticket: u64,
    last_outcome: Option<DropOutcome>,
    stale: bool,
}

impl ListView {
    pub fn from_snapshot(snapshot: PartitionSnapshot) -> Self {
        Self {
            collection: snapshot.collection,
            partition: snapshot.partition,
            items: snapshot.items,
            revision: snapshot.revision,
            phase: DragPhase::Idle,
            next_ticket: 1,
            last_outcome: None,
            stale: false,
        }
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    pub fn phase(&self) -> DragPhase {
        self.phase
    }

    pub fn last_outcome(&self) -> Option<DropOutcome> {
        self.last_outcome
    }

    /// True when the view shows an order storage rejected and no reload has landed yet.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn dispatch(&mut self, action: ViewAction) -> AppResult<ViewEffect> {
        match action {
            ViewAction::Loaded(snapshot) => {
                if snapshot.collection != self.collection || snapshot.partition != self.partition {
                    return Err(AppError::Validation(format!(
                        "snapshot for {} does not belong to this list",
                        snapshot.collection.as_str()
                    )));
                }
                self.items = snapshot.items;
                self.revision = snapshot.revision;
                self.stale = false;
                if let DragPhase::Dragging { .. } = self.phase {
                    self.phase = DragPhase::Idle;
                }
                Ok(ViewEffect::None)
            }
            ViewAction::DragStarted { index } => {
                if let DragPhase::Dropped { .. } = self.phase {
                    return Err(AppError::Conflict(
                        "the previous reorder of this list has not finished".to_string(),
                    ));
                }
                self.check_index(index)?;
                self.phase = DragPhase::Dragging { from: index };
                Ok(ViewEffect::None)
            }
            ViewAction::DragCancelled => {
                if let DragPhase::Dragging { .. } = self.phase {
                    self.phase = DragPhase::Idle;
                    self.last_outcome = Some(DropOutcome::Cancelled);
                }
                Ok(ViewEffect::None)
            }
            ViewAction::Dropped { target } => {
                let DragPhase::Dragging { from } = self.phase else {
                    return Err(AppError::Validation("no drag in progress".to_string()));
                };
                if let Err(error) = self.check_index(target) {
                    self.phase = DragPhase::Idle;
                    self.last_outcome = Some(DropOutcome::Cancelled);
                    return Err(error);
                }
                if target == from {
                    self.phase = DragPhase::Idle;
                    self.last_outcome = Some(DropOutcome::Cancelled);
                    return Ok(ViewEffect::None);
                }

                let moved = self.items.remove(from);
                self.items.insert(target, moved);

                let ticket = self.next_ticket;
                self.next_ticket += 1;
                self.phase = DragPhase::Dropped { ticket };
                Ok(ViewEffect::PersistOrder(OrderCommit {
                    ticket,
                    collection: self.collection,
                    partition: self.partition.clone(),
                    ordered_ids: self.ids(),
                    expected_revision: self.revision,
                }))
            }
            ViewAction::ReorderConfirmed { ticket, revision } => {
                if self.phase != (DragPhase::Dropped { ticket }) {
                    return Ok(ViewEffect::None);
                }
                self.revision = revision;
                self.phase = DragPhase::Idle;
                self.last_outcome = Some(DropOutcome::Confirmed);
                Ok(ViewEffect::None)
            }
            ViewAction::ReorderFailed { ticket, message } => {
                if self.phase != (DragPhase::Dropped { ticket }) {
                    return Ok(ViewEffect::None);
                }
                tracing::debug!(ticket, error = %message, "optimistic order discarded");
                self.phase = DragPhase::Idle;
                self.last_outcome = Some(DropOutcome::RolledBack);
                self.stale = true;
                Ok(ViewEffect::Reload {
                    collection: self.collection,
                    partition: self.partition.clone(),
                })
            }
        }
    }

    fn check_index(&self, index: usize) -> AppResult<()> {
        if index >= self.items.len() {
            return Err(AppError::Validation(format!(
                "index {} is outside a list of {} items",
                index,
                self.items.len()
            )));
        }
        Ok(())
    }
}

pub struct OptimisticList<B> {
    backend: B,
    view: ListView,
}

impl<B: OrderBackend> OptimisticList<B> {
    pub async fn open(backend: B, collection: CollectionKind, partition: Option<String>) -> AppResult<Self> {
        let snapshot = backend.load(collection, partition).await?;
        Ok(Self {
            backend,
            view: ListView::from_snapshot(snapshot),
        })
    }

    pub fn view(&self) -> &ListView {
        &self.view
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn refresh(&mut self) -> AppResult<()> {
        let snapshot = self
            .backend
            .load(self.view.collection, self.view.partition.clone())
            .await?;
        self.view.dispatch(ViewAction::Loaded(snapshot))?;
        Ok(())
    }

    /// Runs one drag gesture from `from` to `to` through to confirmation or rollback.
    pub async fn move_item(&mut self, from: usize, to: usize) -> AppResult<DropOutcome> {
        self.view.dispatch(ViewAction::DragStarted { index: from })?;
        let commit = match self.view.dispatch(ViewAction::Dropped { target: to })? {
            ViewEffect::PersistOrder(commit) => commit,
            _ => return Ok(DropOutcome::Cancelled),
        };

        let ticket = commit.ticket;
        match self.backend.persist_order(commit).await {
            Ok(revision) => {
                self.view.dispatch(ViewAction::ReorderConfirmed { ticket, revision })?;
                Ok(DropOutcome::Confirmed)
            }
            Err(error) => {
                tracing::warn!(error = %error, "reorder rejected by storage; reloading list");
                let effect = self.view.dispatch(ViewAction::ReorderFailed {
                    ticket,
                    message: error.to_string(),
                })?;
                if let ViewEffect::Reload { collection, partition } = effect {
                    let snapshot = self.backend.load(collection, partition).await?;
                    self.view.dispatch(ViewAction::Loaded(snapshot))?;
                }
                Ok(DropOutcome::RolledBack)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BackendFuture, DragPhase, DropOutcome, ListView, OptimisticList, OrderBackend, OrderCommit, ViewAction,
        ViewEffect,
    };
    use crate::collections::CollectionKind;
    use crate::errors::{AppError, AppResult};
    use crate::models::{AddItemPayload, Item, PartitionSnapshot};
    use crate::service::CollectionService;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn item(id: &str) -> Item {
        let now = Utc::now();
        Item {
            id: id.to_string(),
            collection: CollectionKind::DayTable,
            partition: Some("Monday".to_string()),
            fields: json!({"activity": id}).as_object().cloned().expect("object"),
            created_at: now,
            updated_at: now,
        }
    }

    fn snapshot(ids: &[&str], revision: i64) -> PartitionSnapshot {
        PartitionSnapshot {
            collection: CollectionKind::DayTable,
            partition: Some("Monday".to_string()),
            items: ids.iter().map(|id| item(id)).collect(),
            revision,
        }
    }

    #[test]
    fn drop_splices_immediately_and_requests_persist() {
        let mut view = ListView::from_snapshot(snapshot(&["a", "b", "c"], 4));
        view.dispatch(ViewAction::DragStarted { index: 2 }).expect("drag");
        let effect = view.dispatch(ViewAction::Dropped { target: 0 }).expect("drop");

        assert_eq!(view.ids(), vec!["c", "a", "b"]);
        let ViewEffect::PersistOrder(commit) = effect else {
            panic!("expected persist effect");
        };
        assert_eq!(commit.ordered_ids, vec!["c", "a", "b"]);
        assert_eq!(commit.expected_revision, 4);
        assert_eq!(view.phase(), DragPhase::Dropped { ticket: commit.ticket });

        view.dispatch(ViewAction::ReorderConfirmed {
            ticket: commit.ticket,
            revision: 5,
        })
        .expect("confirm");
        assert_eq!(view.phase(), DragPhase::Idle);
        assert_eq!(view.revision(), 5);
        assert_eq!(view.last_outcome(), Some(DropOutcome::Confirmed));
    }

    #[test]
    fn dropping_on_the_source_index_is_a_no_op() {
        let mut view = ListView::from_snapshot(snapshot(&["a", "b"], 1));
        view.dispatch(ViewAction::DragStarted { index: 1 }).expect("drag");
        let effect = view.dispatch(ViewAction::Dropped { target: 1 }).expect("drop");
        assert_eq!(effect, ViewEffect::None);
        assert_eq!(view.phase(), DragPhase::Idle);
        assert_eq!(view.last_outcome(), Some(DropOutcome::Cancelled));
        assert_eq!(view.ids(), vec!["a", "b"]);
    }

    #[test]
    fn new_drag_is_refused_while_a_drop_is_pending() {
        let mut view = ListView::from_snapshot(snapshot(&["a", "b"], 1));
        view.dispatch(ViewAction::DragStarted { index: 0 }).expect("drag");
        view.dispatch(ViewAction::Dropped { target: 1 }).expect("drop");

        let error = view
            .dispatch(ViewAction::DragStarted { index: 0 })
            .expect_err("pending");
        assert!(matches!(error, AppError::Conflict(_)));
    }

    #[test]
    fn failure_asks_for_reload_and_stale_tickets_are_ignored() {
        let mut view = ListView::from_snapshot(snapshot(&["x", "y"], 2));
        view.dispatch(ViewAction::DragStarted { index: 0 }).expect("drag");
        let ViewEffect::PersistOrder(commit) = view.dispatch(ViewAction::Dropped { target: 1 }).expect("drop") else {
            panic!("expected persist effect");
        };

        let ignored = view
            .dispatch(ViewAction::ReorderConfirmed {
                ticket: commit.ticket + 10,
                revision: 9,
            })
            .expect("stale confirm");
        assert_eq!(ignored, ViewEffect::None);
        assert_eq!(view.phase(), DragPhase::Dropped { ticket: commit.ticket });

        let effect = view
            .dispatch(ViewAction::ReorderFailed {
                ticket: commit.ticket,
                message: "disk full".to_string(),
            })
            .expect("fail");
        assert!(matches!(effect, ViewEffect::Reload { .. }));
        assert!(view.is_stale());
        assert_eq!(view.last_outcome(), Some(DropOutcome::RolledBack));

        view.dispatch(ViewAction::Loaded(snapshot(&["x", "y"], 2))).expect("reload");
        assert_eq!(view.ids(), vec!["x", "y"]);
        assert!(!view.is_stale());
    }

    #[test]
    fn out_of_range_indexes_are_rejected() {
        let mut view = ListView::from_snapshot(snapshot(&["a"], 1));
        assert!(view.dispatch(ViewAction::DragStarted { index: 1 }).is_err());
        view.dispatch(ViewAction::DragStarted { index: 0 }).expect("drag");
        assert!(view.dispatch(ViewAction::Dropped { target: 3 }).is_err());
        assert_eq!(view.phase(), DragPhase::Idle);
        assert!(view.dispatch(ViewAction::Dropped { target: 0 }).is_err());
    }

    struct FlakyBackend {
        stored: Mutex<PartitionSnapshot>,
        fail_persist: AtomicBool,
        reject_as_invalid: AtomicBool,
        loads: AtomicUsize,
    }

    fn flaky(ids: &[&str], revision: i64) -> FlakyBackend {
        FlakyBackend {
            stored: Mutex::new(snapshot(ids, revision)),
            fail_persist: AtomicBool::new(false),
            reject_as_invalid: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
        }
    }

    impl OrderBackend for FlakyBackend {
        fn load(&self, _collection: CollectionKind, _partition: Option<String>) -> BackendFuture<'_, PartitionSnapshot> {
            Box::pin(async move {
                self.loads.fetch_add(1, Ordering::SeqCst);
                let stored = self
                    .stored
                    .lock()
                    .map_err(|_| AppError::Internal("poisoned".to_string()))?;
                Ok(stored.clone())
            })
        }

        fn persist_order(&self, commit: OrderCommit) -> BackendFuture<'_, i64> {
            Box::pin(async move {
                if self.fail_persist.load(Ordering::SeqCst) {
                    return Err(AppError::Storage("simulated write failure".to_string()));
                }
                if self.reject_as_invalid.load(Ordering::SeqCst) {
                    return Err(AppError::Validation("duplicate id in submitted order".to_string()));
                }
                let mut stored = self
                    .stored
                    .lock()
                    .map_err(|_| AppError::Internal("poisoned".to_string()))?;
                let mut reordered = Vec::new();
                for id in &commit.ordered_ids {
                    if let Some(found) = stored.items.iter().find(|item| &item.id == id) {
                        reordered.push(found.clone());
                    }
                }
                stored.items = reordered;
                stored.revision += 1;
                Ok(stored.revision)
            })
        }
    }

    #[tokio::test]
    async fn driver_rolls_back_by_reloading() -> AppResult<()> {
        let backend = flaky(&["x", "y"], 2);
        backend.fail_persist.store(true, Ordering::SeqCst);
        let mut list = OptimisticList::open(backend, CollectionKind::DayTable, Some("Monday".to_string())).await?;

        let outcome = list.move_item(0, 1).await?;
        assert_eq!(outcome, DropOutcome::RolledBack);
        assert_eq!(list.view().ids(), vec!["x", "y"]);
        assert_eq!(list.backend().loads.load(Ordering::SeqCst), 2);

        list.backend().fail_persist.store(false, Ordering::SeqCst);
        let outcome = list.move_item(0, 1).await?;
        assert_eq!(outcome, DropOutcome::Confirmed);
        assert_eq!(list.view().ids(), vec!["y", "x"]);
        assert_eq!(list.view().revision(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn validation_rejection_also_reloads() -> AppResult<()> {
        let backend = flaky(&["a", "b", "c"], 7);
        backend.reject_as_invalid.store(true, Ordering::SeqCst);
        let mut list = OptimisticList::open(backend, CollectionKind::DayTable, Some("Monday".to_string())).await?;

        let outcome = list.move_item(2, 0).await?;
        assert_eq!(outcome, DropOutcome::RolledBack);
        assert_eq!(list.view().ids(), vec!["a", "b", "c"]);
        assert_eq!(list.view().revision(), 7);
        assert_eq!(list.backend().loads.load(Ordering::SeqCst), 2);
        assert!(!list.view().is_stale());
        Ok(())
    }

    #[tokio::test]
    async fn storage_failure_mid_reorder_restores_the_original_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = CollectionService::open(&dir.path().join("state.sqlite")).expect("service");
        for name in ["x", "y"] {
            service
                .add_item(AddItemPayload {
                    collection: CollectionKind::Exercises,
                    partition: Some("Cardio".to_string()),
                    fields: json!({"name": name}).as_object().cloned().expect("object"),
                })
                .await
                .expect("add");
        }
        service
            .database()
            .execute_batch(
                "CREATE TRIGGER fail_reinsert BEFORE INSERT ON exercises
                 WHEN json_extract(NEW.fields_json, '$.name') = 'x'
                 BEGIN SELECT RAISE(ABORT, 'injected storage failure'); END;",
            )
            .expect("trigger");

        let mut list = OptimisticList::open(service, CollectionKind::Exercises, Some("Cardio".to_string()))
            .await
            .expect("open");
        let before = list.view().ids();

        let outcome = list.move_item(0, 1).await.expect("gesture");
        assert_eq!(outcome, DropOutcome::RolledBack);
        assert_eq!(list.view().ids(), before);
        let names: Vec<_> = list
            .view()
            .items()
            .iter()
            .map(|item| item.fields["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("x"), json!("y")]);
        assert!(!list.view().is_stale());
    }
}
