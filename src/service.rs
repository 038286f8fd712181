use crate::collections::{CollectionKind, CollectionSpec, CATALOG};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AddItemPayload, AppSettings, BooleanResponse, Fields, Item, ListItemsRequest, PartitionSnapshot,
    RemoveItemPayload, ReorderResponse, ReplaceOrderPayload, UpdateItemPayload,
};
use crate::view::{BackendFuture, OrderBackend, OrderCommit};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

type PartitionRef = (CollectionKind, Option<String>);

/// Owns the storage handle and fronts every collection operation.
#[derive(Clone)]
pub struct CollectionService {
    db: Arc<Database>,
    reorders_in_flight: Arc<Mutex<HashSet<PartitionRef>>>,
}

/// Marks a partition as having a reorder outstanding until dropped.
pub(crate) struct ReorderSlot {
    key: PartitionRef,
    registry: Arc<Mutex<HashSet<PartitionRef>>>,
}

impl Drop for ReorderSlot {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.remove(&self.key);
        }
    }
}

impl CollectionService {
    pub fn open(db_path: &Path) -> AppResult<Self> {
        let db = Database::new(db_path)?;
        tracing::info!(path = %db.path().display(), "database opened");
        Ok(Self::new(Arc::new(db)))
    }

    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            reorders_in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    #[cfg(test)]
    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    pub fn shutdown(self) -> AppResult<()> {
        match Arc::try_unwrap(self.db) {
            Ok(db) => {
                let path = db.path().to_path_buf();
                db.close()?;
                tracing::info!(path = %path.display(), "database closed");
            }
            Err(_) => {
                tracing::warn!("database handle still shared at shutdown; it closes when the last clone drops");
            }
        }
        Ok(())
    }

    pub fn list_collections(&self) -> &'static [CollectionSpec] {
        CATALOG
    }

    pub async fn get_settings(&self) -> AppResult<AppSettings> {
        self.blocking(|db| db.get_settings()).await
    }

    pub async fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let settings = self.blocking(move |db| db.update_settings(update)).await?;
        tracing::info!(
            busy_timeout_ms = settings.busy_timeout_ms,
            require_order_revision = settings.require_order_revision,
            trim_field_values = settings.trim_field_values,
            "settings updated"
        );
        Ok(settings)
    }

    pub async fn list_items(&self, request: ListItemsRequest) -> AppResult<PartitionSnapshot> {
        self.blocking(move |db| {
            let settings = db.get_settings()?;
            let partition = normalize_partition(request.partition, &settings);
            db.list_items(request.collection, partition.as_deref())
        })
        .await
    }

    pub async fn add_item(&self, payload: AddItemPayload) -> AppResult<Item> {
        let item = self
            .blocking(move |db| {
                let settings = db.get_settings()?;
                let spec = payload.collection.spec();
                let fields = normalize_fields(spec, payload.fields, &settings)?;
                let partition = normalize_partition(payload.partition, &settings);
                db.insert_item(payload.collection, partition.as_deref(), &fields)
            })
            .await?;
        tracing::info!(
            collection = item.collection.as_str(),
            partition = ?item.partition,
            id = %item.id,
            "item added"
        );
        Ok(item)
    }

    pub async fn update_item(&self, payload: UpdateItemPayload) -> AppResult<Item> {
        let item = self
            .blocking(move |db| {
                let settings = db.get_settings()?;
                let spec = payload.collection.spec();
                let fields = normalize_fields(spec, payload.fields, &settings)?;
                db.update_item(payload.collection, &payload.id, &fields)
            })
            .await?;
        tracing::debug!(collection = item.collection.as_str(), id = %item.id, "item updated");
        Ok(item)
    }

    pub async fn remove_item(&self, payload: RemoveItemPayload) -> AppResult<BooleanResponse> {
        let collection = payload.collection;
        let id = payload.id.clone();
        self.blocking(move |db| db.delete_item(payload.collection, &payload.id))
            .await?;
        tracing::info!(collection = collection.as_str(), id = %id, "item removed");
        Ok(BooleanResponse { success: true })
    }

    pub async fn replace_order(&self, payload: ReplaceOrderPayload) -> AppResult<ReorderResponse> {
        let settings = self.get_settings().await?;
        if settings.require_order_revision && payload.expected_revision.is_none() {
            return Err(AppError::Validation(
                "expectedRevision is required when requireOrderRevision is enabled".to_string(),
            ));
        }

        let collection = payload.collection;
        let partition = normalize_partition(payload.partition, &settings);
        let count = payload.ordered_ids.len();
        let _slot = self.begin_reorder(collection, partition.clone())?;

        let result = self
            .blocking({
                let partition = partition.clone();
                move |db| {
                    db.replace_order(
                        collection,
                        partition.as_deref(),
                        &payload.ordered_ids,
                        payload.expected_revision,
                    )
                }
            })
            .await;

        match result {
            Ok(revision) => {
                tracing::info!(
                    collection = collection.as_str(),
                    partition = ?partition,
                    count,
                    revision,
                    "partition reordered"
                );
                Ok(ReorderResponse { revision })
            }
            Err(error) => {
                tracing::warn!(
                    collection = collection.as_str(),
                    partition = ?partition,
                    error = %error,
                    "reorder not applied"
                );
                Err(error)
            }
        }
    }

    pub(crate) fn begin_reorder(&self, collection: CollectionKind, partition: Option<String>) -> AppResult<ReorderSlot> {
        let key = (collection, partition);
        let mut registry = self
            .reorders_in_flight
            .lock()
            .map_err(|_| AppError::Internal("reorder registry mutex poisoned".to_string()))?;
        if !registry.insert(key.clone()) {
            return Err(AppError::Conflict(format!(
                "a reorder of {} {} is already in progress",
                key.0.as_str(),
                key.1.as_deref().unwrap_or("(all)")
            )));
        }
        Ok(ReorderSlot {
            key,
            registry: self.reorders_in_flight.clone(),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> AppResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

impl OrderBackend for CollectionService {
    fn load(&self, collection: CollectionKind, partition: Option<String>) -> BackendFuture<'_, PartitionSnapshot> {
        Box::pin(self.list_items(ListItemsRequest { collection, partition }))
    }

    fn persist_order(&self, commit: OrderCommit) -> BackendFuture<'_, i64> {
        Box::pin(async move {
            let response = self
                .replace_order(ReplaceOrderPayload {
                    collection: commit.collection,
                    partition: commit.partition,
                    ordered_ids: commit.ordered_ids,
                    expected_revision: Some(commit.expected_revision),
                })
                .await?;
            Ok(response.revision)
        })
    }
}

fn normalize_partition(partition: Option<String>, settings: &AppSettings) -> Option<String> {
    if settings.trim_field_values {
        partition.map(|value| value.trim().to_string())
    } else {
        partition
    }
}

/// Trims string values when configured and rejects blank required fields.
fn normalize_fields(spec: &CollectionSpec, mut fields: Fields, settings: &AppSettings) -> AppResult<Fields> {
    if settings.trim_field_values {
        for value in fields.values_mut() {
            trim_value(value);
        }
    }

    for required in spec.required_fields {
        let present = match fields.get(*required) {
            Some(serde_json::Value::String(text)) => !text.trim().is_empty(),
            Some(serde_json::Value::Array(values)) => values
                .iter()
                .any(|value| value.as_str().is_some_and(|text| !text.trim().is_empty())),
            Some(serde_json::Value::Number(_)) | Some(serde_json::Value::Bool(_)) => true,
            _ => false,
        };
        if !present {
            return Err(AppError::Validation(format!(
                "{} requires a non-blank '{}' field",
                spec.kind.as_str(),
                required
            )));
        }
    }
    Ok(fields)
}

fn trim_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.len() != text.len() {
                *text = trimmed.to_string();
            }
        }
        serde_json::Value::Array(values) => values.iter_mut().for_each(trim_value),
        _ => {}
    }
}
