use crate::collections::CollectionKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Entity-specific payload. Opaque to ordering.
pub type Fields = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub collection: CollectionKind,
    pub partition: Option<String>,
    pub fields: Fields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionSnapshot {
    pub collection: CollectionKind,
    pub partition: Option<String>,
    pub items: Vec<Item>,
    pub revision: i64,
}

impl PartitionSnapshot {
    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItemsRequest {
    pub collection: CollectionKind,
    #[serde(default)]
    pub partition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddItemPayload {
    pub collection: CollectionKind,
    #[serde(default)]
    pub partition: Option<String>,
    pub fields: Fields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateItemPayload {
    pub collection: CollectionKind,
    pub id: String,
    pub fields: Fields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveItemPayload {
    pub collection: CollectionKind,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceOrderPayload {
    pub collection: CollectionKind,
    #[serde(default)]
    pub partition: Option<String>,
    pub ordered_ids: Vec<String>,
    #[serde(default)]
    pub expected_revision: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderResponse {
    pub revision: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub busy_timeout_ms: u64,
    pub require_order_revision: bool,
    pub trim_field_values: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            require_order_revision: false,
            trim_field_values: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub data_dir: PathBuf,
}

impl HostConfig {
    pub const DATA_DIR_ENV: &'static str = "DAYBOOK_DATA_DIR";

    pub fn from_env() -> Self {
        let data_dir = std::env::var_os(Self::DATA_DIR_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("daybook-data"));
        Self { data_dir }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("daybook.sqlite")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
