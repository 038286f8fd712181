use crate::collections::{CollectionKind, CollectionSpec};
use crate::errors::{AppError, AppResult};
use crate::models::{AppSettings, Fields, Item, PartitionSnapshot};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Revision key used for collections without a partition column.
const WHOLE_TABLE_KEY: &str = "";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

/// A row captured verbatim before a reorder rewrites the partition.
struct StoredRow {
    id: String,
    fields_json: String,
    created_at: String,
    updated_at: String,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };

        db.ensure_default_settings()?;
        let settings = db.get_settings()?;
        db.apply_busy_timeout(settings.busy_timeout_ms)?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn close(self) -> AppResult<()> {
        let conn = self
            .conn
            .into_inner()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.close().map_err(|(_, error)| AppError::from(error))
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> AppResult<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'app'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<AppSettings>(&raw).unwrap_or_default()),
            None => Ok(AppSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: AppSettings = serde_json::from_value(merged)
            .map_err(|error| AppError::Validation(format!("invalid settings: {}", error)))?;

        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at)
                 VALUES ('app', ?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
                params![serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
            )?;
        }
        self.apply_busy_timeout(settings.busy_timeout_ms)?;

        Ok(settings)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM settings WHERE key = 'app'", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('app', ?1, ?2)",
                params![serde_json::to_string(&AppSettings::default())?, Utc::now().to_rfc3339()],
            )?;
        }
        Ok(())
    }

    fn apply_busy_timeout(&self, busy_timeout_ms: u64) -> AppResult<()> {
        let conn = self.lock()?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        Ok(())
    }

    pub fn list_items(&self, kind: CollectionKind, partition: Option<&str>) -> AppResult<PartitionSnapshot> {
        let spec = kind.spec();
        let conn = self.lock()?;

        let filter = match (spec.partition_column, partition) {
            (Some(_), Some(key)) => Some(key),
            (Some(_), None) => None,
            (None, Some(_)) => {
                return Err(AppError::Validation(format!(
                    "{} is not partitioned; omit the partition key",
                    kind.as_str()
                )))
            }
            (None, None) => None,
        };

        let sql = select_sql(spec, filter.is_some(), "");
        let mut stmt = conn.prepare(&sql)?;
        let items = match filter {
            Some(key) => stmt
                .query_map([key], |row| parse_item_row(kind, row))?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], |row| parse_item_row(kind, row))?
                .collect::<Result<Vec<_>, _>>()?,
        };
        drop(stmt);

        // A listing that spans every partition of a partitioned table has no single revision.
        let revision = if spec.is_partitioned() && filter.is_none() {
            0
        } else {
            current_revision(&conn, kind, filter.unwrap_or(WHOLE_TABLE_KEY))?
        };

        Ok(PartitionSnapshot {
            collection: kind,
            partition: filter.map(ToString::to_string),
            items,
            revision,
        })
    }

    pub fn insert_item(&self, kind: CollectionKind, partition: Option<&str>, fields: &Fields) -> AppResult<Item> {
        let spec = kind.spec();
        let key = require_partition_shape(spec, partition)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let fields_json = serde_json::to_string(fields)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        match (spec.partition_column, key) {
            (Some(column), Some(key)) => {
                tx.execute(
                    &format!(
                        "INSERT INTO {} (id, {}, fields_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                        spec.table, column
                    ),
                    params![id, key, fields_json, now.to_rfc3339()],
                )?;
            }
            _ => {
                tx.execute(
                    &format!(
                        "INSERT INTO {} (id, fields_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                        spec.table
                    ),
                    params![id, fields_json, now.to_rfc3339()],
                )?;
            }
        }
        bump_revision(&tx, kind, key.unwrap_or(WHOLE_TABLE_KEY))?;
        tx.commit()?;

        Ok(Item {
            id,
            collection: kind,
            partition: key.map(ToString::to_string),
            fields: fields.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update_item(&self, kind: CollectionKind, id: &str, fields: &Fields) -> AppResult<Item> {
        let spec = kind.spec();
        let fields_json = serde_json::to_string(fields)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            &format!("UPDATE {} SET fields_json = ?1, updated_at = ?2 WHERE id = ?3", spec.table),
            params![fields_json, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(not_found(kind, id));
        }
        let item = find_item(&tx, kind, id)?.ok_or_else(|| not_found(kind, id))?;
        tx.commit()?;
        Ok(item)
    }

    pub fn delete_item(&self, kind: CollectionKind, id: &str) -> AppResult<()> {
        let spec = kind.spec();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let existing = find_item(&tx, kind, id)?.ok_or_else(|| not_found(kind, id))?;
        tx.execute(&format!("DELETE FROM {} WHERE id = ?1", spec.table), [id])?;
        bump_revision(
            &tx,
            kind,
            existing.partition.as_deref().unwrap_or(WHOLE_TABLE_KEY),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Rewrites the storage order of one partition to `ordered_ids`.
    ///
    /// Snapshot, delete and reinsert happen inside one immediate transaction; any
    /// failure leaves the partition exactly as it was. Returns the partition's new
    /// order revision.
    pub fn replace_order(
        &self,
        kind: CollectionKind,
        partition: Option<&str>,
        ordered_ids: &[String],
        expected_revision: Option<i64>,
    ) -> AppResult<i64> {
        let spec = kind.spec();
        let key = require_partition_shape(spec, partition)?;
        let revision_key = key.unwrap_or(WHOLE_TABLE_KEY);

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = current_revision(&tx, kind, revision_key)?;
        if let Some(expected) = expected_revision {
            if expected != current {
                return Err(AppError::Conflict(format!(
                    "order of {} changed since it was read (expected revision {}, actual {})",
                    describe_partition(kind, key),
                    expected,
                    current
                )));
            }
        }

        let rows = {
            let sql = match spec.partition_column {
                Some(column) => format!(
                    "SELECT id, fields_json, created_at, updated_at FROM {} WHERE {} = ?1 ORDER BY rowid ASC",
                    spec.table, column
                ),
                None => format!(
                    "SELECT id, fields_json, created_at, updated_at FROM {} ORDER BY rowid ASC",
                    spec.table
                ),
            };
            let mut stmt = tx.prepare(&sql)?;
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<StoredRow> {
                Ok(StoredRow {
                    id: row.get(0)?,
                    fields_json: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            };
            let rows = match key {
                Some(key) => stmt.query_map([key], map_row)?.collect::<Result<Vec<_>, _>>()?,
                None => stmt.query_map([], map_row)?.collect::<Result<Vec<_>, _>>()?,
            };
            rows
        };

        let current_ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
        check_permutation(kind, key, &current_ids, ordered_ids)?;
        if current_ids.iter().copied().eq(ordered_ids.iter().map(String::as_str)) {
            return Ok(current);
        }

        match (spec.partition_column, key) {
            (Some(column), Some(key)) => {
                tx.execute(&format!("DELETE FROM {} WHERE {} = ?1", spec.table, column), [key])?;
            }
            _ => {
                tx.execute(&format!("DELETE FROM {}", spec.table), [])?;
            }
        }

        let by_id: HashMap<&str, &StoredRow> = rows.iter().map(|row| (row.id.as_str(), row)).collect();
        for id in ordered_ids {
            let row = by_id
                .get(id.as_str())
                .ok_or_else(|| AppError::Internal(format!("row {} vanished during reorder", id)))?;
            match (spec.partition_column, key) {
                (Some(column), Some(key)) => {
                    tx.execute(
                        &format!(
                            "INSERT INTO {} (id, {}, fields_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                            spec.table, column
                        ),
                        params![row.id, key, row.fields_json, row.created_at, row.updated_at],
                    )?;
                }
                _ => {
                    tx.execute(
                        &format!(
                            "INSERT INTO {} (id, fields_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
                            spec.table
                        ),
                        params![row.id, row.fields_json, row.created_at, row.updated_at],
                    )?;
                }
            }
        }

        let revision = bump_revision(&tx, kind, revision_key)?;
        tx.commit()?;
        Ok(revision)
    }
}

fn select_sql(spec: &CollectionSpec, filtered: bool, extra_where: &str) -> String {
    let partition_expr = spec.partition_column.unwrap_or("NULL");
    let mut clauses = Vec::new();
    if filtered {
        if let Some(column) = spec.partition_column {
            clauses.push(format!("{} = ?1", column));
        }
    }
    if !extra_where.is_empty() {
        clauses.push(extra_where.to_string());
    }
    let mut sql = format!(
        "SELECT id, {}, fields_json, created_at, updated_at FROM {}",
        partition_expr, spec.table
    );
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY rowid ASC");
    sql
}

fn find_item(conn: &Connection, kind: CollectionKind, id: &str) -> AppResult<Option<Item>> {
    let sql = select_sql(kind.spec(), false, "id = ?1");
    let item = conn
        .query_row(&sql, [id], |row| parse_item_row(kind, row))
        .optional()?;
    Ok(item)
}

fn require_partition_shape<'a>(spec: &CollectionSpec, partition: Option<&'a str>) -> AppResult<Option<&'a str>> {
    match (spec.partition_column, partition) {
        (Some(_), Some(key)) if !key.trim().is_empty() => Ok(Some(key)),
        (Some(column), _) => Err(AppError::Validation(format!(
            "{} requires a non-empty {} partition key",
            spec.kind.as_str(),
            column
        ))),
        (None, Some(_)) => Err(AppError::Validation(format!(
            "{} is not partitioned; omit the partition key",
            spec.kind.as_str()
        ))),
        (None, None) => Ok(None),
    }
}

/// `ordered_ids` must name every current row of the partition exactly once.
fn check_permutation(
    kind: CollectionKind,
    key: Option<&str>,
    current_ids: &[&str],
    ordered_ids: &[String],
) -> AppResult<()> {
    let mut seen = HashSet::with_capacity(ordered_ids.len());
    for id in ordered_ids {
        if !seen.insert(id.as_str()) {
            return Err(AppError::Validation(format!("duplicate id {} in submitted order", id)));
        }
    }

    let current: HashSet<&str> = current_ids.iter().copied().collect();
    if current != seen {
        let missing = current.difference(&seen).count();
        let unknown = seen.difference(&current).count();
        return Err(AppError::Conflict(format!(
            "submitted order for {} is stale ({} ids missing, {} unknown)",
            describe_partition(kind, key),
            missing,
            unknown
        )));
    }
    Ok(())
}

fn current_revision(conn: &Connection, kind: CollectionKind, key: &str) -> AppResult<i64> {
    let revision = conn
        .query_row(
            "SELECT revision FROM partition_revisions WHERE collection = ?1 AND partition_key = ?2",
            params![kind.as_str(), key],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(revision.unwrap_or(0))
}

fn bump_revision(conn: &Connection, kind: CollectionKind, key: &str) -> AppResult<i64> {
    let revision = conn.query_row(
        "INSERT INTO partition_revisions (collection, partition_key, revision) VALUES (?1, ?2, 1)
         ON CONFLICT(collection, partition_key) DO UPDATE SET revision = revision + 1
         RETURNING revision",
        params![kind.as_str(), key],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(revision)
}

fn describe_partition(kind: CollectionKind, key: Option<&str>) -> String {
    match key {
        Some(key) => format!("{}/{}", kind.as_str(), key),
        None => kind.as_str().to_string(),
    }
}

fn not_found(kind: CollectionKind, id: &str) -> AppError {
    AppError::NotFound(format!("{} item {} does not exist", kind.as_str(), id))
}

fn parse_item_row(kind: CollectionKind, row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    let fields_raw: String = row.get(2)?;
    Ok(Item {
        id: row.get(0)?,
        collection: kind,
        partition: row.get(1)?,
        fields: parse_fields(&fields_raw, 2)?,
        created_at: parse_time(&row.get::<_, String>(3)?, 3)?,
        updated_at: parse_time(&row.get::<_, String>(4)?, 4)?,
    })
}

fn parse_fields(raw: &str, column: usize) -> rusqlite::Result<Fields> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(conversion_error(column, "fields_json is not an object".to_string())),
        Err(error) => Err(conversion_error(column, error.to_string())),
    }
}

fn parse_time(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(column, error.to_string()))
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
