//! The overlay store: cell-level overrides keyed by
//! `(route_id, row_key, column)`, persisted in the meta database and applied
//! on top of executed relations.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashMap;
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, LargeStringArray,
    RecordBatch, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use exemplar::Model;
use rusqlite::named_params;
use serde::{Deserialize, Serialize};

use super::MetaStore;
use crate::error::ExecutionError;
use crate::prelude::*;
use crate::route::OverridesSettings;
use crate::table::{cell_text, Table};

/// One persisted cell override. At most one record exists per
/// `(route_id, row_key, column)`; repeated writes upsert.
#[derive(Debug, Clone, PartialEq, Eq, Model, Serialize, Deserialize)]
#[table("overrides")]
pub struct OverrideRecord {
    pub route_id: String,
    pub row_key: String,
    #[serde(rename = "column")]
    pub column_name: String,
    /// JSON-encoded replacement value; JSON null blanks the cell.
    pub value: Option<String>,
    pub reason: Option<String>,
    pub author: Option<String>,
    pub author_user_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl OverrideRecord {
    pub fn decoded_value(&self) -> serde_json::Value {
        self.value
            .as_deref()
            .and_then(|text| serde_json::from_str(text).ok())
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Deterministic row key over the configured key columns, in column order.
/// Identical across overlay writes and overlay applies, and stable across
/// processes.
pub fn compute_row_key_from_values(values: &[Option<String>]) -> String {
    let mut text = String::new();

    for value in values {
        match value {
            Some(value) => text.push_str(value),
            None => text.push('\u{0}'),
        }
        text.push('\u{1f}');
    }

    format!("{:016x}", seahash::hash(text.as_bytes()))
}

pub struct OverlayStore {
    meta: Arc<MetaStore>,
}

impl OverlayStore {
    pub fn new(meta: Arc<MetaStore>) -> Self {
        Self { meta }
    }

    /// Insert or replace the record for `(route_id, row_key, column)`,
    /// refreshing `updated_at` but preserving the original `created_at`.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert(
        &self,
        route_id: &str,
        row_key: &str,
        column: &str,
        value: &serde_json::Value,
        reason: Option<&str>,
        author: Option<&str>,
        author_user_id: Option<&str>,
    ) -> Result<OverrideRecord, ExecutionError> {
        let now = chrono::Utc::now().to_rfc3339();
        let encoded = serde_json::to_string(value).map_err(|e| ExecutionError::Internal {
            detail: e.to_string(),
        })?;

        let conn = self.meta.get()?;

        conn.execute(
            "INSERT INTO overrides
                (route_id, row_key, column_name, value, reason, author, author_user_id, created_at, updated_at)
             VALUES
                (:route_id, :row_key, :column_name, :value, :reason, :author, :author_user_id, :now, :now)
             ON CONFLICT (route_id, row_key, column_name) DO UPDATE SET
                value = excluded.value,
                reason = excluded.reason,
                author = excluded.author,
                author_user_id = excluded.author_user_id,
                updated_at = excluded.updated_at",
            named_params! {
                ":route_id": route_id,
                ":row_key": row_key,
                ":column_name": column,
                ":value": encoded,
                ":reason": reason,
                ":author": author,
                ":author_user_id": author_user_id,
                ":now": now,
            },
        )?;

        let record = conn.query_row(
            "SELECT * FROM overrides
             WHERE route_id = ?1 AND row_key = ?2 AND column_name = ?3",
            (route_id, row_key, column),
            OverrideRecord::from_row,
        )?;

        Ok(record)
    }

    /// Delete one override; returns whether a row was removed.
    pub fn remove(
        &self,
        route_id: &str,
        row_key: &str,
        column: &str,
    ) -> Result<bool, ExecutionError> {
        let conn = self.meta.get()?;

        let removed = conn.execute(
            "DELETE FROM overrides
             WHERE route_id = ?1 AND row_key = ?2 AND column_name = ?3",
            (route_id, row_key, column),
        )?;

        Ok(removed > 0)
    }

    /// Every record for a route, in insertion order.
    pub fn list_for_route(&self, route_id: &str) -> Result<Vec<OverrideRecord>, ExecutionError> {
        let conn = self.meta.get()?;

        let mut stmt = conn.prepare(
            "SELECT * FROM overrides WHERE route_id = ?1 ORDER BY rowid",
        )?;

        let records = stmt
            .query_map([route_id], OverrideRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Apply this route's overrides to a result table.
    ///
    /// Each row's key is computed from the configured key columns; where a
    /// matching override exists, the cell value is replaced. Overridden
    /// columns that the result does not carry are added as nullable text
    /// columns. Rows without overrides pass through untouched.
    pub fn apply(
        &self,
        route_id: &str,
        settings: &OverridesSettings,
        table: &Table,
    ) -> Result<Table, ExecutionError> {
        let records = self.list_for_route(route_id)?;

        if records.is_empty() || table.num_rows() == 0 {
            return Ok(table.clone());
        }

        let batch = table.concat()?;
        let schema = batch.schema();

        let mut key_indices = Vec::with_capacity(settings.key_columns.len());
        for column in &settings.key_columns {
            match schema
                .fields()
                .iter()
                .position(|field| field.name().eq_ignore_ascii_case(column))
            {
                Some(index) => key_indices.push(index),
                None => {
                    warn!("Override key column '{column}' is missing - skipping overlay pass.");
                    return Ok(table.clone());
                }
            }
        }

        let row_keys: Vec<String> = (0..batch.num_rows())
            .map(|row| {
                let values: Vec<Option<String>> = key_indices
                    .iter()
                    .map(|index| cell_text(batch.column(*index), row))
                    .collect();
                compute_row_key_from_values(&values)
            })
            .collect();

        let mut lookup: AHashMap<(&str, &str), &OverrideRecord> = AHashMap::new();
        for record in &records {
            lookup.insert((record.row_key.as_str(), record.column_name.as_str()), record);
        }

        let columns: BTreeSet<&str> = records
            .iter()
            .map(|record| record.column_name.as_str())
            .collect();

        let mut fields: Vec<Field> = schema
            .fields()
            .iter()
            .map(|field| field.as_ref().clone())
            .collect();
        let mut arrays: Vec<ArrayRef> = batch.columns().to_vec();

        for column in columns {
            // The replacement (if any) for each row of this column.
            let assignments: Vec<Option<serde_json::Value>> = row_keys
                .iter()
                .map(|key| {
                    lookup
                        .get(&(key.as_str(), column))
                        .map(|record| record.decoded_value())
                })
                .collect();

            if assignments.iter().all(Option::is_none) {
                continue;
            }

            match schema
                .fields()
                .iter()
                .position(|field| field.name().eq_ignore_ascii_case(column))
            {
                Some(index) => {
                    if let Some(rebuilt) = rebuild_column(&arrays[index], &assignments) {
                        arrays[index] = rebuilt;
                        if !fields[index].is_nullable() {
                            fields[index] = fields[index].clone().with_nullable(true);
                        }
                    } else {
                        warn!(
                            "Override column '{column}' has unsupported type {:?} - leaving as-is.",
                            arrays[index].data_type()
                        );
                    }
                }
                None => {
                    let values: StringArray = assignments
                        .iter()
                        .map(|assignment| assignment.as_ref().and_then(json_text))
                        .collect();

                    fields.push(Field::new(column, DataType::Utf8, true));
                    arrays.push(Arc::new(values));
                }
            }
        }

        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(schema, arrays).map_err(|e| {
            ExecutionError::Internal {
                detail: format!("could not assemble overlaid batch: {e}"),
            }
        })?;

        Ok(Table::from_batch(batch))
    }
}

fn json_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Rebuild a column with the assigned cells replaced, preserving the
/// column's type. Returns `None` for unsupported types.
fn rebuild_column(
    array: &ArrayRef,
    assignments: &[Option<serde_json::Value>],
) -> Option<ArrayRef> {
    use serde_json::Value;

    match array.data_type() {
        DataType::Utf8 => {
            let existing = array.as_any().downcast_ref::<StringArray>()?;
            let rebuilt: StringArray = assignments
                .iter()
                .enumerate()
                .map(|(row, assignment)| match assignment {
                    Some(value) => json_text(value),
                    None => existing.is_valid(row).then(|| existing.value(row).to_owned()),
                })
                .collect();
            Some(Arc::new(rebuilt))
        }
        DataType::LargeUtf8 => {
            let existing = array.as_any().downcast_ref::<LargeStringArray>()?;
            let rebuilt: LargeStringArray = assignments
                .iter()
                .enumerate()
                .map(|(row, assignment)| match assignment {
                    Some(value) => json_text(value),
                    None => existing.is_valid(row).then(|| existing.value(row).to_owned()),
                })
                .collect();
            Some(Arc::new(rebuilt))
        }
        DataType::Int64 => {
            let existing = array.as_any().downcast_ref::<Int64Array>()?;
            let rebuilt: Int64Array = assignments
                .iter()
                .enumerate()
                .map(|(row, assignment)| match assignment {
                    Some(Value::Null) => None,
                    Some(value) => value.as_i64(),
                    None => existing.is_valid(row).then(|| existing.value(row)),
                })
                .collect();
            Some(Arc::new(rebuilt))
        }
        DataType::Int32 => {
            let existing = array.as_any().downcast_ref::<Int32Array>()?;
            let rebuilt: Int32Array = assignments
                .iter()
                .enumerate()
                .map(|(row, assignment)| match assignment {
                    Some(Value::Null) => None,
                    Some(value) => value.as_i64().map(|v| v as i32),
                    None => existing.is_valid(row).then(|| existing.value(row)),
                })
                .collect();
            Some(Arc::new(rebuilt))
        }
        DataType::Float64 => {
            let existing = array.as_any().downcast_ref::<Float64Array>()?;
            let rebuilt: Float64Array = assignments
                .iter()
                .enumerate()
                .map(|(row, assignment)| match assignment {
                    Some(Value::Null) => None,
                    Some(value) => value.as_f64(),
                    None => existing.is_valid(row).then(|| existing.value(row)),
                })
                .collect();
            Some(Arc::new(rebuilt))
        }
        DataType::Boolean => {
            let existing = array.as_any().downcast_ref::<BooleanArray>()?;
            let rebuilt: BooleanArray = assignments
                .iter()
                .enumerate()
                .map(|(row, assignment)| match assignment {
                    Some(Value::Null) => None,
                    Some(value) => value.as_bool(),
                    None => existing.is_valid(row).then(|| existing.value(row)),
                })
                .collect();
            Some(Arc::new(rebuilt))
        }
        _ => None,
    }
}
