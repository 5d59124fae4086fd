//! A thin columnar table wrapper over Arrow record batches.
//!
//! This is the shape results move around in: the executor produces one from
//! DuckDB or the page cache, the overlay store rewrites cells in place, and
//! the formatting layer encodes it onto the wire.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, RecordBatch};
use arrow::compute;
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::util::display::array_value_to_string;

use crate::error::ExecutionError;

#[derive(Debug, Clone)]
pub struct Table {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl Table {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        let batches = batches.into_iter().filter(|b| b.num_rows() > 0).collect();
        Self { schema, batches }
    }

    pub fn empty(schema: SchemaRef) -> Self {
        Self {
            schema,
            batches: Vec::new(),
        }
    }

    pub fn from_batch(batch: RecordBatch) -> Self {
        Self::new(batch.schema(), vec![batch])
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// Collapse into a single record batch.
    pub fn concat(&self) -> Result<RecordBatch, ExecutionError> {
        compute::concat_batches(&self.schema, &self.batches).map_err(|e| {
            ExecutionError::Internal {
                detail: format!("could not concatenate record batches: {e}"),
            }
        })
    }

    /// Exact row slice across batch boundaries. `limit = None` runs to the
    /// end; `limit = Some(0)` yields an empty table without touching data.
    pub fn slice(&self, offset: usize, limit: Option<usize>) -> Table {
        let mut remaining_skip = offset;
        let mut remaining_take = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();

        for batch in &self.batches {
            if remaining_take == 0 {
                break;
            }

            let rows = batch.num_rows();
            if remaining_skip >= rows {
                remaining_skip -= rows;
                continue;
            }

            let start = remaining_skip;
            let take = (rows - start).min(remaining_take);
            remaining_skip = 0;
            remaining_take -= take;

            out.push(batch.slice(start, take));
        }

        Table::new(self.schema.clone(), out)
    }

    /// Keep only rows the predicate accepts. The predicate sees the owning
    /// batch and a row index within it.
    pub fn filter_rows(
        &self,
        predicate: impl Fn(&RecordBatch, usize) -> bool,
    ) -> Result<Table, ExecutionError> {
        let mut out = Vec::new();

        for batch in &self.batches {
            let mask: BooleanArray = (0..batch.num_rows())
                .map(|row| Some(predicate(batch, row)))
                .collect();

            let filtered =
                compute::filter_record_batch(batch, &mask).map_err(|e| {
                    ExecutionError::Internal {
                        detail: format!("could not filter record batch: {e}"),
                    }
                })?;

            out.push(filtered);
        }

        Ok(Table::new(self.schema.clone(), out))
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema
            .fields()
            .iter()
            .position(|field| field.name().eq_ignore_ascii_case(name))
    }

    /// Project onto the named columns, preserving the requested order.
    pub fn select_columns(&self, names: &[String]) -> Result<Table, ExecutionError> {
        let indices: Vec<usize> = names
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| ExecutionError::InvalidParameter {
                    name: "columns".into(),
                    detail: format!("no column named '{name}'"),
                })
            })
            .collect::<Result<_, _>>()?;

        let schema = Arc::new(self.schema.project(&indices).map_err(|e| {
            ExecutionError::Internal {
                detail: e.to_string(),
            }
        })?);

        let batches = self
            .batches
            .iter()
            .map(|batch| batch.project(&indices))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ExecutionError::Internal {
                detail: e.to_string(),
            })?;

        Ok(Table { schema, batches })
    }

    /// Render every row as a JSON object keyed by column name.
    pub fn to_json_rows(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        let mut rows = Vec::with_capacity(self.num_rows());

        for batch in &self.batches {
            for row in 0..batch.num_rows() {
                let mut object = serde_json::Map::new();
                for (index, field) in batch.schema().fields().iter().enumerate() {
                    object.insert(field.name().clone(), cell_json(batch.column(index), row));
                }
                rows.push(object);
            }
        }

        rows
    }
}

/// Canonical display text for one cell; `None` encodes SQL NULL.
pub fn cell_text(array: &ArrayRef, row: usize) -> Option<String> {
    if array.is_null(row) {
        return None;
    }

    array_value_to_string(array.as_ref(), row).ok()
}

/// One cell as a JSON value, preserving numeric and boolean types.
pub fn cell_json(array: &ArrayRef, row: usize) -> serde_json::Value {
    use arrow::array::*;
    use serde_json::{json, Value};

    if array.is_null(row) {
        return Value::Null;
    }

    macro_rules! primitive {
        ($ty:ty) => {
            array
                .as_any()
                .downcast_ref::<$ty>()
                .map(|arr| json!(arr.value(row)))
        };
    }

    let value = match array.data_type() {
        DataType::Boolean => primitive!(BooleanArray),
        DataType::Int8 => primitive!(Int8Array),
        DataType::Int16 => primitive!(Int16Array),
        DataType::Int32 => primitive!(Int32Array),
        DataType::Int64 => primitive!(Int64Array),
        DataType::UInt8 => primitive!(UInt8Array),
        DataType::UInt16 => primitive!(UInt16Array),
        DataType::UInt32 => primitive!(UInt32Array),
        DataType::UInt64 => primitive!(UInt64Array),
        DataType::Float32 => primitive!(Float32Array),
        DataType::Float64 => primitive!(Float64Array),
        DataType::Utf8 => primitive!(StringArray),
        DataType::LargeUtf8 => primitive!(LargeStringArray),
        _ => None,
    };

    value
        .or_else(|| cell_text(array, row).map(Value::String))
        .unwrap_or(Value::Null)
}

/// An empty schema for tables that carry no columns at all.
pub fn empty_schema() -> SchemaRef {
    Arc::new(Schema::empty())
}

#[cfg(test)]
mod test {
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::Field;

    use super::*;

    fn sample() -> Table {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));

        let first = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![0, 1, 2])),
                Arc::new(StringArray::from(vec![Some("a"), Some("b"), None])),
            ],
        )
        .unwrap();

        let second = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![3, 4])),
                Arc::new(StringArray::from(vec![Some("d"), Some("e")])),
            ],
        )
        .unwrap();

        Table::new(schema, vec![first, second])
    }

    #[test]
    fn slicing_crosses_batch_boundaries() {
        let table = sample();

        let slice = table.slice(2, Some(2));
        assert_eq!(slice.num_rows(), 2);

        let rows = slice.to_json_rows();
        assert_eq!(rows[0]["id"], 2);
        assert_eq!(rows[1]["id"], 3);
    }

    #[test]
    fn limit_zero_is_empty() {
        assert_eq!(sample().slice(0, Some(0)).num_rows(), 0);
    }

    #[test]
    fn offset_past_end_is_empty() {
        assert_eq!(sample().slice(99, None).num_rows(), 0);
    }

    #[test]
    fn filtering_by_cell() {
        let table = sample();

        let filtered = table
            .filter_rows(|batch, row| {
                cell_text(batch.column(1), row).as_deref() == Some("b")
            })
            .unwrap();

        assert_eq!(filtered.num_rows(), 1);
        assert_eq!(filtered.to_json_rows()[0]["id"], 1);
    }

    #[test]
    fn null_cells_render_as_null() {
        let rows = sample().to_json_rows();
        assert_eq!(rows[2]["name"], serde_json::Value::Null);
    }

    #[test]
    fn column_projection() {
        let table = sample();
        let projected = table.select_columns(&["name".into()]).unwrap();

        assert_eq!(projected.schema().fields().len(), 1);
        assert!(table.select_columns(&["missing".into()]).is_err());
    }
}
