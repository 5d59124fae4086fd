//! The `manifest.json` sidecar of a cache directory: schema, page row
//! counts, and the per-parameter invariant index. The manifest is the commit
//! point of a materialisation - readers never observe it half-written.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;

use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageEntry {
    pub index: usize,
    pub rows: u64,
}

/// One token's entry in the invariant index: the pages holding at least one
/// row with that value, plus a display sample in original case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenEntry {
    pub pages: Vec<usize>,
    pub sample: String,
}

/// `param name -> token -> pages` for every invariant-filter parameter.
pub type InvariantIndex = BTreeMap<String, BTreeMap<String, TokenEntry>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Arrow schema as base64-encoded IPC stream bytes.
    pub schema: String,
    pub pages: Vec<PageEntry>,
    pub total_rows: u64,
    pub invariant_index: InvariantIndex,
    pub created_at: String,
    pub rows_per_page: usize,
}

impl Manifest {
    pub const FILE_NAME: &'static str = "manifest.json";

    pub fn decode_schema(&self) -> Result<SchemaRef, ExecutionError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.schema)
            .map_err(|e| corrupt(format!("schema is not valid base64: {e}")))?;

        let reader = StreamReader::try_new(Cursor::new(bytes), None)
            .map_err(|e| corrupt(format!("schema is not a valid IPC stream: {e}")))?;

        Ok(reader.schema())
    }

    pub fn encode_schema(schema: &SchemaRef) -> Result<String, ExecutionError> {
        let mut buffer = Vec::new();

        {
            let mut writer = StreamWriter::try_new(&mut buffer, schema)
                .map_err(|e| corrupt(format!("could not encode schema: {e}")))?;
            writer
                .finish()
                .map_err(|e| corrupt(format!("could not encode schema: {e}")))?;
        }

        Ok(base64::engine::general_purpose::STANDARD.encode(buffer))
    }

    pub fn load(dir: &Path) -> Result<Option<Manifest>, ExecutionError> {
        let path = dir.join(Self::FILE_NAME);
        if !path.is_file() {
            return Ok(None);
        }

        let text = std::fs::read_to_string(&path)?;
        let manifest = serde_json::from_str(&text)
            .map_err(|e| corrupt(format!("manifest at {path:?} is malformed: {e}")))?;

        Ok(Some(manifest))
    }

    /// Write atomically: serialise to a sibling temp file, then rename over
    /// the final name.
    pub fn store(&self, dir: &Path) -> Result<(), ExecutionError> {
        let staging = dir.join(".manifest.json.tmp");
        let target = dir.join(Self::FILE_NAME);

        let json = serde_json::to_string_pretty(self).map_err(|e| ExecutionError::Internal {
            detail: e.to_string(),
        })?;

        std::fs::write(&staging, json)?;
        std::fs::rename(&staging, target)?;
        Ok(())
    }
}

fn corrupt(detail: String) -> ExecutionError {
    ExecutionError::CacheCorrupted {
        route_id: String::new(),
        detail,
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use arrow::datatypes::{DataType, Field, Schema};

    use super::*;

    #[test]
    fn schema_roundtrips_through_base64_ipc() {
        let schema: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));

        let encoded = Manifest::encode_schema(&schema).unwrap();
        let manifest = Manifest {
            schema: encoded,
            pages: vec![PageEntry { index: 0, rows: 5 }],
            total_rows: 5,
            invariant_index: InvariantIndex::new(),
            created_at: "2026-01-01T00:00:00Z".into(),
            rows_per_page: 5,
        };

        let decoded = manifest.decode_schema().unwrap();
        assert_eq!(decoded.as_ref(), schema.as_ref());
    }

    #[test]
    fn store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let schema: SchemaRef = Arc::new(Schema::new(vec![Field::new(
            "v",
            DataType::Int64,
            false,
        )]));

        let mut index = InvariantIndex::new();
        index.entry("code".into()).or_default().insert(
            "str:widget".into(),
            TokenEntry {
                pages: vec![0, 2],
                sample: "widget".into(),
            },
        );

        let manifest = Manifest {
            schema: Manifest::encode_schema(&schema).unwrap(),
            pages: vec![
                PageEntry { index: 0, rows: 2 },
                PageEntry { index: 1, rows: 1 },
            ],
            total_rows: 3,
            invariant_index: index,
            created_at: "2026-01-01T00:00:00Z".into(),
            rows_per_page: 2,
        };

        manifest.store(dir.path()).unwrap();
        let loaded = Manifest::load(dir.path()).unwrap().unwrap();

        assert_eq!(loaded.total_rows, 3);
        assert_eq!(loaded.pages.len(), 2);
        assert_eq!(
            loaded.invariant_index["code"]["str:widget"].pages,
            vec![0, 2]
        );

        assert!(Manifest::load(&dir.path().join("missing")).unwrap().is_none());
    }
}
