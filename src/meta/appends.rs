//! Append-mode CSV output under `<storage>/runtime/appends/`.
//!
//! Routes with an `append` block collect incoming values for the declared
//! columns into a per-route CSV file, creating the header on first write.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::error::ExecutionError;
use crate::route::RouteDefinition;

pub struct AppendStore {
    root: PathBuf,
}

impl AppendStore {
    pub fn new(storage_root: &Path) -> Self {
        Self {
            root: storage_root.join(crate::common::APPENDS_DIR),
        }
    }

    /// Append one record to the route's CSV file. Values for undeclared
    /// columns are ignored; missing values are written as empty cells.
    pub fn append(
        &self,
        route: &RouteDefinition,
        values: &BTreeMap<String, String>,
    ) -> Result<PathBuf, ExecutionError> {
        let settings = route.append.as_ref().ok_or_else(|| {
            ExecutionError::AppendMisconfigured {
                detail: format!("route '{}' does not declare an append block", route.id),
            }
        })?;

        if settings.columns.is_empty() {
            return Err(ExecutionError::AppendMisconfigured {
                detail: "append metadata must declare columns".into(),
            });
        }

        let destination = settings.destination_for(&route.id);
        if destination.contains('/') || destination.contains('\\') || destination.contains("..") {
            return Err(ExecutionError::AppendMisconfigured {
                detail: format!("append destination '{destination}' must be a bare file name"),
            });
        }

        std::fs::create_dir_all(&self.root)?;

        let path = self.root.join(&destination);
        let fresh = !path.exists();

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        let fail = |e: csv::Error| ExecutionError::Internal {
            detail: format!("could not append to {destination}: {e}"),
        };

        if fresh {
            writer.write_record(&settings.columns).map_err(fail)?;
        }

        let record: Vec<&str> = settings
            .columns
            .iter()
            .map(|column| values.get(column).map(String::as_str).unwrap_or(""))
            .collect();

        writer.write_record(&record).map_err(fail)?;
        writer.flush()?;

        Ok(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::route::*;

    fn route(append: Option<AppendSettings>) -> RouteDefinition {
        RouteDefinition {
            id: "feedback".into(),
            path: "/feedback".into(),
            methods: vec![Method::Post],
            raw_sql: "SELECT 1".into(),
            prepared_sql: "SELECT 1".into(),
            param_order: Vec::new(),
            params: Vec::new(),
            constants: Default::default(),
            preprocess: Vec::new(),
            uses: Vec::new(),
            cache: None,
            cache_mode: CacheMode::Passthrough,
            overrides: None,
            append,
            metadata: TomlMap::default(),
        }
    }

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn header_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppendStore::new(dir.path());
        let route = route(Some(AppendSettings {
            columns: vec!["name".into(), "note".into()],
            destination: None,
        }));

        store
            .append(&route, &values(&[("name", "a"), ("note", "first")]))
            .unwrap();
        let path = store
            .append(&route, &values(&[("name", "b"), ("extra", "dropped")]))
            .unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines, vec!["name,note", "a,first", "b,"]);
    }

    #[test]
    fn missing_columns_are_misconfiguration() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppendStore::new(dir.path());

        let route = route(Some(AppendSettings {
            columns: Vec::new(),
            destination: None,
        }));

        let err = store.append(&route, &values(&[])).unwrap_err();
        assert_eq!(err.code(), "append_misconfigured");

        let err = store.append(&self::route(None), &values(&[])).unwrap_err();
        assert_eq!(err.code(), "append_misconfigured");
    }

    #[test]
    fn destinations_cannot_escape_the_append_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppendStore::new(dir.path());

        let route = route(Some(AppendSettings {
            columns: vec!["name".into()],
            destination: Some("../escape.csv".into()),
        }));

        let err = store.append(&route, &values(&[])).unwrap_err();
        assert_eq!(err.code(), "append_misconfigured");
    }
}
