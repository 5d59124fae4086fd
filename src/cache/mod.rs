//! The page cache: a page-oriented, on-disk columnar store keyed by
//! `(route_id, fingerprint)` with an invariant-filter index that allows
//! partial reuse of cached pages when only invariant parameters change.
//!
//! Pages are independent Parquet files under
//! `<storage>/cache/<route_id>/<fingerprint>/page-NNNNN.parquet`, described
//! by a `manifest.json` sidecar that is only committed once every page has
//! been written.

mod manifest;
mod token;

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
pub use manifest::{InvariantIndex, Manifest, PageEntry, TokenEntry};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
pub use token::{cell_token, param_tokens, NULL_TOKEN};

use crate::error::ExecutionError;
use crate::prelude::*;
use crate::route::{InvariantFilterSetting, ParamMap, ParamValue, RouteDefinition};
use crate::table::Table;

/// One constraining invariant parameter in a cache read: the filter
/// declaration plus the token set derived from the supplied value.
#[derive(Debug, Clone)]
pub struct InvariantQuery {
    pub setting: InvariantFilterSetting,
    pub tokens: Vec<String>,
}

/// Outcome of a cache lookup.
pub enum CacheRead {
    Hit(CacheSlice),
    /// No manifest for this `(route_id, fingerprint)` yet.
    Miss,
    /// A supplied invariant value is not present in the index; the caller
    /// must fall back to direct execution without touching the index.
    UnknownToken,
}

/// A slice read back from the cache, already filtered and windowed.
pub struct CacheSlice {
    pub table: Table,
    /// Row count of the full (filtered) result, before offset/limit.
    pub total_rows: u64,
}

#[derive(Debug, Clone)]
pub struct CacheStat {
    pub route_id: String,
    pub fingerprints: usize,
    pub pages: usize,
    pub bytes: u64,
}

/// The shared on-disk page cache. Safe to call from multiple worker threads;
/// materialisation for one key is gated by an at-most-one-writer lock.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    write_locks: Mutex<AHashMap<String, Arc<Mutex<()>>>>,
}

impl CacheStore {
    pub fn new(storage_root: &Path) -> Self {
        Self {
            root: storage_root.join(crate::common::STORAGE_CACHE_DIR),
            write_locks: Mutex::new(AHashMap::new()),
        }
    }

    /// Stable cache key over the normalised non-invariant parameter subset.
    ///
    /// Every declared parameter participates (they can reach the result
    /// through bindings or dependency arguments alike), except invariant
    /// parameters, which are excluded so different values share one cache
    /// directory. Key order does not matter; undeclared extras never key.
    pub fn fingerprint(route: &RouteDefinition, processed: &ParamMap) -> String {
        let invariants: BTreeSet<&str> = route
            .cache
            .iter()
            .flat_map(|cache| cache.invariant_filters.iter())
            .map(|filter| filter.param.as_str())
            .collect();

        let mut names: Vec<&str> = route
            .params
            .iter()
            .map(|spec| spec.name.as_str())
            .filter(|name| !invariants.contains(name))
            .collect();
        names.sort_unstable();

        let mut canonical = format!("route={};", route.id);

        for name in names {
            canonical.push_str(name);
            canonical.push('=');
            match processed.get(name) {
                Some(value) => canonical.push_str(&canonical_value(value)),
                None => canonical.push_str(NULL_TOKEN),
            }
            canonical.push(';');
        }

        format!("{:016x}", seahash::hash(canonical.as_bytes()))
    }

    fn dir(&self, route_id: &str, fingerprint: &str) -> PathBuf {
        self.root.join(route_id).join(fingerprint)
    }

    fn page_path(dir: &Path, index: usize) -> PathBuf {
        dir.join(format!("page-{index:05}.parquet"))
    }

    /// The at-most-one-writer lock for a cache key. The first request that
    /// observes a miss materialises while holders of the same key block.
    pub fn write_lock(&self, route_id: &str, fingerprint: &str) -> Arc<Mutex<()>> {
        let key = format!("{route_id}/{fingerprint}");
        let mut locks = self
            .write_locks
            .lock()
            .expect("Cache lock table should not be poisoned.");

        locks.entry(key).or_default().clone()
    }

    pub fn manifest(
        &self,
        route_id: &str,
        fingerprint: &str,
    ) -> Result<Option<Manifest>, ExecutionError> {
        Manifest::load(&self.dir(route_id, fingerprint)).map_err(|err| tag_route(err, route_id))
    }

    /// Read a slice out of the cache.
    ///
    /// With no constraining invariant queries, pages are read in order and
    /// sliced at row offsets. Otherwise the page set is the intersection
    /// across parameters of the union of each token's pages, and rows inside
    /// those pages are filtered to the supplied values.
    pub fn fetch_slice(
        &self,
        route: &RouteDefinition,
        fingerprint: &str,
        queries: &[InvariantQuery],
        offset: usize,
        limit: Option<usize>,
    ) -> Result<CacheRead, ExecutionError> {
        let dir = self.dir(&route.id, fingerprint);

        let Some(manifest) = Manifest::load(&dir).map_err(|err| tag_route(err, &route.id))?
        else {
            return Ok(CacheRead::Miss);
        };

        let schema = manifest
            .decode_schema()
            .map_err(|err| tag_route(err, &route.id))?;

        if queries.is_empty() {
            return self
                .read_plain(&dir, &manifest, schema, offset, limit)
                .map(CacheRead::Hit)
                .map_err(|err| tag_route(err, &route.id));
        }

        // Page-set computation; any unknown token forces the slow path.
        let mut page_set: Option<BTreeSet<usize>> = None;

        for query in queries {
            let Some(entries) = manifest.invariant_index.get(&query.setting.param) else {
                return Ok(CacheRead::UnknownToken);
            };

            let mut union = BTreeSet::new();
            for token in &query.tokens {
                let Some(entry) = entries.get(token) else {
                    return Ok(CacheRead::UnknownToken);
                };
                union.extend(entry.pages.iter().copied());
            }

            page_set = Some(match page_set {
                None => union,
                Some(acc) => acc.intersection(&union).copied().collect(),
            });
        }

        let pages = page_set.unwrap_or_default();

        if pages.is_empty() || limit == Some(0) {
            return Ok(CacheRead::Hit(CacheSlice {
                table: Table::empty(schema),
                total_rows: 0,
            }));
        }

        self.read_filtered(&dir, &manifest, schema, &pages, queries, offset, limit)
            .map(CacheRead::Hit)
            .map_err(|err| tag_route(err, &route.id))
    }

    fn read_plain(
        &self,
        dir: &Path,
        manifest: &Manifest,
        schema: SchemaRef,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<CacheSlice, ExecutionError> {
        let total_rows = manifest.total_rows;

        if limit == Some(0) || offset as u64 >= total_rows {
            return Ok(CacheSlice {
                table: Table::empty(schema),
                total_rows,
            });
        }

        let mut skipped = 0_u64;
        let mut needed = Vec::new();
        let mut local_offset = 0_usize;
        let mut remaining = limit.unwrap_or(usize::MAX) as u64;

        for page in &manifest.pages {
            if remaining == 0 {
                break;
            }

            if skipped + page.rows <= offset as u64 {
                skipped += page.rows;
                continue;
            }

            if needed.is_empty() {
                local_offset = (offset as u64 - skipped) as usize;
            }

            let batches = read_page(dir, page, &schema)?;
            let available = page.rows - if needed.is_empty() { local_offset as u64 } else { 0 };
            remaining = remaining.saturating_sub(available);
            needed.extend(batches);
        }

        let table = Table::new(schema, needed).slice(local_offset, limit);
        Ok(CacheSlice { table, total_rows })
    }

    #[allow(clippy::too_many_arguments)]
    fn read_filtered(
        &self,
        dir: &Path,
        manifest: &Manifest,
        schema: SchemaRef,
        pages: &BTreeSet<usize>,
        queries: &[InvariantQuery],
        offset: usize,
        limit: Option<usize>,
    ) -> Result<CacheSlice, ExecutionError> {
        // Column index and token set per query, resolved once.
        let mut filters = Vec::with_capacity(queries.len());

        for query in queries {
            let column = schema
                .fields()
                .iter()
                .position(|field| field.name().eq_ignore_ascii_case(&query.setting.column))
                .ok_or_else(|| ExecutionError::CacheCorrupted {
                    route_id: String::new(),
                    detail: format!(
                        "invariant column '{}' is missing from the cached schema",
                        query.setting.column
                    ),
                })?;

            let tokens: HashSet<&str> = query.tokens.iter().map(String::as_str).collect();
            filters.push((column, tokens, query.setting.case_insensitive));
        }

        let mut batches = Vec::new();

        for page in &manifest.pages {
            if !pages.contains(&page.index) {
                continue;
            }
            batches.extend(read_page(dir, page, &schema)?);
        }

        let filtered = Table::new(schema, batches).filter_rows(|batch, row| {
            filters.iter().all(|(column, tokens, case_insensitive)| {
                let (token, _) = cell_token(batch.column(*column), row, *case_insensitive);
                tokens.contains(token.as_str())
            })
        })?;

        let total_rows = filtered.num_rows() as u64;
        let table = filtered.slice(offset, limit);

        Ok(CacheSlice { table, total_rows })
    }

    /// Stream query output into pages, then commit the manifest.
    ///
    /// While each page is written, every distinct value observed in each
    /// invariant column is recorded; the index is only visible to readers
    /// once the manifest lands. On failure the partial directory is removed.
    pub fn materialize_from_reader(
        &self,
        route: &RouteDefinition,
        fingerprint: &str,
        schema: SchemaRef,
        batches: impl Iterator<Item = RecordBatch>,
        rows_per_page: usize,
    ) -> Result<Manifest, ExecutionError> {
        let rows_per_page = rows_per_page.max(1);
        let dir = self.dir(&route.id, fingerprint);

        // A leftover directory here is a previous failed or quarantined
        // materialisation; start from scratch.
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;

        let result = self.write_pages(route, &dir, schema, batches, rows_per_page);

        match result {
            Ok(manifest) => {
                manifest
                    .store(&dir)
                    .map_err(|err| tag_route(err, &route.id))?;
                Ok(manifest)
            }
            Err(err) => {
                let _ = std::fs::remove_dir_all(&dir);
                Err(err)
            }
        }
    }

    fn write_pages(
        &self,
        route: &RouteDefinition,
        dir: &Path,
        schema: SchemaRef,
        batches: impl Iterator<Item = RecordBatch>,
        rows_per_page: usize,
    ) -> Result<Manifest, ExecutionError> {
        let settings: Vec<&InvariantFilterSetting> = route
            .cache
            .iter()
            .flat_map(|cache| cache.invariant_filters.iter())
            .collect();

        // The invariant columns must exist in the result schema.
        let mut columns = Vec::with_capacity(settings.len());
        for setting in &settings {
            let index = schema
                .fields()
                .iter()
                .position(|field| field.name().eq_ignore_ascii_case(&setting.column))
                .ok_or_else(|| ExecutionError::RouteExecution {
                    message: format!(
                        "invariant filter column '{}' is not produced by route '{}'",
                        setting.column, route.id
                    ),
                })?;
            columns.push(index);
        }

        let mut index = InvariantIndex::new();
        let mut pages = Vec::new();
        let mut total_rows = 0_u64;

        let mut buffer: Vec<RecordBatch> = Vec::new();
        let mut buffered = 0_usize;

        let mut flush = |buffer: &mut Vec<RecordBatch>,
                         buffered: &mut usize,
                         pages: &mut Vec<PageEntry>,
                         index: &mut InvariantIndex|
         -> Result<(), ExecutionError> {
            if *buffered == 0 {
                return Ok(());
            }

            let page_index = pages.len();
            let path = Self::page_path(dir, page_index);

            let file = File::create(&path)?;
            let mut writer = ArrowWriter::try_new(file, schema.clone(), None)
                .map_err(|e| internal(format!("could not open page writer: {e}")))?;

            for batch in buffer.iter() {
                writer
                    .write(batch)
                    .map_err(|e| internal(format!("could not write page: {e}")))?;
            }

            writer
                .close()
                .map_err(|e| internal(format!("could not close page: {e}")))?;

            for (setting, column) in settings.iter().zip(&columns) {
                let entries = index.entry(setting.param.clone()).or_default();

                for batch in buffer.iter() {
                    let array = batch.column(*column);
                    for row in 0..batch.num_rows() {
                        let (token, sample) =
                            cell_token(array, row, setting.case_insensitive);
                        let entry = entries.entry(token).or_default();

                        if entry.pages.last() != Some(&page_index) {
                            entry.pages.push(page_index);
                        }
                        if entry.sample.is_empty() && !sample.is_empty() {
                            entry.sample = sample;
                        }
                    }
                }
            }

            pages.push(PageEntry {
                index: page_index,
                rows: *buffered as u64,
            });

            buffer.clear();
            *buffered = 0;
            Ok(())
        };

        for batch in batches {
            let mut batch = batch;

            loop {
                let space = rows_per_page - buffered;

                if batch.num_rows() <= space {
                    buffered += batch.num_rows();
                    total_rows += batch.num_rows() as u64;
                    if batch.num_rows() > 0 {
                        buffer.push(batch);
                    }
                    break;
                }

                let head = batch.slice(0, space);
                let tail = batch.slice(space, batch.num_rows() - space);

                buffered += head.num_rows();
                total_rows += head.num_rows() as u64;
                buffer.push(head);
                flush(&mut buffer, &mut buffered, &mut pages, &mut index)?;

                batch = tail;
            }

            if buffered == rows_per_page {
                flush(&mut buffer, &mut buffered, &mut pages, &mut index)?;
            }
        }

        flush(&mut buffer, &mut buffered, &mut pages, &mut index)?;

        Ok(Manifest {
            schema: Manifest::encode_schema(&schema)?,
            pages,
            total_rows,
            invariant_index: index,
            created_at: chrono::Utc::now().to_rfc3339(),
            rows_per_page,
        })
    }

    /// Absolute paths of every page of a cache key, in page order.
    pub fn page_paths(
        &self,
        route_id: &str,
        fingerprint: &str,
        manifest: &Manifest,
    ) -> Vec<PathBuf> {
        let dir = self.dir(route_id, fingerprint);
        manifest
            .pages
            .iter()
            .map(|page| Self::page_path(&dir, page.index))
            .collect()
    }

    /// Remove the cache directory for a corrupted key so the next request
    /// re-materialises from scratch.
    pub fn quarantine(&self, route_id: &str, fingerprint: &str) -> Result<(), ExecutionError> {
        let dir = self.dir(route_id, fingerprint);

        if dir.exists() {
            warn!("Quarantining corrupted cache directory {dir:?}.");
            std::fs::remove_dir_all(&dir)?;
        }

        Ok(())
    }

    pub fn clear(&self) -> Result<(), ExecutionError> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn stat(&self) -> Result<Vec<CacheStat>, ExecutionError> {
        let mut stats = Vec::new();

        if !self.root.exists() {
            return Ok(stats);
        }

        for route_entry in std::fs::read_dir(&self.root)? {
            let route_entry = route_entry?;
            if !route_entry.file_type()?.is_dir() {
                continue;
            }

            let mut stat = CacheStat {
                route_id: route_entry.file_name().to_string_lossy().into_owned(),
                fingerprints: 0,
                pages: 0,
                bytes: 0,
            };

            for fp_entry in std::fs::read_dir(route_entry.path())? {
                let fp_entry = fp_entry?;
                if !fp_entry.file_type()?.is_dir() {
                    continue;
                }

                stat.fingerprints += 1;

                for file in std::fs::read_dir(fp_entry.path())? {
                    let file = file?;
                    let meta = file.metadata()?;
                    stat.bytes += meta.len();
                    if file.file_name().to_string_lossy().ends_with(".parquet") {
                        stat.pages += 1;
                    }
                }
            }

            stats.push(stat);
        }

        stats.sort_by(|a, b| a.route_id.cmp(&b.route_id));
        Ok(stats)
    }
}

fn read_page(
    dir: &Path,
    page: &PageEntry,
    schema: &SchemaRef,
) -> Result<Vec<RecordBatch>, ExecutionError> {
    let path = CacheStore::page_path(dir, page.index);

    let corrupt = |detail: String| ExecutionError::CacheCorrupted {
        route_id: String::new(),
        detail,
    };

    let file =
        File::open(&path).map_err(|e| corrupt(format!("cannot open page {path:?}: {e}")))?;

    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| corrupt(format!("cannot read page {path:?}: {e}")))?
        .build()
        .map_err(|e| corrupt(format!("cannot read page {path:?}: {e}")))?;

    let batches: Vec<RecordBatch> = reader
        .collect::<Result<_, _>>()
        .map_err(|e| corrupt(format!("cannot decode page {path:?}: {e}")))?;

    let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
    if rows as u64 != page.rows {
        return Err(corrupt(format!(
            "page {} holds {rows} rows but the manifest records {}",
            page.index, page.rows
        )));
    }

    // Schema drift between manifest and page is corruption too.
    if let Some(batch) = batches.first() {
        if batch.schema().fields() != schema.fields() {
            return Err(corrupt(format!(
                "page {} schema does not match the manifest",
                page.index
            )));
        }
    }

    Ok(batches)
}

fn canonical_value(value: &ParamValue) -> String {
    match value {
        ParamValue::Null => NULL_TOKEN.to_owned(),
        other => {
            let setting = InvariantFilterSetting {
                param: String::new(),
                column: String::new(),
                separator: None,
                case_insensitive: false,
            };
            param_tokens(other, &setting).join(",")
        }
    }
}

fn tag_route(err: ExecutionError, route_id: &str) -> ExecutionError {
    match err {
        ExecutionError::CacheCorrupted { detail, .. } => ExecutionError::CacheCorrupted {
            route_id: route_id.to_owned(),
            detail,
        },
        other => other,
    }
}

fn internal(detail: String) -> ExecutionError {
    ExecutionError::Internal { detail }
}
