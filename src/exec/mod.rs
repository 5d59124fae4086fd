//! The route executor.
//!
//! Execution of a route walks a fixed state machine per request:
//! coerce -> preprocess -> resolve uses -> cache lookup, then either a read
//! from the finished artefact or a fresh DuckDB execution that streams into
//! the cache, and finally the overlay pass. Failures never leave partial
//! cache state behind, and no state poisons later requests.

mod preprocess;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use arrow::array::RecordBatch;
use duckdb::Connection;
pub use preprocess::{PreprocessContext, PreprocessFn, PreprocessRegistry};

use crate::cache::{param_tokens, CacheRead, CacheStore, InvariantQuery};
use crate::common::RequestMeta;
use crate::error::ExecutionError;
use crate::meta::OverlayStore;
use crate::prelude::*;
use crate::route::*;
use crate::table::Table;

/// Row windowing for one execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ExecOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn window(offset: usize, limit: Option<usize>) -> Self {
        Self { offset, limit }
    }
}

/// The outcome of one route execution.
pub struct ExecutionResult {
    pub table: Table,
    /// Row count of the full result before offset/limit windowing.
    pub total_rows: u64,
    /// Whether the page cache was involved at all.
    pub used_cache: bool,
    /// Whether the request was served without materialising.
    pub cache_hit: bool,
}

/// Executes compiled routes against DuckDB, honouring declarative
/// dependencies, the page cache, and cell overlays.
///
/// All state flows through the stores handed in here; the executor itself
/// is shareable across worker threads.
pub struct RouteExecutor {
    routes: AHashMap<String, Arc<RouteDefinition>>,
    cache: Arc<CacheStore>,
    overlays: Option<Arc<OverlayStore>>,
    registry: Arc<PreprocessRegistry>,
    default_rows_per_page: usize,
    connects: AtomicUsize,
}

impl RouteExecutor {
    pub fn new(
        routes: impl IntoIterator<Item = RouteDefinition>,
        cache: Arc<CacheStore>,
        overlays: Option<Arc<OverlayStore>>,
        registry: Arc<PreprocessRegistry>,
        default_rows_per_page: usize,
    ) -> Self {
        let routes = routes
            .into_iter()
            .map(|route| (route.id.clone(), Arc::new(route)))
            .collect();

        Self {
            routes,
            cache,
            overlays,
            registry,
            default_rows_per_page,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn route(&self, id: &str) -> Result<Arc<RouteDefinition>, ExecutionError> {
        self.routes
            .get(id)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownRoute { id: id.to_owned() })
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<RouteDefinition>> {
        self.routes.values()
    }

    /// How many engine connections have been opened so far. Test probes use
    /// this to assert cache reuse.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Execute a route by id for the given parameter map.
    pub fn execute(
        &self,
        route_id: &str,
        incoming: &ParamMap,
        opts: ExecOptions,
        request: Option<&RequestMeta>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let route = self.route(route_id)?;
        let mut stack = Vec::new();
        self.execute_inner(&route, incoming, opts, request, &mut stack)
    }

    fn execute_inner(
        &self,
        route: &Arc<RouteDefinition>,
        incoming: &ParamMap,
        opts: ExecOptions,
        request: Option<&RequestMeta>,
        stack: &mut Vec<String>,
    ) -> Result<ExecutionResult, ExecutionError> {
        if stack.iter().any(|id| id == &route.id) {
            let mut chain = stack.join(" -> ");
            chain.push_str(" -> ");
            chain.push_str(&route.id);
            return Err(ExecutionError::CircularDependency { chain });
        }

        stack.push(route.id.clone());
        let result = self.run(route, incoming, opts, request, stack);
        stack.pop();
        result
    }

    fn run(
        &self,
        route: &Arc<RouteDefinition>,
        incoming: &ParamMap,
        opts: ExecOptions,
        request: Option<&RequestMeta>,
        stack: &mut Vec<String>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let coerced = coerce_params(route, incoming)?;
        let processed = self.registry.run_chain(route, coerced, request)?;
        let bindings = build_bindings(route, &processed)?;

        let mut result = if route.caches_pages() {
            self.run_cached(route, &processed, &bindings, opts, request, stack)?
        } else {
            let table = self.execute_sql(route, &processed, &bindings, request, stack)?;
            let total_rows = table.num_rows() as u64;

            ExecutionResult {
                table: table.slice(opts.offset, opts.limit),
                total_rows,
                used_cache: false,
                cache_hit: false,
            }
        };

        if let (Some(settings), Some(overlays)) = (&route.overrides, &self.overlays) {
            result.table = overlays.apply(&route.id, settings, &result.table)?;
        }

        Ok(result)
    }

    fn run_cached(
        &self,
        route: &Arc<RouteDefinition>,
        processed: &ParamMap,
        bindings: &ParamMap,
        opts: ExecOptions,
        request: Option<&RequestMeta>,
        stack: &mut Vec<String>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let settings = route.cache.as_ref().expect("cached route must have settings");
        let rows_per_page = settings.rows_per_page.unwrap_or(self.default_rows_per_page);

        let fingerprint = CacheStore::fingerprint(route, processed);
        let queries = invariant_queries(settings, processed);

        let mut materialized = false;
        let mut quarantined = false;

        loop {
            match self.cache.fetch_slice(route, &fingerprint, &queries, opts.offset, opts.limit)
            {
                Ok(CacheRead::Hit(slice)) => {
                    return Ok(ExecutionResult {
                        table: slice.table,
                        total_rows: slice.total_rows,
                        used_cache: true,
                        cache_hit: !materialized,
                    })
                }
                Ok(CacheRead::UnknownToken) => {
                    // Slow path: a supplied invariant value the index has
                    // never seen. Execute directly, leave the index alone.
                    // The in-memory filter also covers invariant parameters
                    // the SQL itself never binds.
                    let table = self.execute_sql(route, processed, bindings, request, stack)?;
                    let table = filter_by_invariants(&table, &queries)?;
                    let total_rows = table.num_rows() as u64;

                    return Ok(ExecutionResult {
                        table: table.slice(opts.offset, opts.limit),
                        total_rows,
                        used_cache: false,
                        cache_hit: false,
                    });
                }
                Ok(CacheRead::Miss) => {
                    let lock = self.cache.write_lock(&route.id, &fingerprint);
                    let _guard = lock
                        .lock()
                        .expect("Cache writer lock should not be poisoned.");

                    // A concurrent writer may have finished while we waited.
                    if self.cache.manifest(&route.id, &fingerprint)?.is_none() {
                        self.materialize(
                            route,
                            &fingerprint,
                            processed,
                            bindings,
                            rows_per_page,
                            request,
                            stack,
                        )?;
                    }

                    materialized = true;
                }
                Err(err @ ExecutionError::CacheCorrupted { .. }) => {
                    // Self-healing: quarantine the fingerprint and retry the
                    // request once as a cache miss.
                    if quarantined {
                        return Err(err);
                    }

                    warn!("{err} - retrying once as a cache miss.");
                    self.cache.quarantine(&route.id, &fingerprint)?;
                    quarantined = true;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Stream the route's full relation into the cache. Invariant-filter
    /// parameters are bound as NULL so the artefact (and its index) covers
    /// every value; the requested values are honoured when the read path
    /// re-enters.
    #[allow(clippy::too_many_arguments)]
    fn materialize(
        &self,
        route: &Arc<RouteDefinition>,
        fingerprint: &str,
        processed: &ParamMap,
        bindings: &ParamMap,
        rows_per_page: usize,
        request: Option<&RequestMeta>,
        stack: &mut Vec<String>,
    ) -> Result<(), ExecutionError> {
        let mut neutral = bindings.clone();

        if let Some(settings) = &route.cache {
            for filter in &settings.invariant_filters {
                if neutral.contains_key(&filter.param) {
                    neutral.insert(filter.param.clone(), ParamValue::Null);
                }
            }
        }

        let conn = self.connect(route, processed, request, stack)?;
        let mut stmt = conn.prepare(&route.prepared_sql)?;

        let values = engine_bindings(route, &neutral);
        let reader = stmt.query_arrow(duckdb::params_from_iter(values))?;
        let schema = reader.get_schema();

        self.cache
            .materialize_from_reader(route, fingerprint, schema, reader, rows_per_page)?;

        Ok(())
    }

    /// Open a fresh engine connection, register dependency relations on it,
    /// and run the prepared SQL with the given bindings.
    fn execute_sql(
        &self,
        route: &Arc<RouteDefinition>,
        processed: &ParamMap,
        bindings: &ParamMap,
        request: Option<&RequestMeta>,
        stack: &mut Vec<String>,
    ) -> Result<Table, ExecutionError> {
        let conn = self.connect(route, processed, request, stack)?;
        let mut stmt = conn.prepare(&route.prepared_sql)?;

        let values = engine_bindings(route, bindings);
        let reader = stmt.query_arrow(duckdb::params_from_iter(values))?;
        let schema = reader.get_schema();
        let batches: Vec<RecordBatch> = reader.collect();

        Ok(Table::new(schema, batches))
    }

    fn connect(
        &self,
        route: &Arc<RouteDefinition>,
        processed: &ParamMap,
        request: Option<&RequestMeta>,
        stack: &mut Vec<String>,
    ) -> Result<Connection, ExecutionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let conn = Connection::open_in_memory()?;

        for dependency in &route.uses {
            self.register_use(&conn, route, dependency, processed, request, stack)?;
        }

        Ok(conn)
    }

    fn register_use(
        &self,
        conn: &Connection,
        route: &Arc<RouteDefinition>,
        dependency: &RouteUse,
        processed: &ParamMap,
        request: Option<&RequestMeta>,
        stack: &mut Vec<String>,
    ) -> Result<(), ExecutionError> {
        let target = self.routes.get(&dependency.call).ok_or_else(|| {
            ExecutionError::RouteExecution {
                message: format!(
                    "route '{}' references unknown dependency '{}'",
                    route.id, dependency.call
                ),
            }
        })?;

        let args = resolve_use_args(dependency, processed);

        let outcome = match dependency.mode {
            UseMode::Relation => self
                .execute_inner(target, &args, ExecOptions::all(), request, stack)
                .and_then(|result| register_relation(conn, &dependency.alias, &result.table)),
            UseMode::ParquetPath => self
                .materialize_pages(target, &args, request, stack)
                .and_then(|(paths, schema)| {
                    register_parquet_view(conn, &dependency.alias, &paths, schema)
                }),
        };

        outcome.map_err(|err| match err {
            err @ ExecutionError::CircularDependency { .. } => err,
            other => ExecutionError::RouteExecution {
                message: format!(
                    "dependency '{}' ({}) of route '{}' failed: {other}",
                    dependency.alias, dependency.call, route.id
                ),
            },
        })
    }

    /// Ensure a dependency's cache pages exist on disk, returning their
    /// paths and the result schema.
    fn materialize_pages(
        &self,
        route: &Arc<RouteDefinition>,
        incoming: &ParamMap,
        request: Option<&RequestMeta>,
        stack: &mut Vec<String>,
    ) -> Result<(Vec<std::path::PathBuf>, arrow::datatypes::SchemaRef), ExecutionError> {
        if stack.iter().any(|id| id == &route.id) {
            let mut chain = stack.join(" -> ");
            chain.push_str(" -> ");
            chain.push_str(&route.id);
            return Err(ExecutionError::CircularDependency { chain });
        }

        if !route.caches_pages() {
            return Err(ExecutionError::RouteExecution {
                message: format!(
                    "route '{}' is used in parquet_path mode but does not materialise pages",
                    route.id
                ),
            });
        }

        stack.push(route.id.clone());
        let result = (|| {
            let coerced = coerce_params(route, incoming)?;
            let processed = self.registry.run_chain(route, coerced, request)?;
            let bindings = build_bindings(route, &processed)?;

            let settings = route.cache.as_ref().expect("cached route must have settings");
            let rows_per_page = settings.rows_per_page.unwrap_or(self.default_rows_per_page);
            let fingerprint = CacheStore::fingerprint(route, &processed);

            if self.cache.manifest(&route.id, &fingerprint)?.is_none() {
                let lock = self.cache.write_lock(&route.id, &fingerprint);
                let _guard = lock
                    .lock()
                    .expect("Cache writer lock should not be poisoned.");

                if self.cache.manifest(&route.id, &fingerprint)?.is_none() {
                    self.materialize(
                        route,
                        &fingerprint,
                        &processed,
                        &bindings,
                        rows_per_page,
                        request,
                        stack,
                    )?;
                }
            }

            let manifest = self
                .cache
                .manifest(&route.id, &fingerprint)?
                .ok_or_else(|| ExecutionError::Internal {
                    detail: format!("materialisation of '{}' left no manifest", route.id),
                })?;

            let schema = manifest.decode_schema()?;
            let paths = self.cache.page_paths(&route.id, &fingerprint, &manifest);

            Ok((paths, schema))
        })();
        stack.pop();

        result
    }
}

/// Coerce the incoming values against the route's parameter specs.
///
/// Declared parameters are converted (or defaulted); a required parameter
/// with neither value nor default fails here. Extra incoming keys are kept
/// for the preprocessors but never bound positionally.
pub fn coerce_params(
    route: &RouteDefinition,
    incoming: &ParamMap,
) -> Result<ParamMap, ExecutionError> {
    let mut values = ParamMap::new();
    let mut remaining = incoming.clone();

    for spec in &route.params {
        match remaining.remove(&spec.name) {
            Some(raw) => {
                values.insert(spec.name.clone(), spec.coerce(&raw)?);
            }
            None => {
                if let Some(default) = &spec.default {
                    values.insert(spec.name.clone(), default.clone());
                } else if spec.required {
                    return Err(ExecutionError::MissingParameter {
                        name: spec.name.clone(),
                    });
                } else {
                    values.insert(spec.name.clone(), ParamValue::Null);
                }
            }
        }
    }

    values.extend(remaining);
    Ok(values)
}

/// The distinct binding map in first-occurrence order of `param_order`.
/// A preprocessor that removed a required parameter surfaces here as
/// `missing_parameter`.
pub fn build_bindings(
    route: &RouteDefinition,
    processed: &ParamMap,
) -> Result<ParamMap, ExecutionError> {
    let mut bindings = ParamMap::new();

    for name in &route.param_order {
        if bindings.contains_key(name) {
            continue;
        }

        bindings.insert(name.clone(), binding_value(route, processed, name)?);
    }

    Ok(bindings)
}

/// The full positional bind list: one converted value per placeholder
/// occurrence, following `param_order` exactly.
pub fn bind_list(
    route: &RouteDefinition,
    processed: &ParamMap,
) -> Result<Vec<ParamValue>, ExecutionError> {
    route
        .param_order
        .iter()
        .map(|name| binding_value(route, processed, name))
        .collect()
}

fn binding_value(
    route: &RouteDefinition,
    processed: &ParamMap,
    name: &str,
) -> Result<ParamValue, ExecutionError> {
    if let Some(value) = processed.get(name) {
        return Ok(value.clone());
    }

    match route.find_param(name) {
        Some(spec) => {
            if let Some(default) = &spec.default {
                Ok(default.clone())
            } else if spec.required {
                Err(ExecutionError::MissingParameter {
                    name: name.to_owned(),
                })
            } else {
                Ok(ParamValue::Null)
            }
        }
        None => Ok(ParamValue::Null),
    }
}

/// DuckDB assigns one parameter slot per distinct named placeholder, indexed
/// by first appearance, so the engine boundary binds the deduplicated list.
fn engine_bindings(route: &RouteDefinition, bindings: &ParamMap) -> Vec<duckdb::types::Value> {
    let mut seen = Vec::new();
    let mut values = Vec::new();

    for name in &route.param_order {
        if seen.iter().any(|s| s == name) {
            continue;
        }
        seen.push(name.clone());
        values.push(
            bindings
                .get(name)
                .map(ParamValue::to_sql)
                .unwrap_or(duckdb::types::Value::Null),
        );
    }

    values
}

/// Constraining invariant queries for the supplied parameters. Null-valued
/// invariant parameters do not constrain the read.
fn invariant_queries(settings: &CacheSettings, processed: &ParamMap) -> Vec<InvariantQuery> {
    settings
        .invariant_filters
        .iter()
        .filter_map(|setting| {
            let value = processed.get(&setting.param)?;
            let tokens = param_tokens(value, setting);

            match tokens.is_empty() {
                true => None,
                false => Some(InvariantQuery {
                    setting: setting.clone(),
                    tokens,
                }),
            }
        })
        .collect()
}

/// Filter a directly-executed table down to rows matching the supplied
/// invariant values, mirroring the cache's in-page row filter.
fn filter_by_invariants(
    table: &Table,
    queries: &[InvariantQuery],
) -> Result<Table, ExecutionError> {
    if queries.is_empty() {
        return Ok(table.clone());
    }

    let mut filters = Vec::with_capacity(queries.len());

    for query in queries {
        let Some(column) = table.column_index(&query.setting.column) else {
            return Err(ExecutionError::RouteExecution {
                message: format!(
                    "invariant filter column '{}' is not present in the result",
                    query.setting.column
                ),
            });
        };

        let tokens: std::collections::HashSet<&str> =
            query.tokens.iter().map(String::as_str).collect();
        filters.push((column, tokens, query.setting.case_insensitive));
    }

    table.filter_rows(|batch, row| {
        filters.iter().all(|(column, tokens, case_insensitive)| {
            let (token, _) = crate::cache::cell_token(batch.column(*column), row, *case_insensitive);
            tokens.contains(token.as_str())
        })
    })
}

fn resolve_use_args(dependency: &RouteUse, processed: &ParamMap) -> ParamMap {
    let mut args = ParamMap::new();

    for (name, value) in &dependency.args {
        let resolved = match value {
            toml::Value::String(reference) if processed.contains_key(reference) => {
                processed[reference].clone()
            }
            other => ParamValue::from_toml(other),
        };

        args.insert(name.clone(), resolved);
    }

    args
}

fn register_relation(
    conn: &Connection,
    alias: &str,
    table: &Table,
) -> Result<(), ExecutionError> {
    let batch = match table.batches().is_empty() {
        true => RecordBatch::new_empty(table.schema()),
        false => table.concat()?,
    };

    let params = duckdb::vtab::arrow::arrow_recordbatch_to_query_params(batch);
    conn.execute(
        &format!(
            "CREATE OR REPLACE TEMP TABLE {} AS SELECT * FROM arrow(?, ?)",
            quote_ident(alias)
        ),
        params,
    )?;

    Ok(())
}

fn register_parquet_view(
    conn: &Connection,
    alias: &str,
    paths: &[std::path::PathBuf],
    schema: arrow::datatypes::SchemaRef,
) -> Result<(), ExecutionError> {
    if paths.is_empty() {
        let empty = RecordBatch::new_empty(schema);
        let params = duckdb::vtab::arrow::arrow_recordbatch_to_query_params(empty);
        conn.execute(
            &format!(
                "CREATE OR REPLACE TEMP TABLE {} AS SELECT * FROM arrow(?, ?)",
                quote_ident(alias)
            ),
            params,
        )?;
        return Ok(());
    }

    let list = paths
        .iter()
        .map(|path| format!("'{}'", path.display().to_string().replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ");

    conn.execute(
        &format!(
            "CREATE OR REPLACE TEMP VIEW {} AS SELECT * FROM read_parquet([{list}])",
            quote_ident(alias)
        ),
        [],
    )?;

    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::{compile_source, RouteSource};
    use indoc::indoc;

    fn compile(metadata: &str, sql: &str) -> RouteDefinition {
        compile_source(RouteSource {
            stem: "test".into(),
            origin: "test".into(),
            metadata: toml::from_str(metadata).unwrap(),
            sql: sql.to_owned(),
        })
        .unwrap()
    }

    struct Harness {
        _dir: tempfile::TempDir,
        executor: RouteExecutor,
    }

    fn harness(routes: Vec<RouteDefinition>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheStore::new(dir.path()));
        let executor = RouteExecutor::new(
            routes,
            cache,
            None,
            Arc::new(PreprocessRegistry::new()),
            5000,
        );

        Harness {
            _dir: dir,
            executor,
        }
    }

    fn params(pairs: &[(&str, &str)]) -> ParamMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ParamValue::Str(v.to_string())))
            .collect()
    }

    #[test]
    fn hello_route() {
        let route = compile(
            indoc! {r#"
                id = "greet"
                cache_mode = "passthrough"

                [params.name]
                type = "str"
                required = true
            "#},
            "SELECT 'Hello, ' || $name AS g",
        );

        let harness = harness(vec![route]);
        let result = harness
            .executor
            .execute("greet", &params(&[("name", "world")]), ExecOptions::all(), None)
            .unwrap();

        let rows = result.table.to_json_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["g"], "Hello, world");
    }

    #[test]
    fn coercion_binds_typed_values() {
        let route = compile(
            indoc! {r#"
                id = "typed"
                cache_mode = "passthrough"

                [params.count]
                type = "int"
                required = true
            "#},
            "SELECT $count * 2 AS doubled, $count AS again",
        );

        let harness = harness(vec![route.clone()]);

        let result = harness
            .executor
            .execute("typed", &params(&[("count", "7")]), ExecOptions::all(), None)
            .unwrap();
        assert_eq!(result.table.to_json_rows()[0]["doubled"], 14);

        // The bind list repeats the converted value per occurrence.
        let processed = coerce_params(&route, &params(&[("count", "7")])).unwrap();
        let list = bind_list(&route, &processed).unwrap();
        assert_eq!(list.len(), route.param_order.len());
        assert_eq!(list, vec![ParamValue::Int(7), ParamValue::Int(7)]);

        let err = harness
            .executor
            .execute("typed", &params(&[("count", "x")]), ExecOptions::all(), None)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_parameter");
    }

    #[test]
    fn missing_required_parameter() {
        let route = compile(
            indoc! {r#"
                id = "strict"
                cache_mode = "passthrough"

                [params.value]
                type = "int"
                required = true
            "#},
            "SELECT $value AS v",
        );

        let harness = harness(vec![route]);
        let err = harness
            .executor
            .execute("strict", &ParamMap::new(), ExecOptions::all(), None)
            .unwrap_err();

        assert_eq!(err.code(), "missing_parameter");
    }

    #[test]
    fn defaults_bind_when_absent() {
        let route = compile(
            indoc! {r#"
                id = "defaulted"
                cache_mode = "passthrough"

                [params.limit]
                type = "int"
                default = 3
            "#},
            "SELECT $limit AS v",
        );

        let harness = harness(vec![route]);
        let result = harness
            .executor
            .execute("defaulted", &ParamMap::new(), ExecOptions::all(), None)
            .unwrap();

        assert_eq!(result.table.to_json_rows()[0]["v"], 3);
    }

    #[test]
    fn cache_reuse_skips_engine() {
        let route = compile(
            indoc! {r#"
                id = "paged"

                [cache]
                order_by = ["id"]
                rows_per_page = 2
            "#},
            "SELECT range AS id FROM range(0, 5) ORDER BY id",
        );

        let harness = harness(vec![route]);

        let first = harness
            .executor
            .execute("paged", &ParamMap::new(), ExecOptions::window(0, Some(5)), None)
            .unwrap();
        assert!(first.used_cache);
        assert!(!first.cache_hit);
        assert_eq!(first.table.num_rows(), 5);
        assert_eq!(harness.executor.connect_count(), 1);

        let second = harness
            .executor
            .execute("paged", &ParamMap::new(), ExecOptions::window(3, Some(2)), None)
            .unwrap();
        assert!(second.cache_hit);

        let rows = second.table.to_json_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], 3);
        assert_eq!(rows[1]["id"], 4);

        // The engine was connected exactly once across both requests.
        assert_eq!(harness.executor.connect_count(), 1);
    }

    #[test]
    fn invariant_filter_reuses_superset_cache() {
        let route = compile(
            indoc! {r#"
                id = "inventory"

                [params.c]
                type = "str"

                [cache]
                order_by = ["seq"]
                rows_per_page = 5
                invariant_filters = [ { param = "c", column = "c" } ]
            "#},
            indoc! {r#"
                SELECT c, seq
                FROM (VALUES ('A', 1), ('B', 2), ('A', 3)) AS t(c, seq)
                WHERE c = COALESCE($c, c)
                ORDER BY seq
            "#},
        );

        let harness = harness(vec![route]);

        let first = harness
            .executor
            .execute("inventory", &params(&[("c", "A")]), ExecOptions::all(), None)
            .unwrap();
        assert!(first.used_cache);
        assert_eq!(first.total_rows, 2);
        assert_eq!(harness.executor.connect_count(), 1);

        // The second value is served from the same artefact: the index knows
        // every value the full materialisation observed.
        let second = harness
            .executor
            .execute("inventory", &params(&[("c", "B")]), ExecOptions::all(), None)
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.total_rows, 1);
        assert_eq!(second.table.to_json_rows()[0]["seq"], 2);
        assert_eq!(harness.executor.connect_count(), 1);

        // An unfiltered request reads the whole artefact.
        let all = harness
            .executor
            .execute("inventory", &ParamMap::new(), ExecOptions::all(), None)
            .unwrap();
        assert_eq!(all.total_rows, 3);
        assert_eq!(harness.executor.connect_count(), 1);
    }

    #[test]
    fn unknown_invariant_value_takes_slow_path() {
        let route = compile(
            indoc! {r#"
                id = "inventory"

                [params.c]
                type = "str"

                [cache]
                order_by = ["seq"]
                rows_per_page = 5
                invariant_filters = [ { param = "c", column = "c" } ]
            "#},
            indoc! {r#"
                SELECT c, seq
                FROM (VALUES ('A', 1), ('B', 2)) AS t(c, seq)
                WHERE c = COALESCE($c, c)
                ORDER BY seq
            "#},
        );

        let harness = harness(vec![route]);

        harness
            .executor
            .execute("inventory", &params(&[("c", "A")]), ExecOptions::all(), None)
            .unwrap();
        assert_eq!(harness.executor.connect_count(), 1);

        let missing = harness
            .executor
            .execute("inventory", &params(&[("c", "Z")]), ExecOptions::all(), None)
            .unwrap();

        assert!(!missing.used_cache);
        assert_eq!(missing.total_rows, 0);
        assert_eq!(harness.executor.connect_count(), 2);
    }

    #[test]
    fn relation_dependency() {
        let child = compile(
            indoc! {r#"
                id = "child"
                cache_mode = "passthrough"
            "#},
            "SELECT range AS value FROM range(0, 3)",
        );

        let parent = compile(
            indoc! {r#"
                id = "parent"
                cache_mode = "passthrough"

                [[uses]]
                alias = "child_data"
                call = "child"
                mode = "relation"
            "#},
            "SELECT SUM(value) AS total FROM child_data",
        );

        let harness = harness(vec![child, parent]);
        let result = harness
            .executor
            .execute("parent", &ParamMap::new(), ExecOptions::all(), None)
            .unwrap();

        assert_eq!(result.table.to_json_rows()[0]["total"], 3);
    }

    #[test]
    fn parquet_path_dependency() {
        let child = compile(
            indoc! {r#"
                id = "child"

                [cache]
                order_by = ["value"]
                rows_per_page = 10
            "#},
            "SELECT range AS value FROM range(0, 3)",
        );

        let parent = compile(
            indoc! {r#"
                id = "parent"
                cache_mode = "passthrough"

                [[uses]]
                alias = "child_data"
                call = "child"
                mode = "parquet_path"
            "#},
            "SELECT SUM(value) AS total FROM child_data",
        );

        let harness = harness(vec![child, parent]);
        let result = harness
            .executor
            .execute("parent", &ParamMap::new(), ExecOptions::all(), None)
            .unwrap();

        assert_eq!(result.table.to_json_rows()[0]["total"], 3);
    }

    #[test]
    fn circular_dependencies_are_detected() {
        let a = compile(
            indoc! {r#"
                id = "a"
                cache_mode = "passthrough"

                [[uses]]
                alias = "b_data"
                call = "b"
                mode = "relation"
            "#},
            "SELECT * FROM b_data",
        );

        let b = compile(
            indoc! {r#"
                id = "b"
                cache_mode = "passthrough"

                [[uses]]
                alias = "a_data"
                call = "a"
                mode = "relation"
            "#},
            "SELECT * FROM a_data",
        );

        let cyclic = harness(vec![a, b]);
        let err = cyclic
            .executor
            .execute("a", &ParamMap::new(), ExecOptions::all(), None)
            .unwrap_err();

        assert_eq!(err.code(), "circular_dependency");

        // Failure does not poison later, independent executions.
        let healthy = compile(
            indoc! {r#"
                id = "healthy"
                cache_mode = "passthrough"
            "#},
            "SELECT 42 AS answer",
        );

        let recovered = harness(vec![healthy]);
        let result = recovered
            .executor
            .execute("healthy", &ParamMap::new(), ExecOptions::all(), None)
            .unwrap();
        assert_eq!(result.table.to_json_rows()[0]["answer"], 42);
    }

    #[test]
    fn preprocessors_can_rewrite_params() {
        let route = compile(
            indoc! {r#"
                id = "stamped"
                cache_mode = "passthrough"

                [params.name]
                type = "str"

                [[preprocess]]
                callable_module = "demo.preprocessors"
                callable_name = "upper"
            "#},
            "SELECT $name AS shouted",
        );

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheStore::new(dir.path()));
        let registry = Arc::new(PreprocessRegistry::new());

        registry.register(
            "module:demo.preprocessors::upper",
            |mut params: ParamMap, _ctx: &PreprocessContext| {
                if let Some(ParamValue::Str(name)) = params.get("name") {
                    let upper = name.to_uppercase();
                    params.insert("name".into(), ParamValue::Str(upper));
                }
                Ok(Some(params))
            },
        );

        let executor = RouteExecutor::new(vec![route], cache, None, registry, 5000);
        let result = executor
            .execute("stamped", &params(&[("name", "duck")]), ExecOptions::all(), None)
            .unwrap();

        assert_eq!(result.table.to_json_rows()[0]["shouted"], "DUCK");
    }

    #[test]
    fn preprocessor_removing_required_param_is_missing_at_bind() {
        let route = compile(
            indoc! {r#"
                id = "dropper"
                cache_mode = "passthrough"

                [params.value]
                type = "int"
                required = true

                [[preprocess]]
                callable_module = "demo.preprocessors"
                callable_name = "drop_value"
            "#},
            "SELECT $value AS v",
        );

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheStore::new(dir.path()));
        let registry = Arc::new(PreprocessRegistry::new());

        registry.register(
            "module:demo.preprocessors::drop_value",
            |mut params: ParamMap, _ctx: &PreprocessContext| {
                params.remove("value");
                Ok(Some(params))
            },
        );

        let executor = RouteExecutor::new(vec![route], cache, None, registry, 5000);
        let err = executor
            .execute("dropper", &params(&[("value", "1")]), ExecOptions::all(), None)
            .unwrap_err();

        assert_eq!(err.code(), "missing_parameter");
    }

    #[test]
    fn passthrough_ignores_invariant_declarations() {
        let route = compile(
            indoc! {r#"
                id = "direct"
                cache_mode = "passthrough"

                [params.c]
                type = "str"

                [cache]
                order_by = ["seq"]
                invariant_filters = [ { param = "c", column = "c" } ]
            "#},
            indoc! {r#"
                SELECT c, seq FROM (VALUES ('A', 1), ('B', 2)) AS t(c, seq)
                WHERE c = COALESCE($c, c)
            "#},
        );

        let harness = harness(vec![route]);

        harness
            .executor
            .execute("direct", &params(&[("c", "A")]), ExecOptions::all(), None)
            .unwrap();
        harness
            .executor
            .execute("direct", &params(&[("c", "A")]), ExecOptions::all(), None)
            .unwrap();

        // Every request executes; nothing is ever materialised.
        assert_eq!(harness.executor.connect_count(), 2);
    }

    #[test]
    fn overrides_rewrite_result_cells() {
        use crate::meta::{compute_row_key_from_values, MetaStore, OverlayStore};

        let route = compile(
            indoc! {r#"
                id = "greet"
                cache_mode = "passthrough"

                [params.name]
                type = "str"
                required = true

                [overrides]
                key_columns = ["g"]
                allowed = ["note"]
            "#},
            "SELECT 'Hello, ' || $name AS g",
        );

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheStore::new(dir.path()));
        let meta = Arc::new(MetaStore::open(dir.path()).unwrap());
        let overlays = Arc::new(OverlayStore::new(meta));

        let executor = RouteExecutor::new(
            vec![route],
            cache,
            Some(overlays.clone()),
            Arc::new(PreprocessRegistry::new()),
            5000,
        );

        let row_key = compute_row_key_from_values(&[Some("Hello, world".into())]);
        overlays
            .upsert(
                "greet",
                &row_key,
                "note",
                &serde_json::json!("hi"),
                None,
                None,
                None,
            )
            .unwrap();

        let result = executor
            .execute("greet", &params(&[("name", "world")]), ExecOptions::all(), None)
            .unwrap();

        let rows = result.table.to_json_rows();
        assert_eq!(rows[0]["g"], "Hello, world");
        assert_eq!(rows[0]["note"], "hi");

        // A non-matching row key leaves the table untouched.
        let other = executor
            .execute("greet", &params(&[("name", "duck")]), ExecOptions::all(), None)
            .unwrap();
        assert_eq!(other.table.to_json_rows()[0].get("note"), None);
    }

    #[test]
    fn self_heals_after_cache_corruption() {
        let route = compile(
            indoc! {r#"
                id = "healing"

                [cache]
                order_by = ["id"]
                rows_per_page = 2
            "#},
            "SELECT range AS id FROM range(0, 4) ORDER BY id",
        );

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheStore::new(dir.path()));
        let executor = RouteExecutor::new(
            vec![route],
            cache,
            None,
            Arc::new(PreprocessRegistry::new()),
            5000,
        );

        executor
            .execute("healing", &ParamMap::new(), ExecOptions::all(), None)
            .unwrap();

        // Break a page behind the manifest's back.
        let pages: Vec<_> = walkdir::WalkDir::new(dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".parquet"))
            .collect();
        assert!(!pages.is_empty());
        std::fs::remove_file(pages[0].path()).unwrap();

        let healed = executor
            .execute("healing", &ParamMap::new(), ExecOptions::all(), None)
            .unwrap();

        assert_eq!(healed.table.num_rows(), 4);
        assert!(!healed.cache_hit);
    }
}
