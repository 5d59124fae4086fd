//! The compiled route model.
//!
//! A [`RouteDefinition`] is the executable record the compiler emits: the
//! prepared SQL, the parameter specs, the cache directives, and the
//! declarative dependencies on other routes. Definitions are immutable once
//! compiled and serialise to JSON in the build directory.

mod params;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ahash::AHashMap;
pub use params::*;
use serde::{Deserialize, Serialize};

use crate::error::CompileError;
use crate::prelude::*;

/// A high-speed map of strings and TOML values.
pub type TomlMap = AHashMap<String, toml::Value>;

/// A parameter map as it flows through coercion, preprocessing and binding.
/// Ordered so canonical encodings are stable under key permutation.
pub type ParamMap = std::collections::BTreeMap<String, ParamValue>;

/// The HTTP methods a route may be mounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

/// Whether query results are persisted to the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    Materialize,
    Passthrough,
}

/// How a dependency's result is registered in the dependent's SQL scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseMode {
    /// The result table is registered under the alias as an in-memory relation.
    Relation,
    /// The dependency's cache pages back a view over on-disk Parquet files.
    ParquetPath,
}

/// A declarative dependency of one route on another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteUse {
    pub alias: String,
    pub call: String,
    pub mode: UseMode,
    /// Arguments for the dependency. String values naming a current
    /// parameter are resolved to that parameter's value at execution time;
    /// everything else is passed as a literal.
    #[serde(default)]
    pub args: BTreeMap<String, toml::Value>,
}

/// One invariant-filter declaration from a route's cache block.
///
/// The named parameter's SQL effect must be purely a post-filter on
/// `column`; it is excluded from the cache fingerprint so that different
/// values share one cache directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantFilterSetting {
    pub param: String,
    pub column: String,
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default)]
    pub case_insensitive: bool,
}

/// The normalised cache block of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Lowercased column names the materialised result is ordered by.
    pub order_by: Vec<String>,
    /// Soft page-size bound; the global config default applies when unset.
    #[serde(default)]
    pub rows_per_page: Option<usize>,
    #[serde(default)]
    pub invariant_filters: Vec<InvariantFilterSetting>,
    #[serde(default)]
    pub profile: Option<String>,
}

impl CacheSettings {
    pub fn invariant_for_param(&self, name: &str) -> Option<&InvariantFilterSetting> {
        self.invariant_filters.iter().find(|f| f.param == name)
    }

    pub fn is_invariant_param(&self, name: &str) -> bool {
        self.invariant_for_param(name).is_some()
    }
}

/// The `overrides` block: which columns may be overridden, and which
/// columns identify a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverridesSettings {
    pub key_columns: Vec<String>,
    #[serde(default)]
    pub allowed: Vec<String>,
}

/// The `append` block: columns collected into an append-mode CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendSettings {
    pub columns: Vec<String>,
    #[serde(default)]
    pub destination: Option<String>,
}

impl AppendSettings {
    pub fn destination_for(&self, route_id: &str) -> String {
        self.destination
            .clone()
            .unwrap_or_else(|| format!("{route_id}.csv"))
    }
}

/// Where a preprocess callable lives.
///
/// Descriptors are resolved at compile time; at execute time they are typed
/// keys into the host's preprocessor registry, not dynamically loaded code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallableSource {
    Module(String),
    Path(PathBuf),
}

/// Normalised description of a preprocess callable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallableDescriptor {
    pub name: String,
    pub source: CallableSource,
}

impl CallableDescriptor {
    /// The registry key the host process registers implementations under.
    pub fn registry_key(&self) -> String {
        match &self.source {
            CallableSource::Module(module) => format!("module:{module}::{}", self.name),
            CallableSource::Path(path) => format!("path:{}::{}", path.display(), self.name),
        }
    }
}

/// One step of a route's preprocess chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessStep {
    pub callable: CallableDescriptor,
    #[serde(default)]
    pub options: TomlMap,
}

/// A fully compiled, executable route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Stable identifier, unique across the compiled set.
    pub id: String,
    /// URL template the route is mounted under.
    pub path: String,
    pub methods: Vec<Method>,
    /// The SQL as authored.
    pub raw_sql: String,
    /// The SQL after placeholder rewriting; contains only `$param_<name>`
    /// references.
    pub prepared_sql: String,
    /// Parameter names in placeholder appearance order, repetition preserved.
    pub param_order: Vec<String>,
    pub params: Vec<ParameterSpec>,
    /// Compile-time constants, already substituted into `prepared_sql`.
    #[serde(default)]
    pub constants: BTreeMap<String, String>,
    #[serde(default)]
    pub preprocess: Vec<PreprocessStep>,
    #[serde(default)]
    pub uses: Vec<RouteUse>,
    #[serde(default)]
    pub cache: Option<CacheSettings>,
    #[serde(default)]
    pub cache_mode: CacheMode,
    #[serde(default)]
    pub overrides: Option<OverridesSettings>,
    #[serde(default)]
    pub append: Option<AppendSettings>,
    /// Remaining metadata sections (view configs, charts, ...) passed
    /// through untouched for the formatting layer.
    #[serde(default)]
    pub metadata: TomlMap,
}

impl RouteDefinition {
    pub fn find_param(&self, name: &str) -> Option<&ParameterSpec> {
        self.params.iter().find(|spec| spec.name == name)
    }

    /// Whether page caching applies to this route at all.
    pub fn caches_pages(&self) -> bool {
        self.cache_mode == CacheMode::Materialize && self.cache.is_some()
    }

    pub fn allows_method(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }
}

/// Read every compiled route record out of a build directory.
pub fn load_compiled_routes(build: &Path) -> Result<Vec<RouteDefinition>> {
    let mut routes = Vec::new();

    for entry in std::fs::read_dir(build)
        .wrap_err_with(|| format!("Could not read build directory {build:?}"))?
    {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            let text = std::fs::read_to_string(&path)?;
            let route: RouteDefinition = serde_json::from_str(&text)
                .wrap_err_with(|| format!("Malformed compiled route at {path:?}"))?;
            routes.push(route);
        }
    }

    routes.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(routes)
}

/// Serialise a compiled route into the build directory.
pub fn store_compiled_route(build: &Path, route: &RouteDefinition) -> Result<(), CompileError> {
    std::fs::create_dir_all(build)?;

    let path = build.join(format!("{}.json", route.id));
    let json = serde_json::to_string_pretty(route)
        .map_err(|e| CompileError::Metadata { detail: e.to_string() })?;

    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal_route() -> RouteDefinition {
        RouteDefinition {
            id: "greet".into(),
            path: "/greet".into(),
            methods: vec![Method::Get],
            raw_sql: "SELECT 'Hello, ' || {{name}} AS g".into(),
            prepared_sql: "SELECT 'Hello, ' || $param_name AS g".into(),
            param_order: vec!["name".into()],
            params: vec![ParameterSpec::new("name", ParamType::String)],
            constants: BTreeMap::new(),
            preprocess: Vec::new(),
            uses: Vec::new(),
            cache: None,
            cache_mode: CacheMode::Materialize,
            overrides: None,
            append: None,
            metadata: TomlMap::default(),
        }
    }

    #[test]
    fn roundtrip_through_build_dir() {
        let dir = tempfile::tempdir().unwrap();
        let route = minimal_route();

        store_compiled_route(dir.path(), &route).unwrap();
        let loaded = load_compiled_routes(dir.path()).unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, route.id);
        assert_eq!(loaded[0].prepared_sql, route.prepared_sql);
        assert_eq!(loaded[0].param_order, route.param_order);
    }

    #[test]
    fn registry_keys_distinguish_sources() {
        let module = CallableDescriptor {
            name: "stamp".into(),
            source: CallableSource::Module("demo.preprocessors".into()),
        };
        let path = CallableDescriptor {
            name: "stamp".into(),
            source: CallableSource::Path("plugins/stamp.py".into()),
        };

        assert_ne!(module.registry_key(), path.registry_key());
    }
}
