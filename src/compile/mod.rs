//! The route compiler.
//!
//! Turns route source pairs (TOML metadata + SQL) into executable
//! [`RouteDefinition`] records: parameter specs, placeholder rewriting,
//! cache/preprocess/uses normalisation, and inline directive merging.
//! All compile errors are terminal for the affected route.

mod directives;
mod frontmatter;
mod placeholders;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use directives::{scan_directives, DirectivePayload, RouteDirective};
use itertools::Itertools;
pub use placeholders::prepare_sql;
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::error::CompileError;
use crate::prelude::*;
use crate::route::*;

/// A discovered route source pair, before compilation.
#[derive(Debug)]
pub struct RouteSource {
    pub stem: String,
    pub origin: PathBuf,
    pub metadata: toml::Table,
    pub sql: String,
}

/// Walk `source` for route sources, compile them in parallel, and write the
/// compiled records into `build`. Any failing route fails the whole pass;
/// partial output for a failing route is never emitted.
pub fn compile_routes(source: &Path, build: &Path) -> Result<Vec<RouteDefinition>> {
    let sources = discover_sources(source)?;

    info!(
        "Compiling {} route source(s) from {source:?}...",
        sources.len()
    );

    let outcomes: Vec<_> = sources
        .into_par_iter()
        .map(|src| {
            let origin = src.origin.clone();
            compile_source(src).map_err(|err| (origin, err))
        })
        .collect();

    let mut routes = Vec::new();
    let mut failures = 0_usize;

    for outcome in outcomes {
        match outcome {
            Ok(route) => routes.push(route),
            Err((origin, err)) => {
                failures += 1;
                error!("Failed to compile {origin:?}: {err}");
            }
        }
    }

    ensure!(
        failures == 0,
        "{failures} route(s) failed to compile - see log for details."
    );

    routes.sort_by(|a, b| a.id.cmp(&b.id));

    let duplicates: Vec<&str> = routes
        .iter()
        .map(|route| route.id.as_str())
        .duplicates()
        .collect();
    ensure!(
        duplicates.is_empty(),
        "Duplicate route id(s): {duplicates:?}."
    );

    for route in &routes {
        store_compiled_route(build, route)
            .wrap_err_with(|| format!("Could not store compiled route '{}'", route.id))?;
    }

    info!("Compiled {} route(s) into {build:?}.", routes.len());
    Ok(routes)
}

/// Find `.sql.md` single-file sources and `.toml`/`.sql` pairs.
fn discover_sources(source: &Path) -> Result<Vec<RouteSource>> {
    let mut sources = Vec::new();

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        if let Some(stem) = name.strip_suffix(".sql.md") {
            let text = std::fs::read_to_string(path)?;
            let (metadata, sql) = frontmatter::split_source(&text)
                .map_err(|err| eyre!("{err}").wrap_err(format!("in {path:?}")))?;

            sources.push(RouteSource {
                stem: stem.to_owned(),
                origin: path.to_owned(),
                metadata,
                sql,
            });
        } else if let Some(stem) = name.strip_suffix(".toml") {
            let sibling = path.with_extension("sql");
            if !sibling.is_file() {
                continue;
            }

            let metadata: toml::Table = toml::from_str(&std::fs::read_to_string(path)?)
                .wrap_err_with(|| format!("Malformed metadata in {path:?}"))?;
            let sql = std::fs::read_to_string(&sibling)?.trim().to_owned();

            sources.push(RouteSource {
                stem: stem.to_owned(),
                origin: path.to_owned(),
                metadata,
                sql,
            });
        }
    }

    Ok(sources)
}

/// Compile one source pair into a [`RouteDefinition`].
pub fn compile_source(source: RouteSource) -> Result<RouteDefinition, CompileError> {
    let RouteSource {
        stem,
        origin: _,
        mut metadata,
        sql,
    } = source;

    let directives = scan_directives(&sql);

    let id = match metadata.remove("id") {
        Some(toml::Value::String(id)) => id,
        Some(_) => {
            return Err(CompileError::Metadata {
                detail: "id must be a string".into(),
            })
        }
        None => stem,
    };

    let path = match metadata.remove("path") {
        Some(toml::Value::String(path)) => path,
        Some(_) => {
            return Err(CompileError::Metadata {
                detail: "path must be a string".into(),
            })
        }
        None => format!("/{id}"),
    };

    let methods = build_methods(metadata.remove("methods").as_ref())?;
    let constants = build_constants(metadata.remove("constants").as_ref())?;
    let params = build_params(metadata.remove("params"), &directives)?;
    let (cache_mode, cache) = build_cache(
        metadata.remove("cache_mode").as_ref(),
        metadata.remove("cache"),
        &directives,
    )?;
    let preprocess = build_preprocess(metadata.remove("preprocess").as_ref())?;
    let uses = build_uses(metadata.remove("uses").as_ref())?;
    let overrides = build_overrides(metadata.remove("overrides").as_ref())?;
    let append = build_append(metadata.remove("append").as_ref())?;

    let (param_order, prepared_sql) = prepare_sql(&sql, &params, &constants)?;

    // Whatever remains (view configs, charts, titles) rides along untouched.
    let metadata: TomlMap = metadata.into_iter().collect();

    Ok(RouteDefinition {
        id,
        path,
        methods,
        raw_sql: sql,
        prepared_sql,
        param_order,
        params,
        constants,
        preprocess,
        uses,
        cache,
        cache_mode,
        overrides,
        append,
        metadata,
    })
}

fn build_methods(value: Option<&toml::Value>) -> Result<Vec<Method>, CompileError> {
    let names = directives::normalize_string_list(value);
    if names.is_empty() {
        return Ok(vec![Method::Get]);
    }

    names
        .iter()
        .map(|name| match name.as_str() {
            "get" => Ok(Method::Get),
            "post" => Ok(Method::Post),
            other => Err(CompileError::Metadata {
                detail: format!("unsupported method '{other}'"),
            }),
        })
        .collect()
}

fn build_constants(
    value: Option<&toml::Value>,
) -> Result<BTreeMap<String, String>, CompileError> {
    let Some(value) = value else {
        return Ok(BTreeMap::new());
    };

    let table = value.as_table().ok_or_else(|| CompileError::Metadata {
        detail: "constants must be a table".into(),
    })?;

    let mut resolved = BTreeMap::new();

    for (name, raw) in table {
        if !is_identifier(name) {
            return Err(CompileError::Metadata {
                detail: format!(
                    "invalid constant name '{name}'; use letters, numbers, and underscores"
                ),
            });
        }

        let text = match raw {
            toml::Value::String(s) => s.clone(),
            toml::Value::Table(spec) => {
                if let Some(value) = spec.get("value").or_else(|| spec.get("literal")) {
                    match value {
                        toml::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    }
                } else if let Some(toml::Value::String(var)) = spec.get("env") {
                    std::env::var(var).map_err(|_| CompileError::Metadata {
                        detail: format!(
                            "constant '{name}' reads environment variable '{var}', which is unset"
                        ),
                    })?
                } else {
                    return Err(CompileError::Metadata {
                        detail: format!("constant '{name}' must specify 'value' or 'env'"),
                    });
                }
            }
            other => other.to_string(),
        };

        resolved.insert(name.clone(), text);
    }

    Ok(resolved)
}

fn build_params(
    value: Option<toml::Value>,
    directives: &[RouteDirective],
) -> Result<Vec<ParameterSpec>, CompileError> {
    let mut table = match value {
        Some(toml::Value::Table(table)) => table,
        Some(_) => {
            return Err(CompileError::Metadata {
                detail: "params must be a table".into(),
            })
        }
        None => toml::Table::new(),
    };

    for payload in directives::collect_directive_payloads(directives, "params") {
        merge_param_payload(&mut table, &payload);
    }

    table.into_iter().map(|(name, value)| param_spec(name, value)).collect()
}

/// Merge a `@params` directive payload into the params table. Scalar strings
/// are type shorthand; other scalars become defaults; structured metadata
/// wins on conflicts.
fn merge_param_payload(target: &mut toml::Table, payload: &DirectivePayload) {
    let value = match payload {
        DirectivePayload::Json(json) => directives::json_to_toml(json),
        DirectivePayload::Args(args) => {
            let mut table = toml::Table::new();
            for (key, value) in args {
                table.insert(key.clone(), toml::Value::String(value.clone()));
            }
            toml::Value::Table(table)
        }
        DirectivePayload::Text(_) => return,
    };

    merge_param_value(target, &value);
}

fn merge_param_value(target: &mut toml::Table, value: &toml::Value) {
    match value {
        toml::Value::Array(items) => {
            for item in items {
                merge_param_value(target, item);
            }
        }
        toml::Value::Table(params) => {
            for (name, spec) in params {
                let normalised = match spec {
                    toml::Value::String(ty) => {
                        let mut table = toml::Table::new();
                        table.insert("type".into(), toml::Value::String(ty.clone()));
                        toml::Value::Table(table)
                    }
                    toml::Value::Table(table) => toml::Value::Table(table.clone()),
                    scalar => {
                        let mut table = toml::Table::new();
                        table.insert("default".into(), scalar.clone());
                        toml::Value::Table(table)
                    }
                };

                match target.get_mut(name) {
                    None => {
                        target.insert(name.clone(), normalised);
                    }
                    Some(toml::Value::Table(existing)) => {
                        if let toml::Value::Table(incoming) = normalised {
                            for (key, item) in incoming {
                                existing.entry(key).or_insert(item);
                            }
                        }
                    }
                    Some(_) => {}
                }
            }
        }
        _ => {}
    }
}

fn param_spec(name: String, value: toml::Value) -> Result<ParameterSpec, CompileError> {
    let bad_type = |ty: &str| CompileError::Metadata {
        detail: format!("parameter '{name}' declares unknown type '{ty}'"),
    };

    match value {
        // Scalar shorthand: `name = "VARCHAR"`.
        toml::Value::String(ty) => {
            let parsed = ParamType::parse(&ty).ok_or_else(|| bad_type(&ty))?;
            Ok(ParameterSpec::new(name, parsed))
        }
        toml::Value::Table(table) => {
            let ty = match table.get("type").or_else(|| table.get("duckdb_type")) {
                Some(toml::Value::String(ty)) => {
                    ParamType::parse(ty).ok_or_else(|| bad_type(ty))?
                }
                Some(_) => {
                    return Err(CompileError::Metadata {
                        detail: format!("parameter '{name}' type must be a string"),
                    })
                }
                // An untyped parameter takes its type from its default,
                // falling back to string.
                None => match table.get("default") {
                    Some(toml::Value::Integer(_)) => ParamType::Integer,
                    Some(toml::Value::Float(_)) => ParamType::Float,
                    Some(toml::Value::Boolean(_)) => ParamType::Boolean,
                    _ => ParamType::String,
                },
            };

            let mut spec = ParameterSpec::new(name.clone(), ty);

            spec.required = table
                .get("required")
                .and_then(toml::Value::as_bool)
                .unwrap_or(false);

            if let Some(default) = table.get("default") {
                let lifted = ParamValue::from_toml(default);
                let coerced = spec.coerce(&lifted).map_err(|err| CompileError::Metadata {
                    detail: format!("parameter '{name}' default is invalid: {err}"),
                })?;
                spec.default = Some(coerced);
            }

            spec.description = string_field(&table, "description");
            spec.ui_control = string_field(&table, "ui_control");
            spec.ui_label = string_field(&table, "ui_label");
            spec.placeholder = string_field(&table, "placeholder");
            spec.options = directives::normalize_string_list(table.get("options"));

            Ok(spec)
        }
        _ => Err(CompileError::Metadata {
            detail: format!("parameter '{name}' must be a type name or a table"),
        }),
    }
}

fn string_field(table: &toml::Table, key: &str) -> Option<String> {
    table.get(key).and_then(toml::Value::as_str).map(str::to_owned)
}

fn build_cache(
    cache_mode: Option<&toml::Value>,
    cache: Option<toml::Value>,
    directives: &[RouteDirective],
) -> Result<(CacheMode, Option<CacheSettings>), CompileError> {
    let mode = match cache_mode.and_then(toml::Value::as_str) {
        Some("passthrough") => CacheMode::Passthrough,
        Some("materialize") | None => CacheMode::Materialize,
        Some(other) => {
            return Err(CompileError::Metadata {
                detail: format!("unsupported cache_mode '{other}'"),
            })
        }
    };

    let mut table = match cache {
        Some(toml::Value::Table(table)) => table,
        Some(toml::Value::Boolean(false)) | None => toml::Table::new(),
        Some(_) => {
            return Err(CompileError::Metadata {
                detail: "cache must be a table".into(),
            })
        }
    };

    // Accept the `order-by` spelling, normalised before directive merging.
    if let Some(value) = table.remove("order-by") {
        table.entry("order_by").or_insert(value);
    }

    for payload in directives::collect_directive_payloads(directives, "cache") {
        match payload {
            DirectivePayload::Json(json) => {
                if let toml::Value::Table(incoming) = directives::json_to_toml(&json) {
                    directives::merge_into_table(&mut table, &incoming);
                }
            }
            DirectivePayload::Args(args) => {
                let mut incoming = toml::Table::new();
                for (key, value) in args {
                    let key = if key == "order-by" { "order_by".into() } else { key };
                    incoming.insert(key, toml::Value::String(value));
                }
                directives::merge_into_table(&mut table, &incoming);
            }
            DirectivePayload::Text(profile) => {
                table
                    .entry("profile")
                    .or_insert(toml::Value::String(profile));
            }
        }
    }

    let enabled = table
        .remove("enabled")
        .and_then(|value| value.as_bool())
        .unwrap_or(true);

    if table.is_empty() || !enabled {
        return Ok((mode, None));
    }

    let order_by = directives::normalize_string_list(table.get("order_by"));
    if order_by.is_empty() {
        return Err(CompileError::MissingOrderBy);
    }

    let rows_per_page = match table.get("rows_per_page") {
        None => None,
        Some(toml::Value::Integer(n)) if *n > 0 => Some(*n as usize),
        Some(toml::Value::String(s)) => Some(s.parse::<usize>().map_err(|_| {
            CompileError::Metadata {
                detail: format!("rows_per_page '{s}' is not a positive integer"),
            }
        })?),
        Some(other) => {
            return Err(CompileError::Metadata {
                detail: format!("rows_per_page '{other}' is not a positive integer"),
            })
        }
    };

    let invariant_filters = match table.get("invariant_filters") {
        None => Vec::new(),
        Some(toml::Value::Array(items)) => items
            .iter()
            .map(invariant_setting)
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(CompileError::Metadata {
                detail: "invariant_filters must be an array of tables".into(),
            })
        }
    };

    let profile = table
        .get("profile")
        .and_then(toml::Value::as_str)
        .map(str::to_owned);

    let settings = CacheSettings {
        order_by,
        rows_per_page,
        invariant_filters,
        profile,
    };

    Ok((mode, Some(settings)))
}

fn invariant_setting(value: &toml::Value) -> Result<InvariantFilterSetting, CompileError> {
    let table = value.as_table().ok_or_else(|| CompileError::Metadata {
        detail: "invariant filter entries must be tables".into(),
    })?;

    let param = table
        .get("param")
        .and_then(toml::Value::as_str)
        .ok_or_else(|| CompileError::Metadata {
            detail: "invariant filter must name a param".into(),
        })?
        .to_owned();

    let column = table
        .get("column")
        .and_then(toml::Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| param.clone());

    Ok(InvariantFilterSetting {
        param,
        column: column.to_lowercase(),
        separator: string_field(table, "separator"),
        case_insensitive: table
            .get("case_insensitive")
            .and_then(toml::Value::as_bool)
            .unwrap_or(false),
    })
}

fn build_preprocess(value: Option<&toml::Value>) -> Result<Vec<PreprocessStep>, CompileError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };

    match value {
        toml::Value::Array(items) => {
            let mut steps = Vec::new();
            for item in items {
                steps.extend(build_preprocess(Some(item))?);
            }
            Ok(steps)
        }
        toml::Value::String(reference) => Ok(vec![PreprocessStep {
            callable: legacy_descriptor(reference)?,
            options: TomlMap::default(),
        }]),
        toml::Value::Table(table) => Ok(vec![preprocess_step(table)?]),
        _ => Err(CompileError::CallableResolution {
            detail: "preprocess entries must be strings or tables".into(),
        }),
    }
}

const RESERVED_STEP_KEYS: &[&str] = &[
    "callable",
    "callable_name",
    "callable_module",
    "callable_path",
    "name",
    "path",
    "options",
];

fn preprocess_step(table: &toml::Table) -> Result<PreprocessStep, CompileError> {
    let get = |key: &str| table.get(key).and_then(toml::Value::as_str);

    let callable = if let Some(name) = get("callable_name") {
        match (get("callable_module"), get("callable_path")) {
            (Some(_), Some(_)) => {
                return Err(CompileError::CallableResolution {
                    detail: "provide either callable_module or callable_path, not both".into(),
                })
            }
            (Some(module), None) => CallableDescriptor {
                name: name.to_owned(),
                source: CallableSource::Module(module.to_owned()),
            },
            (None, Some(path)) => CallableDescriptor {
                name: name.to_owned(),
                source: CallableSource::Path(path.into()),
            },
            (None, None) => {
                return Err(CompileError::CallableResolution {
                    detail: "callable_name requires callable_module or callable_path".into(),
                })
            }
        }
    } else if let Some(reference) = get("callable").or_else(|| get("name")).or_else(|| get("path"))
    {
        legacy_descriptor(reference)?
    } else if table.len() == 1 {
        // Single-entry shorthand: `{ "pkg.mod:func" = { ...options } }`.
        let (reference, options) = table.iter().next().unwrap();
        let descriptor = legacy_descriptor(reference)?;
        let options = match options {
            toml::Value::Table(table) => table.clone().into_iter().collect(),
            _ => TomlMap::default(),
        };
        return Ok(PreprocessStep {
            callable: descriptor,
            options,
        });
    } else {
        return Err(CompileError::CallableResolution {
            detail: "preprocess step is missing a callable reference".into(),
        });
    };

    let mut options: TomlMap = table
        .iter()
        .filter(|(key, _)| !RESERVED_STEP_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if let Some(toml::Value::Table(extra)) = table.get("options") {
        options.extend(extra.clone());
    }

    Ok(PreprocessStep { callable, options })
}

/// Parse legacy `pkg.mod:func` / `pkg.mod.func` / `plugins/mod.py:func`
/// references into a descriptor.
fn legacy_descriptor(reference: &str) -> Result<CallableDescriptor, CompileError> {
    let missing = || CompileError::CallableResolution {
        detail: format!(
            "callable reference '{reference}' must include a module and attribute separated by ':' or '.'"
        ),
    };

    if let Some((source, attr)) = reference.rsplit_once(':') {
        let attr = attr.trim();
        let source = source.trim();
        if attr.is_empty() || source.is_empty() {
            return Err(missing());
        }

        let looks_like_path =
            source.ends_with(".py") || source.contains('/') || source.contains('\\');

        let source = match looks_like_path {
            true => CallableSource::Path(source.into()),
            false => CallableSource::Module(source.to_owned()),
        };

        return Ok(CallableDescriptor {
            name: attr.to_owned(),
            source,
        });
    }

    if let Some((module, attr)) = reference.rsplit_once('.') {
        let attr = attr.trim();
        if attr.is_empty() || module.trim().is_empty() {
            return Err(missing());
        }

        return Ok(CallableDescriptor {
            name: attr.to_owned(),
            source: CallableSource::Module(module.trim().to_owned()),
        });
    }

    Err(missing())
}

fn build_uses(value: Option<&toml::Value>) -> Result<Vec<RouteUse>, CompileError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };

    let items = value.as_array().ok_or_else(|| CompileError::Metadata {
        detail: "uses must be an array of tables".into(),
    })?;

    items
        .iter()
        .map(|item| {
            let table = item.as_table().ok_or_else(|| CompileError::Metadata {
                detail: "uses entries must be tables".into(),
            })?;

            let field = |key: &str| {
                table
                    .get(key)
                    .and_then(toml::Value::as_str)
                    .map(str::to_owned)
                    .ok_or_else(|| CompileError::Metadata {
                        detail: format!("uses entry is missing '{key}'"),
                    })
            };

            let mode = match table.get("mode").and_then(toml::Value::as_str) {
                Some("relation") | None => UseMode::Relation,
                Some("parquet_path") => UseMode::ParquetPath,
                Some(other) => {
                    return Err(CompileError::Metadata {
                        detail: format!("unsupported use mode '{other}'"),
                    })
                }
            };

            let args = match table.get("args") {
                Some(toml::Value::Table(args)) => {
                    args.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                }
                _ => BTreeMap::new(),
            };

            Ok(RouteUse {
                alias: field("alias")?,
                call: field("call")?,
                mode,
                args,
            })
        })
        .collect()
}

fn build_overrides(value: Option<&toml::Value>) -> Result<Option<OverridesSettings>, CompileError> {
    let Some(value) = value else {
        return Ok(None);
    };

    let table = value.as_table().ok_or_else(|| CompileError::Metadata {
        detail: "overrides must be a table".into(),
    })?;

    let key_columns = directives::normalize_string_list(table.get("key_columns"));
    if key_columns.is_empty() {
        return Err(CompileError::Metadata {
            detail: "overrides must declare key_columns".into(),
        });
    }

    Ok(Some(OverridesSettings {
        key_columns,
        allowed: directives::normalize_string_list(table.get("allowed")),
    }))
}

fn build_append(value: Option<&toml::Value>) -> Result<Option<AppendSettings>, CompileError> {
    let Some(value) = value else {
        return Ok(None);
    };

    let table = value.as_table().ok_or_else(|| CompileError::Metadata {
        detail: "append must be a table".into(),
    })?;

    Ok(Some(AppendSettings {
        columns: directives::normalize_string_list(table.get("columns")),
        destination: string_field(table, "destination"),
    }))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
