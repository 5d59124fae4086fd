//! The HTTP layer: a thin axum adapter over the programmatic core.
//!
//! Every compiled route is mounted at its authored path (and addressable
//! under `/q/<id>`), next to the override, append and share endpoints. All
//! blocking core work runs on the blocking pool.

mod error;
mod format;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use ahash::AHashMap;
use axum::extract::{ConnectInfo, Path as UrlPath, Query, State};
use axum::http::{HeaderMap, Method as HttpMethod, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Duration;
use error::ApiError;

use crate::common::RequestMeta;
use crate::error::ExecutionError;
use crate::exec::{ExecOptions, RouteExecutor};
use crate::meta::{AppendStore, OverlayStore, SessionStore, ShareStore};
use crate::prelude::*;
use crate::route::{Method, ParamMap, ParamValue, RouteDefinition};

type Server = Arc<InnerServer>;

/// Paths the API claims for itself; route authors cannot mount under them.
const RESERVED_PREFIXES: &[&str] = &["/routes", "/share", "/q", "/session"];

pub struct InnerServer {
    pub executor: Arc<RouteExecutor>,
    pub overlays: Arc<OverlayStore>,
    pub shares: Arc<ShareStore>,
    pub sessions: Arc<SessionStore>,
    pub appends: Arc<AppendStore>,
    pub ctx: Context,
    /// Authored path -> route id, for routes mounted at their own path.
    paths: AHashMap<String, String>,
}

impl InnerServer {
    pub fn new(
        ctx: &Context,
        executor: Arc<RouteExecutor>,
        overlays: Arc<OverlayStore>,
        shares: Arc<ShareStore>,
        sessions: Arc<SessionStore>,
        appends: Arc<AppendStore>,
    ) -> Server {
        let mut paths = AHashMap::new();

        for route in executor.routes() {
            let path = route.path.clone();

            // Capture syntax is not supported in authored paths; such routes
            // stay reachable through /q/<id>.
            if !path.starts_with('/')
                || path.contains(':')
                || path.contains('*')
                || path.contains('{')
                || RESERVED_PREFIXES
                    .iter()
                    .any(|prefix| path == *prefix || path.starts_with(&format!("{prefix}/")))
            {
                warn!(
                    "Route '{}' path {path:?} is reserved or malformed - reachable as /q/{} only.",
                    route.id, route.id
                );
                continue;
            }

            if paths.insert(path.clone(), route.id.clone()).is_some() {
                warn!("Multiple routes claim path {path:?} - keeping the last one.");
            }
        }

        Arc::new(Self {
            executor,
            overlays,
            shares,
            sessions,
            appends,
            ctx: ctx.clone(),
            paths,
        })
    }

    /// Bootstraps the Tokio runtime and starts the internal `async` serving code.
    pub fn serve(self: &Server) -> Result<()> {
        info!("Starting Tokio runtime.");

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("Failed to start Tokio runtime.")
            .block_on(self._serve())
    }

    async fn _serve(self: &Server) -> Result<()> {
        let mut app = Router::new()
            .route("/routes", get(list_routes))
            .route("/routes/:route_id/overrides", get(list_overrides).post(save_override))
            .route("/routes/:route_id/append", post(append_route))
            .route("/routes/:route_id/share", post(create_share))
            .route("/share/:token", get(resolve_share))
            .route("/q/:route_id", get(run_by_id).post(run_by_id));

        for path in self.paths.keys() {
            app = app.route(path, get(run_by_path).post(run_by_path));
        }

        let app = app.with_state(self.clone());

        info!("Starting webserver.");

        let ip = self.ctx.server.address.parse()?;
        let port = self.ctx.server.port;

        let addr = SocketAddr::new(ip, port);

        axum::Server::bind(&addr)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        Ok(())
    }
}

fn request_meta(server: &Server, headers: &HeaderMap, addr: &SocketAddr) -> RequestMeta {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let user = headers
        .get("x-mallard-session")
        .and_then(|value| value.to_str().ok())
        .and_then(|token| server.sessions.resolve(token).ok().flatten());

    RequestMeta {
        user_agent,
        remote_ip: Some(addr.ip()),
        user,
    }
}

/// Pull windowing and format controls out of the query string, leaving the
/// rest as route parameters.
fn split_query(
    mut query: HashMap<String, String>,
) -> Result<(ParamMap, String, ExecOptions, Option<Vec<String>>), ExecutionError> {
    let format = format::validate_format(&query.remove("format").unwrap_or_else(|| "json".into()))?;

    let parse_usize = |name: &str, value: Option<String>| -> Result<Option<usize>, ExecutionError> {
        match value {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<usize>().map(Some).map_err(|_| {
                ExecutionError::InvalidParameter {
                    name: name.to_owned(),
                    detail: format!("'{raw}' is not a non-negative integer"),
                }
            }),
        }
    };

    let offset = parse_usize("offset", query.remove("offset"))?.unwrap_or(0);
    let limit = parse_usize("limit", query.remove("limit"))?;

    let columns = query.remove("columns").map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>()
    });

    let params: ParamMap = query
        .into_iter()
        .map(|(key, value)| (key, ParamValue::Str(value)))
        .collect();

    Ok((params, format, ExecOptions::window(offset, limit), columns))
}

async fn execute_and_render(
    server: Server,
    route_id: String,
    query: HashMap<String, String>,
    body: Option<serde_json::Value>,
    meta: RequestMeta,
    http_method: HttpMethod,
) -> Result<Response, ApiError> {
    let route = server.executor.route(&route_id)?;

    let allowed = match http_method {
        HttpMethod::GET => route.allows_method(Method::Get),
        HttpMethod::POST => route.allows_method(Method::Post),
        _ => false,
    };

    if !allowed {
        return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response());
    }

    let (mut params, format, opts, columns) = split_query(query)?;

    if let Some(serde_json::Value::Object(object)) = body {
        for (key, value) in object {
            params.insert(key, ParamValue::from_json(&value));
        }
    }

    let rendered = tokio::task::spawn_blocking(move || {
        let mut result = server
            .executor
            .execute(&route.id, &params, opts, Some(&meta))?;

        if let Some(columns) = columns {
            result.table = result.table.select_columns(&columns)?;
        }

        format::render(&route, &format, &result, opts)
    })
    .await
    .map_err(|join| ExecutionError::Internal {
        detail: join.to_string(),
    })??;

    Ok(rendered)
}

async fn run_by_id(
    State(server): State<Server>,
    UrlPath(route_id): UrlPath<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: HttpMethod,
    body: Option<Json<serde_json::Value>>,
) -> Result<Response, ApiError> {
    let meta = request_meta(&server, &headers, &addr);
    execute_and_render(
        server,
        route_id,
        query,
        body.map(|Json(value)| value),
        meta,
        method,
    )
    .await
}

async fn run_by_path(
    State(server): State<Server>,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: HttpMethod,
    body: Option<Json<serde_json::Value>>,
) -> Result<Response, ApiError> {
    let route_id = server
        .paths
        .get(uri.path())
        .cloned()
        .ok_or(ExecutionError::UnknownRoute {
            id: uri.path().to_owned(),
        })?;

    let meta = request_meta(&server, &headers, &addr);
    execute_and_render(
        server,
        route_id,
        query,
        body.map(|Json(value)| value),
        meta,
        method,
    )
    .await
}

async fn list_routes(State(server): State<Server>) -> Json<serde_json::Value> {
    let mut routes: Vec<serde_json::Value> = server
        .executor
        .routes()
        .map(|route| route_summary(route))
        .collect();

    routes.sort_by_key(|entry| entry["id"].as_str().map(str::to_owned));

    Json(serde_json::json!({ "routes": routes }))
}

fn route_summary(route: &RouteDefinition) -> serde_json::Value {
    let params: Vec<serde_json::Value> = route
        .params
        .iter()
        .map(|spec| {
            serde_json::json!({
                "name": spec.name,
                "type": spec.ty.name(),
                "required": spec.required,
                "description": spec.description,
            })
        })
        .collect();

    serde_json::json!({
        "id": route.id,
        "path": route.path,
        "methods": route.methods,
        "params": params,
        "cached": route.caches_pages(),
        "overrides": route.overrides,
        "append": route.append,
    })
}

async fn list_overrides(
    State(server): State<Server>,
    UrlPath(route_id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let route = server.executor.route(&route_id)?;

    let records = tokio::task::spawn_blocking(move || server.overlays.list_for_route(&route.id))
        .await
        .map_err(|join| ExecutionError::Internal {
            detail: join.to_string(),
        })??;

    Ok(Json(serde_json::json!({
        "route_id": route_id,
        "overrides": records,
    })))
}

#[derive(serde::Deserialize)]
struct OverridePayload {
    column: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    row_key: Option<String>,
    #[serde(default)]
    key: Option<HashMap<String, String>>,
}

async fn save_override(
    State(server): State<Server>,
    UrlPath(route_id): UrlPath<String>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<OverridePayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let route = server.executor.route(&route_id)?;
    let meta = request_meta(&server, &headers, &addr);

    let settings = route
        .overrides
        .clone()
        .ok_or_else(|| ExecutionError::InvalidParameter {
            name: "overrides".into(),
            detail: format!("route '{route_id}' does not support overrides"),
        })?;

    if !settings.allowed.is_empty() && !settings.allowed.contains(&payload.column) {
        return Err(ApiError(ExecutionError::ForbiddenOverride {
            column: payload.column,
        }));
    }

    let row_key = match (&payload.row_key, &payload.key) {
        (Some(row_key), _) => row_key.clone(),
        (None, Some(key)) => {
            let values: Vec<Option<String>> = settings
                .key_columns
                .iter()
                .map(|column| key.get(column).cloned())
                .collect();
            crate::meta::compute_row_key_from_values(&values)
        }
        (None, None) => {
            return Err(ApiError(ExecutionError::MissingParameter {
                name: "row_key".into(),
            }))
        }
    };

    let (author, author_user_id) = match &meta.user {
        Some(user) => (
            user.display_name.clone().or_else(|| Some(user.email.clone())),
            Some(user.email_hash.clone()),
        ),
        None => (None, None),
    };

    let record = tokio::task::spawn_blocking(move || {
        server.overlays.upsert(
            &route.id,
            &row_key,
            &payload.column,
            &payload.value,
            payload.reason.as_deref(),
            author.as_deref(),
            author_user_id.as_deref(),
        )
    })
    .await
    .map_err(|join| ExecutionError::Internal {
        detail: join.to_string(),
    })??;

    Ok(Json(serde_json::json!({ "override": record })))
}

async fn append_route(
    State(server): State<Server>,
    UrlPath(route_id): UrlPath<String>,
    Json(payload): Json<HashMap<String, serde_json::Value>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let route = server.executor.route(&route_id)?;

    if route.append.is_none() {
        return Err(ApiError(ExecutionError::UnknownRoute {
            id: format!("{route_id}/append"),
        }));
    }

    let values: std::collections::BTreeMap<String, String> = payload
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (key, text)
        })
        .collect();

    let path = tokio::task::spawn_blocking(move || server.appends.append(&route, &values))
        .await
        .map_err(|join| ExecutionError::Internal {
            detail: join.to_string(),
        })??;

    Ok(Json(serde_json::json!({
        "appended": true,
        "path": path.display().to_string(),
    })))
}

#[derive(serde::Deserialize, Default)]
struct SharePayload {
    #[serde(default)]
    params: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    ttl_minutes: Option<i64>,
    #[serde(default)]
    max_uses: Option<i64>,
}

async fn create_share(
    State(server): State<Server>,
    UrlPath(route_id): UrlPath<String>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Option<Json<SharePayload>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let route = server.executor.route(&route_id)?;
    let meta = request_meta(&server, &headers, &addr);
    let payload = body.map(|Json(payload)| payload).unwrap_or_default();

    let format =
        format::validate_format(payload.format.as_deref().unwrap_or("json"))?;

    let params: ParamMap = payload
        .params
        .unwrap_or_default()
        .iter()
        .map(|(key, value)| (key.clone(), ParamValue::from_json(value)))
        .collect();

    let share_cfg = &server.ctx.share;
    let ttl = Duration::minutes(payload.ttl_minutes.unwrap_or(share_cfg.ttl_minutes));
    let max_uses = payload.max_uses.unwrap_or(share_cfg.max_uses);
    let bind_user_agent = share_cfg.bind_user_agent;
    let bind_ip = share_cfg.bind_ip_prefix;
    let owner_hash = meta.user.as_ref().map(|user| user.email_hash.clone());

    let created = tokio::task::spawn_blocking(move || {
        server.shares.create(
            &route.id,
            &params,
            &format,
            owner_hash.as_deref(),
            bind_user_agent,
            bind_ip,
            ttl,
            max_uses,
            &meta,
        )
    })
    .await
    .map_err(|join| ExecutionError::Internal {
        detail: join.to_string(),
    })??;

    Ok(Json(serde_json::json!({
        "token": created.token,
        "url": format!("/share/{}", created.token),
        "route_id": created.record.route_id,
        "format": created.record.format,
        "expires_at": created.record.expires_at,
        "max_uses": created.record.max_uses,
    })))
}

async fn resolve_share(
    State(server): State<Server>,
    UrlPath(token): UrlPath<String>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    let meta = request_meta(&server, &headers, &addr);

    let record = {
        let server = server.clone();
        let meta = meta.clone();
        tokio::task::spawn_blocking(move || server.shares.consume(&token, &meta))
            .await
            .map_err(|join| ExecutionError::Internal {
                detail: join.to_string(),
            })??
    };

    let route = server.executor.route(&record.route_id)?;
    let params = record.params();
    let opts = ExecOptions::all();

    let rendered = tokio::task::spawn_blocking(move || {
        let result = server
            .executor
            .execute(&route.id, &params, opts, Some(&meta))?;

        format::render(&route, &record.format, &result, opts)
    })
    .await
    .map_err(|join| ExecutionError::Internal {
        detail: join.to_string(),
    })??;

    Ok(rendered)
}
