//! The error taxonomy shared by the executor, the stores, and the HTTP edge.
//!
//! Every variant carries a stable string `code` that is part of the external
//! contract; the HTTP layer maps codes to status codes and decides how much
//! detail leaves the process.

use thiserror::Error;

/// A failure raised while executing a route or operating one of the stores.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("required parameter '{name}' was not supplied")]
    MissingParameter { name: String },

    #[error("parameter '{name}' is invalid: {detail}")]
    InvalidParameter { name: String, detail: String },

    #[error("column '{column}' cannot be overridden")]
    ForbiddenOverride { column: String },

    #[error("append is misconfigured: {detail}")]
    AppendMisconfigured { detail: String },

    #[error("circular dependency detected: {chain}")]
    CircularDependency { chain: String },

    #[error("{message}")]
    RouteExecution { message: String },

    #[error("preprocessor '{name}' failed: {detail}")]
    Preprocess { name: String, detail: String },

    #[error("cache for route '{route_id}' is corrupted: {detail}")]
    CacheCorrupted { route_id: String, detail: String },

    #[error("share token is not valid")]
    InvalidToken,

    #[error("share token has expired")]
    ShareExpired,

    #[error("share token has no remaining uses")]
    ShareUsed,

    #[error("share token was issued to a different user agent")]
    UserAgentMismatch,

    #[error("share token was issued from a different network")]
    IpPrefixMismatch,

    #[error("operation requires an authenticated user")]
    NotAuthenticated,

    #[error("no route with id '{id}'")]
    UnknownRoute { id: String },

    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl ExecutionError {
    /// The stable, observable error code for this failure.
    pub fn code(&self) -> &'static str {
        use ExecutionError::*;

        match self {
            MissingParameter { .. } => "missing_parameter",
            InvalidParameter { .. } => "invalid_parameter",
            ForbiddenOverride { .. } => "forbidden_override",
            AppendMisconfigured { .. } => "append_misconfigured",
            CircularDependency { .. } => "circular_dependency",
            RouteExecution { .. } => "route_execution_error",
            Preprocess { .. } => "preprocess_error",
            CacheCorrupted { .. } => "cache_corrupted",
            InvalidToken => "invalid_token",
            ShareExpired => "share_expired",
            ShareUsed => "share_used",
            UserAgentMismatch => "user_agent_mismatch",
            IpPrefixMismatch => "ip_prefix_mismatch",
            NotAuthenticated => "not_authenticated",
            UnknownRoute { .. } => "route_not_found",
            Internal { .. } => "internal_error",
        }
    }

    /// Whether the failure is the caller's fault. User errors are surfaced
    /// verbatim; everything else is presented as an opaque code.
    pub fn is_user(&self) -> bool {
        use ExecutionError::*;

        matches!(
            self,
            MissingParameter { .. }
                | InvalidParameter { .. }
                | ForbiddenOverride { .. }
                | InvalidToken
                | ShareExpired
                | ShareUsed
                | UserAgentMismatch
                | IpPrefixMismatch
                | NotAuthenticated
                | UnknownRoute { .. }
        )
    }
}

impl From<duckdb::Error> for ExecutionError {
    fn from(item: duckdb::Error) -> Self {
        ExecutionError::RouteExecution {
            message: item.to_string(),
        }
    }
}

impl From<rusqlite::Error> for ExecutionError {
    fn from(item: rusqlite::Error) -> Self {
        ExecutionError::Internal {
            detail: item.to_string(),
        }
    }
}

impl From<std::io::Error> for ExecutionError {
    fn from(item: std::io::Error) -> Self {
        ExecutionError::Internal {
            detail: item.to_string(),
        }
    }
}

/// A failure raised while compiling a route source pair.
///
/// Compile errors are terminal for the affected route; no partial output is
/// ever emitted.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("SQL references undeclared parameter '{name}'")]
    UnknownParameter { name: String },

    #[error("cache block must declare a non-empty order_by")]
    MissingOrderBy,

    #[error("preprocess step cannot be resolved: {detail}")]
    CallableResolution { detail: String },

    #[error("invalid metadata: {detail}")]
    Metadata { detail: String },

    #[error("malformed route source: {detail}")]
    Source { detail: String },

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CompileError {
    pub fn code(&self) -> &'static str {
        use CompileError::*;

        match self {
            UnknownParameter { .. } => "unknown_parameter",
            CallableResolution { .. } => "callable_resolution_error",
            _ => "route_compilation_error",
        }
    }
}
