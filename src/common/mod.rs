//! Types, functions, constants and other items that are globally relevant
//! throughout the mallard codebase.

mod args;
mod config;
mod context;

use std::net::IpAddr;

pub use args::*;
pub use config::*;
pub use context::*;
use once_cell::sync::Lazy;

use crate::prelude::*;

pub const CONFIG_FILENAME: &str = "mallard.toml";

pub const DEFAULT_ROUTES_DIR: &str = "routes/";
pub const DEFAULT_BUILD_DIR: &str = ".mallard/compiled/";

/// Layout under the storage root.
pub const STORAGE_CACHE_DIR: &str = "cache";
pub const STORAGE_RUNTIME_DIR: &str = "runtime";
pub const META_DB_FILE: &str = "runtime/meta.sqlite3";
pub const APPENDS_DIR: &str = "runtime/appends";

/// The number of threads available on the system.
/// *Defaults to 1 if the true value cannot be determined.*
pub static THREADS: Lazy<u16> = Lazy::new(|| match std::thread::available_parallelism() {
    Ok(num) => num.get() as u16,
    Err(e) => {
        warn!("Couldn't determine available parallelism (error: {e}) - defaulting to 1 thread.");
        1
    }
});

/// The request-scoped facts the core consumes: who is asking, from where,
/// with which client. The HTTP layer fills this in; programmatic callers may
/// pass an empty one.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub user_agent: Option<String>,
    pub remote_ip: Option<IpAddr>,
    pub user: Option<CurrentUser>,
}

/// The abstract "current user" contract the auth adapters fulfil.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub email: String,
    pub email_hash: String,
    pub display_name: Option<String>,
}
