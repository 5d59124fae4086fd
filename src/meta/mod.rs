//! The meta store: a single SQLite database under
//! `<storage>/runtime/meta.sqlite3` holding overrides, shares and sessions.
//! The domain stores hold no state beyond a handle to this store.

mod appends;
mod overrides;
mod sessions;
mod shares;

use std::net::IpAddr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

pub use appends::AppendStore;
pub use overrides::{compute_row_key_from_values, OverlayStore, OverrideRecord};
use rusqlite::Connection;
pub use sessions::{SessionRecord, SessionStore};
use sha2::{Digest, Sha256};
pub use shares::{CreatedShare, ShareRecord, ShareStore};

use crate::error::ExecutionError;
use crate::prelude::*;

pub const META_UP: &str = include_str!("sql/meta_up.sql");
pub const META_DOWN: &str = include_str!("sql/meta_down.sql");

/// Shared SQLite-backed persistence for the overlay, share and session
/// stores. WAL journal mode; connections come from a small lazy pool.
#[derive(Debug)]
pub struct MetaStore {
    pool: Arc<Pool>,
}

impl MetaStore {
    /// Open (creating if necessary) the meta database under `storage_root`.
    pub fn open(storage_root: &Path) -> Result<Self, ExecutionError> {
        let path = storage_root.join(crate::common::META_DB_FILE);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        set_pragmas(&conn)?;
        conn.execute_batch(META_UP)?;

        let pool = Pool::open(path, *crate::common::THREADS as usize);
        Ok(Self { pool })
    }

    /// Acquire a pooled connection, creating a new one if the pool is empty.
    pub fn get(&self) -> Result<PoolConnection, ExecutionError> {
        self.pool.get()
    }
}

fn set_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    // WAL allows reads concurrent with writes; NORMAL synchronisation is
    // safe under WAL and avoids a fsync per transaction.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// A shareable, threadsafe SQLite connection pool.
///
/// New pools hold no connections; they are created lazily as needed, and a
/// pool can never be "exhausted" - excess connections are simply dropped
/// when put back.
#[derive(Debug)]
pub struct Pool {
    idle: Mutex<Vec<Connection>>,
    capacity: usize,
    loopback: Weak<Self>,
    path: PathBuf,
}

impl Pool {
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|loopback| Self {
            idle: Mutex::new(Vec::new()),
            capacity,
            loopback: loopback.clone(),
            path: path.into(),
        })
    }

    pub fn get(&self) -> Result<PoolConnection, ExecutionError> {
        let pooled = self
            .idle
            .lock()
            .expect("Connection pool should not be poisoned.")
            .pop();

        let connection = match pooled {
            Some(conn) => conn,
            None => self.make_new()?,
        };

        Ok(PoolConnection {
            parent: self.loopback.clone(),
            connection: Some(connection),
        })
    }

    fn make_new(&self) -> Result<Connection, ExecutionError> {
        let conn = Connection::open(&self.path)?;
        set_pragmas(&conn)?;
        Ok(conn)
    }

    fn put_back(&self, conn: Connection) {
        let mut idle = self
            .idle
            .lock()
            .expect("Connection pool should not be poisoned.");

        if idle.len() < self.capacity {
            idle.push(conn);
        }
    }
}

/// Smart wrapper for a pooled [`Connection`]; returns itself to the parent
/// pool on drop.
pub struct PoolConnection {
    parent: Weak<Pool>,
    connection: Option<Connection>,
}

impl Deref for PoolConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().unwrap()
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        let conn = self.connection.take().unwrap();

        match self.parent.upgrade() {
            Some(pool) => pool.put_back(conn),
            None => {
                warn!("Parent pool is gone - closing connection outright.");
            }
        }
    }
}

/// Hex-encoded SHA-256, the storage discipline for every token and email.
pub fn sha256_hex(text: &str) -> String {
    use std::fmt::Write;

    let digest = Sha256::digest(text.as_bytes());

    digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

/// The binding form of a client address: first three IPv4 octets or first
/// four IPv6 hextets.
pub fn ip_prefix(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!("{}.{}.{}", octets[0], octets[1], octets[2])
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            format!(
                "{:x}:{:x}:{:x}:{:x}",
                segments[0], segments[1], segments[2], segments[3]
            )
        }
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> (tempfile::TempDir, Arc<MetaStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = MetaStore::open(dir.path()).unwrap();
    (dir, Arc::new(store))
}
