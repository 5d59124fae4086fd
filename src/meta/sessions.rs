//! The session store backing the pseudo-auth "current user" contract.
//! Same hashing discipline as shares: only the token's SHA-256 is stored.

use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use exemplar::Model;
use rand::RngCore;
use rusqlite::named_params;
use serde::{Deserialize, Serialize};

use super::{ip_prefix, sha256_hex, MetaStore};
use crate::common::{CurrentUser, RequestMeta};
use crate::error::ExecutionError;

#[derive(Debug, Clone, PartialEq, Eq, Model, Serialize, Deserialize)]
#[table("sessions")]
pub struct SessionRecord {
    pub token_hash: String,
    pub email: String,
    pub email_hash: String,
    pub display_name: Option<String>,
    pub created_at: String,
    pub expires_at: String,
    pub user_agent: Option<String>,
    pub ip_prefix: Option<String>,
}

impl SessionRecord {
    pub fn user(&self) -> CurrentUser {
        CurrentUser {
            email: self.email.clone(),
            email_hash: self.email_hash.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

pub struct SessionStore {
    meta: Arc<MetaStore>,
}

impl SessionStore {
    pub fn new(meta: Arc<MetaStore>) -> Self {
        Self { meta }
    }

    /// Open a session for `email`, returning the cleartext token once.
    pub fn create(
        &self,
        email: &str,
        display_name: Option<&str>,
        ttl: Duration,
        request: &RequestMeta,
    ) -> Result<(String, SessionRecord), ExecutionError> {
        let mut raw = [0_u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);

        let now = Utc::now();

        let record = SessionRecord {
            token_hash: sha256_hex(&token),
            email: email.to_owned(),
            email_hash: sha256_hex(email),
            display_name: display_name.map(str::to_owned),
            created_at: now.to_rfc3339(),
            expires_at: (now + ttl).to_rfc3339(),
            user_agent: request.user_agent.clone(),
            ip_prefix: request.remote_ip.as_ref().map(ip_prefix),
        };

        let conn = self.meta.get()?;
        record.insert(&conn)?;

        Ok((token, record))
    }

    /// Resolve a token to its user. Expired sessions are deleted on sight.
    pub fn resolve(&self, token: &str) -> Result<Option<CurrentUser>, ExecutionError> {
        let token_hash = sha256_hex(token);
        let conn = self.meta.get()?;

        let record = conn
            .query_row(
                "SELECT * FROM sessions WHERE token_hash = :hash",
                named_params! { ":hash": token_hash },
                SessionRecord::from_row,
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some(record) = record else {
            return Ok(None);
        };

        let expires_at = DateTime::parse_from_rfc3339(&record.expires_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| ExecutionError::Internal {
                detail: format!("malformed stored timestamp '{}'", record.expires_at),
            })?;

        if expires_at <= Utc::now() {
            conn.execute(
                "DELETE FROM sessions WHERE token_hash = :hash",
                named_params! { ":hash": token_hash },
            )?;
            return Ok(None);
        }

        Ok(Some(record.user()))
    }

    /// Log a session out; returns whether one existed.
    pub fn delete(&self, token: &str) -> Result<bool, ExecutionError> {
        let conn = self.meta.get()?;

        let removed = conn.execute(
            "DELETE FROM sessions WHERE token_hash = :hash",
            named_params! { ":hash": sha256_hex(token) },
        )?;

        Ok(removed > 0)
    }
}
