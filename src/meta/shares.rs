//! The share store: time-limited, optionally UA/IP-bound tokens granting
//! read access to a parameterised execution of a route.
//!
//! Tokens are stored only as SHA-256 hashes; the cleartext token is returned
//! exactly once, on creation.

use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use exemplar::Model;
use rand::RngCore;
use rusqlite::named_params;
use serde::{Deserialize, Serialize};

use super::{ip_prefix, sha256_hex, MetaStore};
use crate::common::RequestMeta;
use crate::error::ExecutionError;
use crate::route::{ParamMap, ParamValue};

#[derive(Debug, Clone, PartialEq, Eq, Model, Serialize, Deserialize)]
#[table("shares")]
pub struct ShareRecord {
    pub token_hash: String,
    pub route_id: String,
    /// Canonical (sorted-key) JSON encoding of the shared parameters.
    pub params_json: String,
    pub format: String,
    pub created_at: String,
    pub expires_at: String,
    pub created_by_hash: Option<String>,
    pub user_agent_hash: Option<String>,
    pub ip_prefix: Option<String>,
    pub max_uses: i64,
    pub uses: i64,
}

impl ShareRecord {
    pub fn params(&self) -> ParamMap {
        let parsed: serde_json::Value =
            serde_json::from_str(&self.params_json).unwrap_or(serde_json::Value::Null);

        match parsed {
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), ParamValue::from_json(value)))
                .collect(),
            _ => ParamMap::new(),
        }
    }
}

/// A freshly created share: the one and only time the cleartext token is
/// visible.
pub struct CreatedShare {
    pub token: String,
    pub record: ShareRecord,
}

pub struct ShareStore {
    meta: Arc<MetaStore>,
}

impl ShareStore {
    pub fn new(meta: Arc<MetaStore>) -> Self {
        Self { meta }
    }

    /// Issue a token for `route_id` with the given parameters and lifetime.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        route_id: &str,
        params: &ParamMap,
        format: &str,
        created_by_hash: Option<&str>,
        bind_user_agent: bool,
        bind_ip: bool,
        ttl: Duration,
        max_uses: i64,
        request: &RequestMeta,
    ) -> Result<CreatedShare, ExecutionError> {
        let mut raw = [0_u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);
        let token_hash = sha256_hex(&token);

        let now = Utc::now();
        let expires_at = now + ttl;

        let user_agent_hash = match bind_user_agent {
            true => request.user_agent.as_deref().map(sha256_hex),
            false => None,
        };
        let bound_prefix = match bind_ip {
            true => request.remote_ip.as_ref().map(ip_prefix),
            false => None,
        };

        let record = ShareRecord {
            token_hash,
            route_id: route_id.to_owned(),
            params_json: canonical_params_json(params),
            format: format.to_owned(),
            created_at: now.to_rfc3339(),
            expires_at: expires_at.to_rfc3339(),
            created_by_hash: created_by_hash.map(str::to_owned),
            user_agent_hash,
            ip_prefix: bound_prefix,
            max_uses: max_uses.max(1),
            uses: 0,
        };

        let conn = self.meta.get()?;
        record.insert(&conn)?;

        Ok(CreatedShare { token, record })
    }

    /// Consume one use of a token, enforcing expiry, binding, and the use
    /// counter. Concurrent consumers of a single-use token see at most one
    /// success; an exhausted token keeps failing with `share_used`.
    pub fn consume(
        &self,
        token: &str,
        request: &RequestMeta,
    ) -> Result<ShareRecord, ExecutionError> {
        let token_hash = sha256_hex(token);
        let conn = self.meta.get()?;

        let record = conn
            .query_row(
                "SELECT * FROM shares WHERE token_hash = :hash",
                named_params! { ":hash": token_hash },
                ShareRecord::from_row,
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?
            .ok_or(ExecutionError::InvalidToken)?;

        let expires_at = parse_timestamp(&record.expires_at)?;
        if expires_at <= Utc::now() {
            conn.execute(
                "DELETE FROM shares WHERE token_hash = :hash",
                named_params! { ":hash": token_hash },
            )?;
            return Err(ExecutionError::ShareExpired);
        }

        if let Some(stored) = &record.user_agent_hash {
            let presented = request.user_agent.as_deref().map(sha256_hex);
            if presented.as_deref() != Some(stored.as_str()) {
                return Err(ExecutionError::UserAgentMismatch);
            }
        }

        if let Some(stored) = &record.ip_prefix {
            let presented = request.remote_ip.as_ref().map(ip_prefix);
            if presented.as_deref() != Some(stored.as_str()) {
                return Err(ExecutionError::IpPrefixMismatch);
            }
        }

        // The conditional UPDATE serialises racing consumers on the row.
        let updated = conn.execute(
            "UPDATE shares SET uses = uses + 1
             WHERE token_hash = :hash AND uses < max_uses",
            named_params! { ":hash": token_hash },
        )?;

        if updated == 0 {
            return Err(ExecutionError::ShareUsed);
        }

        let record = conn.query_row(
            "SELECT * FROM shares WHERE token_hash = :hash",
            named_params! { ":hash": token_hash },
            ShareRecord::from_row,
        )?;

        Ok(record)
    }
}

/// Sorted-key JSON for the stored parameter map.
fn canonical_params_json(params: &ParamMap) -> String {
    let object: serde_json::Map<String, serde_json::Value> = params
        .iter()
        .map(|(key, value)| (key.clone(), value.to_json()))
        .collect();

    serde_json::Value::Object(object).to_string()
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, ExecutionError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ExecutionError::Internal {
            detail: format!("malformed stored timestamp '{text}'"),
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::meta::test_store;

    fn request(user_agent: Option<&str>, ip: Option<&str>) -> RequestMeta {
        RequestMeta {
            user_agent: user_agent.map(str::to_owned),
            remote_ip: ip.map(|ip| ip.parse().unwrap()),
            user: None,
        }
    }

    fn params() -> ParamMap {
        let mut params = ParamMap::new();
        params.insert("name".into(), ParamValue::Str("world".into()));
        params
    }

    #[test]
    fn single_use_token_lifecycle() {
        let (_dir, meta) = test_store();
        let store = ShareStore::new(meta);
        let meta_request = request(Some("agent"), None);

        let created = store
            .create(
                "greet",
                &params(),
                "json",
                None,
                false,
                false,
                Duration::seconds(60),
                1,
                &meta_request,
            )
            .unwrap();

        let consumed = store.consume(&created.token, &meta_request).unwrap();
        assert_eq!(consumed.uses, 1);
        assert_eq!(consumed.route_id, "greet");
        assert_eq!(
            consumed.params().get("name"),
            Some(&ParamValue::Str("world".into()))
        );

        // Repeated consumption keeps failing the same way.
        for _ in 0..2 {
            let err = store.consume(&created.token, &meta_request).unwrap_err();
            assert_eq!(err.code(), "share_used");
        }
    }

    #[test]
    fn unknown_tokens_are_invalid() {
        let (_dir, meta) = test_store();
        let store = ShareStore::new(meta);

        let err = store
            .consume("not-a-token", &request(None, None))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_token");
    }

    #[test]
    fn expired_tokens_are_deleted_on_consume() {
        let (_dir, meta) = test_store();
        let store = ShareStore::new(meta);
        let meta_request = request(None, None);

        let created = store
            .create(
                "greet",
                &params(),
                "json",
                None,
                false,
                false,
                Duration::seconds(-1),
                1,
                &meta_request,
            )
            .unwrap();

        let err = store.consume(&created.token, &meta_request).unwrap_err();
        assert_eq!(err.code(), "share_expired");

        // The row is gone, so the token is now simply invalid.
        let err = store.consume(&created.token, &meta_request).unwrap_err();
        assert_eq!(err.code(), "invalid_token");
    }

    #[test]
    fn user_agent_binding() {
        let (_dir, meta) = test_store();
        let store = ShareStore::new(meta);

        let created = store
            .create(
                "greet",
                &params(),
                "json",
                None,
                true,
                false,
                Duration::seconds(60),
                1,
                &request(Some("firefox"), None),
            )
            .unwrap();

        let err = store
            .consume(&created.token, &request(Some("curl"), None))
            .unwrap_err();
        assert_eq!(err.code(), "user_agent_mismatch");

        let err = store
            .consume(&created.token, &request(None, None))
            .unwrap_err();
        assert_eq!(err.code(), "user_agent_mismatch");

        store
            .consume(&created.token, &request(Some("firefox"), None))
            .unwrap();
    }

    #[test]
    fn ip_prefix_binding() {
        let (_dir, meta) = test_store();
        let store = ShareStore::new(meta);

        let created = store
            .create(
                "greet",
                &params(),
                "json",
                None,
                false,
                true,
                Duration::seconds(60),
                1,
                &request(None, Some("10.1.2.3")),
            )
            .unwrap();

        // Same /24 consumes fine; a different network is rejected.
        let err = store
            .consume(&created.token, &request(None, Some("10.9.9.9")))
            .unwrap_err();
        assert_eq!(err.code(), "ip_prefix_mismatch");

        store
            .consume(&created.token, &request(None, Some("10.1.2.77")))
            .unwrap();
    }

    #[test]
    fn bounded_use_tokens() {
        let (_dir, meta) = test_store();
        let store = ShareStore::new(meta);
        let meta_request = request(None, None);

        let created = store
            .create(
                "greet",
                &params(),
                "json",
                None,
                false,
                false,
                Duration::seconds(60),
                3,
                &meta_request,
            )
            .unwrap();

        for expected in 1..=3 {
            let record = store.consume(&created.token, &meta_request).unwrap();
            assert_eq!(record.uses, expected);
        }

        let err = store.consume(&created.token, &meta_request).unwrap_err();
        assert_eq!(err.code(), "share_used");
    }

    #[test]
    fn params_json_is_canonical() {
        let mut forward = ParamMap::new();
        forward.insert("b".into(), ParamValue::Int(2));
        forward.insert("a".into(), ParamValue::Int(1));

        assert_eq!(canonical_params_json(&forward), r#"{"a":1,"b":2}"#);
    }
}
