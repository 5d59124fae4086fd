use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// Represents the contents of mallard's global configuration.
#[derive(Serialize, Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub share: Share,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub extra: HashMap<String, toml::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: Server::default(),
            cache: Cache::default(),
            share: Share::default(),
            auth: Auth::default(),
            extra: HashMap::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Server {
    pub address: String,
    pub port: u16,
    pub storage_root: PathBuf,
    pub routes_dir: PathBuf,
    pub build_dir: PathBuf,
}

impl Default for Server {
    fn default() -> Self {
        Server {
            address: String::from("127.0.0.1"),
            port: 8000,
            storage_root: PathBuf::from("storage"),
            routes_dir: PathBuf::from(super::DEFAULT_ROUTES_DIR),
            build_dir: PathBuf::from(super::DEFAULT_BUILD_DIR),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Cache {
    /// Soft page-size bound for routes that do not declare their own.
    pub rows_per_page: usize,
}

impl Default for Cache {
    fn default() -> Self {
        Cache {
            rows_per_page: 5000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Share {
    pub ttl_minutes: i64,
    pub max_uses: i64,
    pub bind_user_agent: bool,
    pub bind_ip_prefix: bool,
}

impl Default for Share {
    fn default() -> Self {
        Share {
            ttl_minutes: 60,
            max_uses: 1,
            bind_user_agent: false,
            bind_ip_prefix: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Auth {
    pub mode: String,
    pub session_ttl_minutes: i64,
    pub allowed_domains: Vec<String>,
}

impl Default for Auth {
    fn default() -> Self {
        Auth {
            mode: String::from("none"),
            session_ttl_minutes: 45,
            allowed_domains: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let toml_raw = match path.exists() {
            true => {
                std::fs::read_to_string(path)
                    .wrap_err("Could not read in configuration file.")
                    .suggestion("The configuration file was found, but couldn't be read - try checking your file permissions.")?
            },
            false => bail!("Configuration file not found.")
        };

        Ok(toml::from_str(&toml_raw)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = toml::from_str(
            r#"
                [server]
                port = 9999
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.address, "127.0.0.1");
        assert_eq!(config.cache.rows_per_page, 5000);
        assert_eq!(config.share.max_uses, 1);
        assert_eq!(config.auth.mode, "none");
    }
}
