//! Mount configuration.
//!
//! Values load once (TOML or defaults) and are treated as read-only for the
//! lifetime of the mount.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

fn default_chunk_size() -> u64 {
    1 << 22
}

fn default_chunk_timeout_secs() -> u64 {
    60
}

fn default_cache_budget_bytes() -> u64 {
    20 * (1 << 30)
}

fn default_max_connections() -> u8 {
    20
}

fn default_client_pool_size() -> usize {
    20
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_conn_timeout_ms() -> u64 {
    5_000
}

/// Remote-mount connection settings shared by the packet client and server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub encryption_token: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u8,
    #[serde(default = "default_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub recv_timeout_ms: u64,
    #[serde(default = "default_conn_timeout_ms")]
    pub conn_timeout_ms: u64,
    #[serde(default = "default_client_pool_size")]
    pub client_pool_size: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 20_000,
            encryption_token: String::new(),
            max_connections: default_max_connections(),
            send_timeout_ms: default_timeout_ms(),
            recv_timeout_ms: default_timeout_ms(),
            conn_timeout_ms: default_conn_timeout_ms(),
            client_pool_size: default_client_pool_size(),
        }
    }
}

/// Effective mount settings the core consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    #[serde(default = "default_cache_budget_bytes")]
    pub cache_budget_bytes: u64,
    /// Power of two, at least 4096.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub forced_uid: Option<u32>,
    #[serde(default)]
    pub forced_gid: Option<u32>,
    #[serde(default)]
    pub forced_umask: Option<u32>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            cache_dir: PathBuf::from("./cache"),
            cache_budget_bytes: default_cache_budget_bytes(),
            chunk_size: default_chunk_size(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            remote: RemoteConfig::default(),
            forced_uid: None,
            forced_gid: None,
            forced_umask: None,
        }
    }
}

impl MountConfig {
    /// Parses a TOML document and validates the chunk geometry.
    pub fn from_toml_str(raw: &str) -> ApiResult<Self> {
        let cfg: MountConfig = toml::from_str(raw).map_err(|_| ApiError::InvalidOperation)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> ApiResult<()> {
        if self.chunk_size < 4096 || !self.chunk_size.is_power_of_two() {
            return Err(ApiError::InvalidOperation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MountConfig;
    use crate::error::ApiError;

    #[test]
    fn parses_minimal_document() {
        let cfg = MountConfig::from_toml_str(
            r#"
            data_dir = "/tmp/data"
            cache_dir = "/tmp/cache"

            [remote]
            host = "10.0.0.2"
            port = 20001
            encryption_token = "secret"
            "#,
        )
        .expect("parse config");
        assert_eq!(cfg.remote.port, 20001);
        assert_eq!(cfg.chunk_size, 1 << 22);
        assert_eq!(cfg.remote.max_connections, 20);
    }

    #[test]
    fn rejects_bad_chunk_size() {
        let res = MountConfig::from_toml_str(
            r#"
            data_dir = "/tmp/data"
            cache_dir = "/tmp/cache"
            chunk_size = 1000
            "#,
        );
        assert_eq!(res.err(), Some(ApiError::InvalidOperation));
    }
}
