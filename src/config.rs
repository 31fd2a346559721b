//! Process-wide configuration, loaded once at startup and never reloaded.
//!
//! Defaults mirror the original chunked-file engine's constants; any
//! of them can be overridden either by a TOML file or by a `FRAGFS_*`
//! environment variable, the latter taking precedence.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_chunk_size() -> u64 {
    20_000_000
}

fn default_gc_delay_secs() -> u64 {
    4
}

fn default_ram_ttl_secs() -> u64 {
    1_200
}

fn default_file_ttl_secs() -> u64 {
    345_600
}

fn default_files_update_secs() -> u64 {
    5
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/tmp/fragfs")
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2379".to_string()]
}

fn default_remote_base_url() -> String {
    "https://api.example.com".to_string()
}

/// The number of concurrent downloads the remote blob client may have
/// in flight. Fixed by the spec, not user-configurable.
pub const DOWNLOAD_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_gc_delay_secs")]
    pub gc_delay_secs: u64,
    #[serde(default = "default_ram_ttl_secs")]
    pub ram_ttl_secs: u64,
    #[serde(default = "default_file_ttl_secs")]
    pub file_ttl_secs: u64,
    #[serde(default = "default_files_update_secs")]
    pub files_update_secs: u64,
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default = "default_etcd_endpoints")]
    pub etcd_endpoints: Vec<String>,
    #[serde(default = "default_remote_base_url")]
    pub remote_base_url: String,
    #[serde(default)]
    pub remote_token: String,
    #[serde(default)]
    pub remote_bucket: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chunk_size: default_chunk_size(),
            gc_delay_secs: default_gc_delay_secs(),
            ram_ttl_secs: default_ram_ttl_secs(),
            file_ttl_secs: default_file_ttl_secs(),
            files_update_secs: default_files_update_secs(),
            tmp_dir: default_tmp_dir(),
            etcd_endpoints: default_etcd_endpoints(),
            remote_base_url: default_remote_base_url(),
            remote_token: String::new(),
            remote_bucket: String::new(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `FRAGFS_*` env overrides.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file `{}`", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file `{}`", path.display()))?
            }
            None => Config::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FRAGFS_CHUNK_SIZE") {
            if let Ok(v) = v.parse() {
                self.chunk_size = v;
            }
        }
        if let Ok(v) = std::env::var("FRAGFS_GC_DELAY") {
            if let Ok(v) = v.parse() {
                self.gc_delay_secs = v;
            }
        }
        if let Ok(v) = std::env::var("FRAGFS_RAM_TTL") {
            if let Ok(v) = v.parse() {
                self.ram_ttl_secs = v;
            }
        }
        if let Ok(v) = std::env::var("FRAGFS_FILE_TTL") {
            if let Ok(v) = v.parse() {
                self.file_ttl_secs = v;
            }
        }
        if let Ok(v) = std::env::var("FRAGFS_FILES_UPDATE") {
            if let Ok(v) = v.parse() {
                self.files_update_secs = v;
            }
        }
        if let Ok(v) = std::env::var("FRAGFS_TMP_DIR") {
            self.tmp_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FRAGFS_ETCD_ENDPOINTS") {
            self.etcd_endpoints = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("FRAGFS_REMOTE_BASE_URL") {
            self.remote_base_url = v;
        }
        if let Ok(v) = std::env::var("FRAGFS_REMOTE_TOKEN") {
            self.remote_token = v;
        }
        if let Ok(v) = std::env::var("FRAGFS_REMOTE_BUCKET") {
            self.remote_bucket = v;
        }
    }

    pub fn gc_delay(&self) -> Duration {
        Duration::from_secs(self.gc_delay_secs)
    }

    pub fn ram_ttl(&self) -> Duration {
        Duration::from_secs(self.ram_ttl_secs)
    }

    pub fn file_ttl(&self) -> Duration {
        Duration::from_secs(self.file_ttl_secs)
    }

    pub fn files_update_interval(&self) -> Duration {
        Duration::from_secs(self.files_update_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 20_000_000);
        assert_eq!(config.gc_delay_secs, 4);
        assert_eq!(config.ram_ttl_secs, 1_200);
        assert_eq!(config.file_ttl_secs, 345_600);
        assert_eq!(config.files_update_secs, 5);
    }
}
