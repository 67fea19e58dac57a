//! On-disk `configs.json` plus `DEVSWARM_*` environment overrides, in the
//! `config`-crate style the teacher's server binaries use.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "configs.json";
const ENV_PREFIX: &str = "DEVSWARM";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_addr: String,
    pub device_count: usize,
    pub throttle_ms: u64,
    pub data_dir: PathBuf,
    pub cloud_api_base: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:5683".to_string(),
            device_count: 1,
            throttle_ms: 0,
            data_dir: PathBuf::from("./devswarm-data"),
            cloud_api_base: "http://localhost:8080".to_string(),
        }
    }
}

impl Config {
    /// Loads `configs.json` from `dir` if present, then layers
    /// `DEVSWARM_*` environment variable overrides on top (e.g.
    /// `DEVSWARM_SERVER_ADDR`, `DEVSWARM_DEVICE_COUNT`).
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        let defaults = Config::default();

        let mut builder = config::Config::builder()
            .set_default("server_addr", defaults.server_addr.clone())?
            .set_default("device_count", defaults.device_count as i64)?
            .set_default("throttle_ms", defaults.throttle_ms as i64)?
            .set_default("data_dir", defaults.data_dir.to_string_lossy().to_string())?
            .set_default("cloud_api_base", defaults.cloud_api_base.clone())?;

        if path.exists() {
            builder = builder.add_source(config::File::from(path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("_"));

        let loaded = builder.build().context("building layered configuration")?;
        let config: Config = loaded.try_deserialize().context("deserializing configuration")?;
        Ok(config)
    }

    /// Writes the current config back out as `configs.json` in `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating config dir {}", dir.display()))?;
        let path = dir.join(CONFIG_FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("devswarm-config-test-{}", std::process::id()));
        let mut cfg = Config::default();
        cfg.device_count = 7;
        cfg.save(&dir).unwrap();

        let loaded = Config::load(&dir).unwrap();
        assert_eq!(loaded.device_count, 7);

        std::fs::remove_dir_all(&dir).ok();
    }
}
