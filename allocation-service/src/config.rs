use serde::Deserialize;
use std::{fs, path::PathBuf};

use anyhow::{bail, Context};

use crate::engine::RemainderPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Csv,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    pub kind: SourceKind,
    #[serde(default = "default_csv_dir")]
    pub csv_dir: PathBuf,
}

fn default_csv_dir() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllocationConfig {
    #[serde(default)]
    pub remainder_policy: RemainderPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus text exposition is written here when the run ends.
    pub textfile_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub snapshot: SnapshotConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub allocation: AllocationConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("ALLOCATION_CONFIG").unwrap_or_else(|_| "allocation-config.toml".to_string());
        let contents = fs::read_to_string(&path).with_context(|| format!("failed to read config file {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("invalid config file {path}"))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        if cfg.snapshot.kind == SourceKind::Postgres && cfg.database.is_none() {
            bail!("snapshot.kind = \"postgres\" requires a [database] section");
        }
        Ok(cfg)
    }
}
