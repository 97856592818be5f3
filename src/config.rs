use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::parser::FeedFormat;

/// One upstream feed to reconcile against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Short identifier, also the source tag on registry records.
    pub name: String,
    pub url: String,
    pub format: FeedFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub http_addr: String,
    pub log_level: String,
    /// Registry database location. Defaults to the platform data dir.
    pub db_path: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub fetch_timeout_secs: u64,
    /// How many recent notifications the events endpoint retains.
    pub event_buffer: usize,
    /// Map link template with an `{id}` placeholder, e.g.
    /// `https://map.example.net/#!v:m;n:{id}`.
    pub map_uri: Option<String>,
    /// Node identities (ids or hardware addresses) to drop at parse time.
    pub skip_nodes: Vec<String>,
    /// Field names whose changes are never announced.
    pub ignore_fields: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:9280".to_string(),
            log_level: "info".to_string(),
            db_path: None,
            poll_interval_secs: 30,
            fetch_timeout_secs: 5,
            event_buffer: 100,
            map_uri: None,
            skip_nodes: Vec::new(),
            ignore_fields: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.db_path {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir().context("could not determine data directory")?;
        Ok(data_dir.join("meshmon").join("nodes.db"))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    pub daemon: Option<DaemonConfig>,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

impl Config {
    pub fn path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(config_dir.join("meshmon").join("config.toml"))
    }
}

pub fn load() -> Result<Config> {
    let path = Config::path()?;
    if !path.exists() {
        return Ok(Config::default());
    }
    load_from(&path)
}

pub fn load_from(path: &std::path::Path) -> Result<Config> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}
