use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{DEFAULT_SERVER, ResourcePointer};
use crate::error::BtcError;

pub const DEFAULT_CONFIG_FILE: &str = "btc.json";
pub const DEFAULT_COMPLETENESS_THRESHOLD: usize = 10;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_SCAN_BATCH: usize = 10;
pub const DEFAULT_SHARD_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub store_root: Option<String>,
    #[serde(default)]
    pub auto_fetch: Option<bool>,
    #[serde(default)]
    pub resolution: Option<ResolutionSection>,
    #[serde(default)]
    pub download: Option<DownloadSection>,
    #[serde(default)]
    pub export: Option<ExportSection>,
    #[serde(default)]
    pub network: Option<NetworkSection>,
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ResolutionSection {
    #[serde(default)]
    pub completeness_threshold: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DownloadSection {
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub skip_existing: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ExportSection {
    #[serde(default)]
    pub include_content: Option<bool>,
    #[serde(default)]
    pub scan_batch_size: Option<usize>,
    #[serde(default)]
    pub shard_bytes: Option<usize>,
}

/// Retries for transient catalog failures (429, 5xx, connect and timeout).
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NetworkSection {
    #[serde(default)]
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
}

/// A resource to seed the workspace with, either `owner/lang/id` or an object
/// naming the panel it belongs in.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ResourceEntry {
    Shorthand(String),
    Detailed(ResourceEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ResourceEntryObject {
    pub key: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub panel: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeedResource {
    pub pointer: ResourcePointer,
    pub panel: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub server: String,
    pub stage: String,
    pub store_root: Option<Utf8PathBuf>,
    pub auto_fetch: bool,
    pub completeness_threshold: usize,
    pub concurrency: usize,
    pub skip_existing: bool,
    pub include_content: bool,
    pub scan_batch_size: usize,
    pub shard_bytes: usize,
    pub max_retries: usize,
    pub retry_backoff_ms: u64,
    pub resources: Vec<SeedResource>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            server: DEFAULT_SERVER.to_string(),
            stage: "prod".to_string(),
            store_root: None,
            auto_fetch: true,
            completeness_threshold: DEFAULT_COMPLETENESS_THRESHOLD,
            concurrency: DEFAULT_CONCURRENCY,
            skip_existing: true,
            include_content: false,
            scan_batch_size: DEFAULT_SCAN_BATCH,
            shard_bytes: DEFAULT_SHARD_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            resources: Vec::new(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `btc.json` in the working directory. A missing default
    /// file yields the defaults; an explicit path must be readable.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, BtcError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| BtcError::ConfigRead(config_path.clone()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|err| BtcError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, BtcError> {
        let defaults = ResolvedConfig::default();
        let server = config
            .server
            .map(|server| server.trim_end_matches('/').to_string())
            .unwrap_or(defaults.server);

        let resolution = config.resolution.unwrap_or_default();
        let download = config.download.unwrap_or_default();
        let export = config.export.unwrap_or_default();
        let network = config.network.unwrap_or_default();

        let concurrency = download.concurrency.unwrap_or(defaults.concurrency);
        if concurrency == 0 {
            return Err(BtcError::ConfigParse(
                "download.concurrency must be at least 1".to_string(),
            ));
        }
        let scan_batch_size = export.scan_batch_size.unwrap_or(defaults.scan_batch_size);
        let shard_bytes = export.shard_bytes.unwrap_or(defaults.shard_bytes);
        if scan_batch_size == 0 || shard_bytes == 0 {
            return Err(BtcError::ConfigParse(
                "export.scan_batch_size and export.shard_bytes must be positive".to_string(),
            ));
        }

        let resources = config
            .resources
            .into_iter()
            .map(|entry| match entry {
                ResourceEntry::Shorthand(value) => Ok(SeedResource {
                    pointer: with_server(value.parse()?, &value, &server),
                    panel: None,
                }),
                ResourceEntry::Detailed(obj) => {
                    let mut pointer: ResourcePointer = obj.key.parse()?;
                    pointer.server = obj.server.unwrap_or_else(|| server.clone());
                    Ok(SeedResource {
                        pointer,
                        panel: obj.panel,
                    })
                }
            })
            .collect::<Result<Vec<_>, BtcError>>()?;

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(defaults.schema_version),
            stage: config.stage.unwrap_or(defaults.stage),
            store_root: config.store_root.map(Utf8PathBuf::from),
            auto_fetch: config.auto_fetch.unwrap_or(defaults.auto_fetch),
            completeness_threshold: resolution
                .completeness_threshold
                .unwrap_or(defaults.completeness_threshold),
            concurrency,
            skip_existing: download.skip_existing.unwrap_or(defaults.skip_existing),
            include_content: export.include_content.unwrap_or(defaults.include_content),
            scan_batch_size,
            shard_bytes,
            max_retries: network.max_retries.unwrap_or(defaults.max_retries),
            retry_backoff_ms: network
                .retry_backoff_ms
                .unwrap_or(defaults.retry_backoff_ms),
            resources,
            server,
        })
    }
}

// Shorthand keys without an explicit `@server` inherit the configured server.
fn with_server(mut pointer: ResourcePointer, raw: &str, server: &str) -> ResourcePointer {
    if !raw.contains('@') {
        pointer.server = server.to_string();
    }
    pointer
}
