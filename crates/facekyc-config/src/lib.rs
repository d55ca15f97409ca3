use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const PRIMARY_CONFIG_PATH: &str = "/etc/facekyc/config.toml";
pub const SECONDARY_CONFIG_PATH: &str = "/usr/local/etc/facekyc/config.toml";
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.8;
pub const DEFAULT_STORE_TIMEOUT_MILLIS: u64 = 10_000;
pub const DEFAULT_FIND_CONCURRENCY: usize = 8;
pub const DEFAULT_REGISTRY_PATH: &str = "data/user-database.json";
pub const DEFAULT_CONTENT_STORE_DIR: &str = "data/content";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    pub similarity_threshold: Option<f64>,
    pub store_timeout_millis: Option<u64>,
    pub find_concurrency: Option<usize>,
    pub registry_path: Option<PathBuf>,
    pub content_store_dir: Option<PathBuf>,
}

/// Configuration with every default applied.
///
/// The similarity threshold is carried through unchecked; range validation
/// happens when the verification service is constructed so that a bad value
/// fails startup instead of being clamped here.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub similarity_threshold: f64,
    pub store_timeout: Duration,
    pub find_concurrency: usize,
    pub registry_path: PathBuf,
    pub content_store_dir: PathBuf,
}

impl ResolvedConfig {
    pub fn from_raw(raw: ConfigFile) -> Self {
        Self {
            similarity_threshold: raw
                .similarity_threshold
                .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
            store_timeout: Duration::from_millis(
                raw.store_timeout_millis
                    .unwrap_or(DEFAULT_STORE_TIMEOUT_MILLIS)
                    .max(1),
            ),
            find_concurrency: raw
                .find_concurrency
                .unwrap_or(DEFAULT_FIND_CONCURRENCY)
                .max(1),
            registry_path: raw
                .registry_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_PATH)),
            content_store_dir: raw
                .content_store_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTENT_STORE_DIR)),
        }
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::from_raw(ConfigFile::default())
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub contents: ConfigFile,
    pub source: PathBuf,
}

impl LoadedConfig {
    pub fn new(contents: ConfigFile, source: PathBuf) -> Self {
        Self { contents, source }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigWithSource {
    pub resolved: ResolvedConfig,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

pub fn default_config_paths() -> [PathBuf; 2] {
    [
        PathBuf::from(PRIMARY_CONFIG_PATH),
        PathBuf::from(SECONDARY_CONFIG_PATH),
    ]
}

pub fn load_config() -> Result<Option<LoadedConfig>, ConfigError> {
    load_from_paths(&default_config_paths())
}

pub fn load_resolved_config() -> Result<ResolvedConfigWithSource, ConfigError> {
    load_resolved_from_paths(&default_config_paths())
}

pub fn load_from_paths(paths: &[PathBuf]) -> Result<Option<LoadedConfig>, ConfigError> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let parsed =
                    toml::from_str::<ConfigFile>(&contents).map_err(|err| ConfigError::Parse {
                        path: path.clone(),
                        message: err.to_string(),
                    })?;
                return Ok(Some(LoadedConfig::new(parsed, path.clone())));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source: err,
                })
            }
        }
    }

    Ok(None)
}

pub fn load_resolved_from_paths(
    paths: &[PathBuf],
) -> Result<ResolvedConfigWithSource, ConfigError> {
    match load_from_paths(paths)? {
        Some(entry) => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::from_raw(entry.contents),
            source: Some(entry.source),
        }),
        None => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::default(),
            source: None,
        }),
    }
}
