//! TOML configuration for the offload pipeline.
//!
//! ```toml
//! [storage]
//! root = "offload"
//!
//! [analysis]
//! algorithm = "pagerank"
//! block_size = 50
//! dispatch_attempts = 3
//!
//! [export]
//! layout = "per_partition"
//!
//! [merge]
//! max_attempts = 5
//! retry_backoff_ms = 2
//! ```
//!
//! Every key is optional; missing keys fall back to the defaults of the
//! corresponding options struct.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::{AnalysisOptions, PartitionSource};
use crate::export::{default_concurrency, ExportLayout, ExportOptions, DEFAULT_EXPORT_ROOT};
use crate::merge::MergeOptions;
use crate::partition::PartitionOptions;

/// Environment variable consulted when no explicit config path is given.
pub const CONFIG_ENV: &str = "SOMBRA_OFFLOAD_CONFIG";

/// Loaded pipeline configuration.
#[derive(Debug, Default)]
pub struct OffloadConfig {
    path: Option<PathBuf>,
    data: RawConfig,
}

impl OffloadConfig {
    /// Loads the config from `explicit`, or from `$SOMBRA_OFFLOAD_CONFIG`.
    ///
    /// A missing file yields the defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        let config = Self { path, data };
        config.validate()?;
        Ok(config)
    }

    /// Parses a config document held in memory.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let data = toml::from_str(contents).map_err(|source| ConfigError::Toml {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        let config = Self { path: None, data };
        config.validate()?;
        Ok(config)
    }

    /// Path the config was loaded from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Serializes the effective document.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(&self.data).map_err(|source| ConfigError::Serialize { source })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let analysis = &self.data.analysis;
        if analysis.block_size == Some(0) {
            return Err(ConfigError::invalid("analysis.block_size", "0"));
        }
        if analysis.dispatch_attempts == Some(0) {
            return Err(ConfigError::invalid("analysis.dispatch_attempts", "0"));
        }
        if analysis.concurrency == Some(0) {
            return Err(ConfigError::invalid("analysis.concurrency", "0"));
        }
        if self.data.export.concurrency == Some(0) {
            return Err(ConfigError::invalid("export.concurrency", "0"));
        }
        if self.data.merge.max_attempts == Some(0) {
            return Err(ConfigError::invalid("merge.max_attempts", "0"));
        }
        if let Some(layout) = self.data.export.layout.as_deref() {
            parse_layout(layout)?;
        }
        if let Some(source) = self.data.analysis.partition_source.as_deref() {
            parse_source(source)?;
        }
        if self.data.storage.root.as_deref() == Some("") {
            return Err(ConfigError::invalid("storage.root", ""));
        }
        Ok(())
    }

    fn root(&self) -> String {
        self.data
            .storage
            .root
            .clone()
            .unwrap_or_else(|| DEFAULT_EXPORT_ROOT.to_owned())
    }

    /// Partition assignment options.
    pub fn partition_options(&self) -> PartitionOptions {
        let raw = &self.data.analysis;
        let defaults = PartitionOptions::default();
        PartitionOptions {
            label: raw.partition_label.clone().unwrap_or(defaults.label),
            membership_type: raw.membership_type.clone().unwrap_or(defaults.membership_type),
            block_size: raw.block_size.unwrap_or(defaults.block_size),
        }
    }

    /// Export options.
    pub fn export_options(&self) -> Result<ExportOptions, ConfigError> {
        let defaults = ExportOptions::default();
        let layout = match self.data.export.layout.as_deref() {
            Some(layout) => parse_layout(layout)?,
            None => defaults.layout,
        };
        Ok(ExportOptions {
            root: self.root(),
            algorithm: self
                .data
                .analysis
                .algorithm
                .clone()
                .unwrap_or(defaults.algorithm),
            tracked_type: self
                .data
                .analysis
                .tracked_type
                .clone()
                .unwrap_or(defaults.tracked_type),
            layout,
            concurrency: self.data.export.concurrency.unwrap_or(defaults.concurrency),
        })
    }

    /// Partitioned analysis options.
    pub fn analysis_options(&self) -> Result<AnalysisOptions, ConfigError> {
        let raw = &self.data.analysis;
        let defaults = AnalysisOptions::default();
        let source = match raw.partition_source.as_deref() {
            Some(source) => parse_source(source)?,
            None => defaults.source,
        };
        Ok(AnalysisOptions {
            algorithm: raw.algorithm.clone().unwrap_or(defaults.algorithm),
            partition: self.partition_options(),
            tracked_type: raw.tracked_type.clone().unwrap_or(defaults.tracked_type),
            root: self.root(),
            concurrency: raw.concurrency.unwrap_or_else(default_concurrency),
            dispatch_attempts: raw.dispatch_attempts.unwrap_or(defaults.dispatch_attempts),
            source,
        })
    }

    /// Result merge options.
    pub fn merge_options(&self) -> MergeOptions {
        let raw = &self.data.merge;
        let defaults = MergeOptions::default();
        MergeOptions {
            membership_type: self
                .data
                .analysis
                .membership_type
                .clone()
                .unwrap_or(defaults.membership_type),
            max_attempts: raw.max_attempts.unwrap_or(defaults.max_attempts),
            retry_backoff: raw
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
        }
    }
}

fn parse_layout(value: &str) -> Result<ExportLayout, ConfigError> {
    match value {
        "combined" => Ok(ExportLayout::Combined),
        "per_partition" => Ok(ExportLayout::PerPartition),
        other => Err(ConfigError::invalid("export.layout", other)),
    }
}

fn parse_source(value: &str) -> Result<PartitionSource, ConfigError> {
    match value {
        "assign" => Ok(PartitionSource::Assign),
        "existing" => Ok(PartitionSource::Existing),
        other => Err(ConfigError::invalid("analysis.partition_source", other)),
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    storage: StorageSection,
    #[serde(default)]
    analysis: AnalysisSection,
    #[serde(default)]
    export: ExportSection,
    #[serde(default)]
    merge: MergeSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct StorageSection {
    root: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct AnalysisSection {
    algorithm: Option<String>,
    partition_label: Option<String>,
    membership_type: Option<String>,
    tracked_type: Option<String>,
    block_size: Option<usize>,
    concurrency: Option<usize>,
    dispatch_attempts: Option<u32>,
    partition_source: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct ExportSection {
    layout: Option<String>,
    concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct MergeSection {
    max_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read offload config {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    #[error("failed to parse offload config {path}: {source}")]
    Toml {
        /// File that was being parsed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The effective config could not be serialized.
    #[error("failed to serialize offload config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// A key holds a value outside its domain.
    #[error("config key '{key}' has invalid value '{value}'")]
    Invalid {
        /// Dotted key name.
        key: &'static str,
        /// Offending value.
        value: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_owned(),
        }
    }
}
