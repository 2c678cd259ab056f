//! Data source catalog read from YAML.
//!
//! A catalog file is a mapping of source name to source record:
//!
//! ```yaml
//! sst_daily:
//!   url: filecache::https://example.org/sst/{t:%Y}/sst_{t:%Y%m%d}.nc
//!   storage_options:
//!     cache_storage: ./data/sst/{t:%Y}
//!   time:
//!     start: 2020-01-01
//!     freq: 1D
//!   variables: [sst]
//!   metadata:
//!     product: sst
//! ```
//!
//! Records are parsed once and never mutated afterwards.

pub mod frequency;

pub use frequency::{Frequency, FrequencyError, FrequencyUnit};

use crate::template::FormatContext;
use crate::timestamp::{parse_timestamp, TimestampError};
use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from reading or validating a source catalog.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read source file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse source catalog: {0}")]
    Parse(String),

    #[error("source '{source_name}': missing required field '{field}'")]
    MissingField {
        source_name: String,
        field: &'static str,
    },

    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error("source '{source_name}': {message}")]
    Invalid { source_name: String, message: String },

    #[error("source '{source_name}': url '{url}' is not compatible with any known downloader")]
    UnsupportedUrl { source_name: String, url: String },

    #[error("source '{source_name}': protocol '{protocol}' is not supported (expected http, https or s3)")]
    UnsupportedProtocol {
        source_name: String,
        protocol: String,
    },

    #[error("source '{source_name}': variables must be defined")]
    MissingVariables { source_name: String },
}

/// Time coverage of a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeConfig {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub freq: Option<Frequency>,
    /// Largest accepted distance between a requested time and the nearest
    /// available one.
    #[serde(default)]
    pub tolerance: Option<Frequency>,
}

impl TimeConfig {
    pub fn start_time(&self) -> Result<Option<NaiveDateTime>, TimestampError> {
        self.start.as_deref().map(parse_timestamp).transpose()
    }

    pub fn end_time(&self) -> Result<Option<NaiveDateTime>, TimestampError> {
        self.end.as_deref().map(parse_timestamp).transpose()
    }
}

/// `storage_options` block: the cache path template plus per-protocol
/// option mappings (`https`, `s3`, `thredds`, `cmems`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageOptions {
    #[serde(default)]
    pub cache_storage: Option<String>,
    #[serde(flatten)]
    pub protocols: BTreeMap<String, Value>,
}

impl StorageOptions {
    /// Deserialize the mapping stored under `key`, or the default when absent.
    pub fn protocol_options<T>(&self, key: &str) -> Result<T, serde_yaml::Error>
    where
        T: DeserializeOwned + Default,
    {
        match self.protocols.get(key) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => serde_yaml::from_value(value.clone()),
        }
    }
}

/// One selected variable. `output` is carried for reference only; downloads
/// keep the source name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub source: String,
    pub output: String,
}

/// Variable selection, written in YAML either as a list of names or as a
/// `source: output` mapping. Declaration order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawVariables")]
pub struct Variables(Vec<Variable>);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVariables {
    List(Vec<String>),
    Map(serde_yaml::Mapping),
}

impl TryFrom<RawVariables> for Variables {
    type Error = String;

    fn try_from(raw: RawVariables) -> Result<Self, Self::Error> {
        match raw {
            RawVariables::List(names) => Ok(Variables(
                names
                    .into_iter()
                    .map(|name| Variable {
                        output: name.clone(),
                        source: name,
                    })
                    .collect(),
            )),
            RawVariables::Map(mapping) => mapping
                .into_iter()
                .map(|(k, v)| {
                    let source = scalar_to_string(&k)
                        .ok_or_else(|| "variable names must be scalars".to_string())?;
                    let output = match v {
                        Value::Null => source.clone(),
                        other => scalar_to_string(&other).ok_or_else(|| {
                            format!("output name for variable '{source}' must be a scalar")
                        })?,
                    };
                    Ok(Variable { source, output })
                })
                .collect::<Result<Vec<_>, String>>()
                .map(Variables),
        }
    }
}

impl Variables {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.0.iter()
    }

    /// Names to request from the remote dataset.
    pub fn source_names(&self) -> Vec<&str> {
        self.0.iter().map(|v| v.source.as_str()).collect()
    }
}

/// A named data source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub storage_options: Option<StorageOptions>,
    #[serde(default)]
    pub time: Option<TimeConfig>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Any other top-level key. Scalars among them are template fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DataSource {
    pub fn url(&self) -> Result<&str, ConfigError> {
        match self.url.as_deref() {
            Some(url) if !url.trim().is_empty() => Ok(url),
            _ => Err(self.missing("url")),
        }
    }

    pub fn storage_options(&self) -> Result<&StorageOptions, ConfigError> {
        self.storage_options
            .as_ref()
            .ok_or_else(|| self.missing("storage_options"))
    }

    pub fn cache_storage(&self) -> Result<&str, ConfigError> {
        match self.storage_options()?.cache_storage.as_deref() {
            Some(path) if !path.trim().is_empty() => Ok(path),
            _ => Err(self.missing("storage_options.cache_storage")),
        }
    }

    pub fn frequency(&self) -> Option<Frequency> {
        self.time.as_ref().and_then(|t| t.freq)
    }

    pub fn tolerance(&self) -> Option<Frequency> {
        self.time.as_ref().and_then(|t| t.tolerance)
    }

    /// Template fields: the source name, then top-level scalars, then
    /// metadata scalars (metadata wins on a clash).
    pub fn format_context(&self) -> FormatContext {
        let mut ctx = FormatContext::new();
        ctx.insert("name", self.name.clone());
        for (key, value) in self.extra.iter().chain(self.metadata.iter()) {
            if let Some(s) = scalar_to_string(value) {
                ctx.insert(key, s);
            }
        }
        ctx
    }

    /// Check the fields every downloader needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.url()?;
        self.cache_storage()?;
        if let Some(time) = &self.time {
            for (label, value) in [("start", &time.start), ("end", &time.end)] {
                if let Some(raw) = value {
                    parse_timestamp(raw).map_err(|e| self.invalid(format!("time.{label}: {e}")))?;
                }
            }
            if let (Ok(Some(start)), Ok(Some(end))) = (time.start_time(), time.end_time()) {
                if start > end {
                    return Err(self.invalid("time.start is after time.end".to_string()));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn missing(&self, field: &'static str) -> ConfigError {
        ConfigError::MissingField {
            source_name: self.name.clone(),
            field,
        }
    }

    pub(crate) fn invalid(&self, message: String) -> ConfigError {
        ConfigError::Invalid {
            source_name: self.name.clone(),
            message,
        }
    }
}

/// All sources of a catalog file, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    sources: Vec<DataSource>,
}

impl SourceCatalog {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let root: Value =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mapping = match root {
            Value::Mapping(m) => m,
            Value::Null => return Err(ConfigError::Parse("catalog is empty".into())),
            _ => {
                return Err(ConfigError::Parse(
                    "catalog must be a mapping of source names to sources".into(),
                ))
            }
        };

        let mut sources = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let name = scalar_to_string(&key)
                .ok_or_else(|| ConfigError::Parse("source names must be scalars".into()))?;
            let mut source: DataSource = serde_yaml::from_value(value)
                .map_err(|e| ConfigError::Parse(format!("source '{name}': {e}")))?;
            source.name = name;
            sources.push(source);
        }
        tracing::debug!(count = sources.len(), "parsed source catalog");
        Ok(Self { sources })
    }

    pub fn get(&self, name: &str) -> Result<&DataSource, ConfigError> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::UnknownSource(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataSource> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// The named sources in the order given, or every source when `names`
    /// is empty.
    pub fn select(&self, names: &[String]) -> Result<Vec<&DataSource>, ConfigError> {
        if names.is_empty() {
            return Ok(self.sources.iter().collect());
        }
        names.iter().map(|n| self.get(n)).collect()
    }
}

/// Read a YAML source catalog from disk.
pub fn read_sources(path: impl AsRef<Path>) -> Result<SourceCatalog, ConfigError> {
    let path = path.as_ref();
    tracing::trace!(path = %path.display(), "reading source catalog");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    SourceCatalog::from_yaml_str(&content)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Tagged(tagged) => scalar_to_string(&tagged.value),
        _ => None,
    }
}
