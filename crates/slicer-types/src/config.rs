//! Engine configuration.
//!
//! The configuration is normally loaded by the surrounding pipeline from a
//! YAML or JSON document and handed to the operator handlers at setup time.
//! Every section has defaults, so an empty document is a valid
//! configuration.

use core::fmt;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Display;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default number of slots in a per-origin watermark reorder window.
pub const DEFAULT_REORDER_CAPACITY: usize = 4096;

/// Default number of records per output buffer.
pub const fn default_buffer_capacity() -> usize {
    1024
}

/// Default number of hash-table buckets per join side.
pub const fn default_buckets() -> usize {
    64
}

/// Default number of records per hash-table page.
pub const fn default_page_capacity() -> usize {
    256
}

/// Errors raised while loading or validating an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file '{path}': {error}")]
    Io {
        path: String,
        #[source]
        error: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads.  Fixed for the lifetime of the pipeline;
    /// every staging entry waits for exactly this many contributions.
    pub workers: usize,

    /// Window definition shared by aggregation and join operators.
    pub window: WindowConfig,

    /// Watermark reordering.
    pub watermark: WatermarkConfig,

    /// Stream join build/probe settings.
    pub join: JoinConfig,

    /// Output buffer pool.
    pub buffers: BufferConfig,

    /// Optional escalation timeouts.
    pub timeouts: TimeoutConfig,

    /// Origin id stamped on buffers produced by window operators.  Must not
    /// collide with any input origin.
    pub result_origin_id: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            window: WindowConfig::default(),
            watermark: WatermarkConfig::default(),
            join: JoinConfig::default(),
            buffers: BufferConfig::default(),
            timeouts: TimeoutConfig::default(),
            result_origin_id: u64::MAX,
        }
    }
}

impl EngineConfig {
    /// Parses a YAML document.  JSON is a subset of YAML, so this also
    /// accepts JSON.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the configuration from `path`; files ending in `.json` are
    /// parsed as JSON, everything else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
            path: path.display().to_string(),
            error,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }

    pub fn with_workers(self, workers: usize) -> Self {
        Self { workers, ..self }
    }

    pub fn with_window(self, size: u64, slide: u64) -> Self {
        Self {
            window: WindowConfig {
                size,
                slide: Some(slide),
                ..self.window
            },
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "at least one worker is required"));
        }
        self.window.validate()?;
        if self.watermark.reorder_capacity == 0 {
            return Err(ConfigError::invalid(
                "watermark.reorder_capacity",
                "must be positive",
            ));
        }
        self.join.validate()?;
        if self.buffers.buffer_capacity == 0 {
            return Err(ConfigError::invalid(
                "buffers.buffer_capacity",
                "must be positive",
            ));
        }
        if self.buffers.max_buffers == Some(0) {
            return Err(ConfigError::invalid(
                "buffers.max_buffers",
                "a pool without buffers can never emit",
            ));
        }
        Ok(())
    }
}

/// Window size and slide, in the same unit as record timestamps.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub size: u64,

    /// Distance between consecutive window starts.  Defaults to `size`
    /// (tumbling windows).
    pub slide: Option<u64>,

    pub pre_aggregation: PreAggregation,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: 1000,
            slide: None,
            pre_aggregation: PreAggregation::default(),
        }
    }
}

/// How workers partition records before the cross-worker merge.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreAggregation {
    /// Non-overlapping slices between window boundaries.  Every record is
    /// accumulated once; sliding windows are assembled after the merge.
    #[default]
    Slices,

    /// One bucket per window.  A record is accumulated into every window
    /// containing it, and merged buckets are complete windows.
    Buckets,
}

impl Display for PreAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slices => write!(f, "slices"),
            Self::Buckets => write!(f, "buckets"),
        }
    }
}

impl WindowConfig {
    pub fn with_pre_aggregation(self, pre_aggregation: PreAggregation) -> Self {
        Self {
            pre_aggregation,
            ..self
        }
    }

    pub fn slide(&self) -> u64 {
        self.slide.unwrap_or(self.size)
    }

    pub fn is_tumbling(&self) -> bool {
        self.slide() == self.size
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::invalid("window.size", "must be positive"));
        }
        let slide = self.slide();
        if slide == 0 {
            return Err(ConfigError::invalid("window.slide", "must be positive"));
        }
        if slide > self.size {
            return Err(ConfigError::invalid(
                "window.slide",
                format!("slide {slide} exceeds window size {}", self.size),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    /// Number of out-of-order watermark updates each origin may have in
    /// flight ahead of its contiguous prefix.
    pub reorder_capacity: usize,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            reorder_capacity: DEFAULT_REORDER_CAPACITY,
        }
    }
}

/// How concurrent inserts into a join hash-table bucket are synchronized.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "testing", derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum InsertStrategy {
    /// A mutex per bucket.
    Locking,

    /// Compare-and-swap on the bucket's page chain.
    #[default]
    LockFree,
}

impl Display for InsertStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locking => write!(f, "locking"),
            Self::LockFree => write!(f, "lock-free"),
        }
    }
}

/// Physical join algorithm.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinAlgorithmKind {
    #[default]
    Hash,

    /// Skip hashing and compare every pair of records in the window.
    NestedLoop,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    pub algorithm: JoinAlgorithmKind,

    pub strategy: InsertStrategy,

    /// Number of buckets per hash table.  Rounded up to a power of two.
    pub buckets: usize,

    /// Records per page.
    pub page_capacity: usize,

    /// Upper bound on pages allocated at the same time across all join
    /// windows.  Allocation blocks when the budget is exhausted.
    pub max_pages: Option<usize>,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            algorithm: JoinAlgorithmKind::default(),
            strategy: InsertStrategy::default(),
            buckets: default_buckets(),
            page_capacity: default_page_capacity(),
            max_pages: None,
        }
    }
}

impl JoinConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.buckets == 0 {
            return Err(ConfigError::invalid("join.buckets", "must be positive"));
        }
        if self.page_capacity == 0 {
            return Err(ConfigError::invalid("join.page_capacity", "must be positive"));
        }
        if self.max_pages == Some(0) {
            return Err(ConfigError::invalid(
                "join.max_pages",
                "a join without pages can never build",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Records per output buffer.
    pub buffer_capacity: usize,

    /// Number of output buffers that may be in flight downstream.  `None`
    /// means unbounded.
    pub max_buffers: Option<usize>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            max_buffers: None,
        }
    }
}

/// Escalation timeouts in milliseconds.
///
/// Each field accepts a number, `false`/`null` (disabled), or `true` (use
/// the default of one minute).
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long a staging entry may wait for the remaining workers before
    /// its window is abandoned.
    #[serde(deserialize_with = "deserialize_timeout")]
    pub merge_ms: Option<u64>,

    /// How long a thread may block on an exhausted buffer pool or page
    /// allocator before the allocation fails.
    #[serde(deserialize_with = "deserialize_timeout")]
    pub allocation_ms: Option<u64>,
}

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

impl TimeoutConfig {
    pub fn merge_timeout(&self) -> Option<Duration> {
        self.merge_ms.map(Duration::from_millis)
    }

    pub fn allocation_timeout(&self) -> Option<Duration> {
        self.allocation_ms.map(Duration::from_millis)
    }
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct BoolOrMillis;

    impl<'a> Visitor<'a> for BoolOrMillis {
        type Value = Option<u64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("boolean, null, or a number of milliseconds")
        }

        fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            match v {
                false => Ok(None),
                true => Ok(Some(DEFAULT_TIMEOUT_MS)),
            }
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u64::try_from(v)
                .map(Some)
                .map_err(|_| E::custom(format!("timeout must not be negative: {v}")))
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
        where
            D: Deserializer<'a>,
        {
            deserializer.deserialize_any(BoolOrMillis)
        }
    }

    deserializer.deserialize_any(BoolOrMillis)
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, EngineConfig, InsertStrategy, JoinAlgorithmKind, PreAggregation};
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.window.is_tumbling());
        assert_eq!(config.window.pre_aggregation, PreAggregation::Slices);
        assert_eq!(config.timeouts.merge_timeout(), None);
    }

    #[test]
    fn yaml_config() {
        let config = EngineConfig::from_yaml_str(
            r#"
workers: 2
window:
  size: 1000
  slide: 250
  pre_aggregation: buckets
join:
  algorithm: nested_loop
  strategy: locking
  page_capacity: 8
timeouts:
  merge_ms: 500
  allocation_ms: true
"#,
        )
        .unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.window.slide(), 250);
        assert!(!config.window.is_tumbling());
        assert_eq!(config.window.pre_aggregation, PreAggregation::Buckets);
        assert_eq!(config.join.algorithm, JoinAlgorithmKind::NestedLoop);
        assert_eq!(config.join.strategy, InsertStrategy::Locking);
        assert_eq!(config.join.page_capacity, 8);
        assert_eq!(
            config.timeouts.merge_timeout(),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            config.timeouts.allocation_timeout(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn disabled_timeout() {
        let config =
            EngineConfig::from_json_str(r#"{"timeouts": {"merge_ms": false, "allocation_ms": null}}"#)
                .unwrap();
        assert_eq!(config.timeouts.merge_ms, None);
        assert_eq!(config.timeouts.allocation_ms, None);
    }

    #[test]
    fn json_timeouts() {
        let config =
            EngineConfig::from_json_str(r#"{"timeouts": {"merge_ms": 500, "allocation_ms": true}}"#)
                .unwrap();
        assert_eq!(
            config.timeouts.merge_timeout(),
            Some(Duration::from_millis(500))
        );
        assert_eq!(config.timeouts.allocation_ms, Some(60_000));
    }

    #[test]
    fn invalid_config() {
        assert!(matches!(
            EngineConfig::from_yaml_str("workers: 0"),
            Err(ConfigError::Invalid {
                field: "workers",
                ..
            })
        ));
        assert!(matches!(
            EngineConfig::from_yaml_str("window: {size: 10, slide: 20}"),
            Err(ConfigError::Invalid {
                field: "window.slide",
                ..
            })
        ));
        assert!(matches!(
            EngineConfig::from_yaml_str("workers: [1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, r#"{{"workers": 3, "window": {{"size": 100}}}}"#).unwrap();
        let config = EngineConfig::from_path(file.path()).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.window.size, 100);
        assert_eq!(config.window.slide(), 100);
    }
}
