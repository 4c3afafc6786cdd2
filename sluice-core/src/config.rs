//! Import configuration
//!
//! An [`ImportConfig`] is built once per import run, either through its builder or from
//! environment-like key/value pairs, and is never mutated afterwards. Everything that depends on
//! a dataset (effective chunk size, retry profile) is derived on demand.
use std::str::FromStr;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::errors::{ConfigViolation, ImportError};

/// Prefix of the environment variables read by [`ImportConfig::from_env`]
pub const ENV_PREFIX: &str = "SLUICE_IMPORT_";

/// Dataset kinds that are known to be large and get a more patient retry profile
pub const LARGE_DATASET_KINDS: &[&str] = &[
    "web_crawl",
    "conversation_archive",
    "multilingual_corpus",
    "full_benchmark",
];

/// Lower bound of an adaptively computed chunk size
const MIN_ADAPTIVE_CHUNK_SIZE: usize = 100;

/// Share of the memory ceiling a single chunk may occupy
const CHUNK_MEMORY_SHARE: f64 = 0.7;

const BYTES_PER_MB: usize = 1024 * 1024;

/// Where imported chunks are written to
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::EnumString,
    strum_macros::Display,
    strum_macros::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StorageMode {
    /// Both the primary sink and the alternate sink
    #[default]
    Dual,
    SinkOnly,
    AlternateOnly,
}

/// Retry parameters derived for a specific dataset kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryProfile {
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    /// Timeout of a single fetch attempt
    pub timeout_secs: u64,
}

/// Validated configuration of a single import run.
///
/// Use [`ImportConfig::builder`], [`ImportConfig::from_env`] or [`ImportConfig::from_vars`].
/// All constructors validate and fail with [`ImportError::Configuration`] listing every
/// violated constraint.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(
    default,
    build_fn(private, name = "build_unvalidated", error = "anyhow::Error")
)]
pub struct ImportConfig {
    /// Items per chunk, or the upper bound when adaptive sizing is enabled (10 - 10,000)
    pub chunk_size: usize,
    /// Maximum number of items imported in a run, 0 means unlimited
    pub max_import_size: usize,
    /// Advisory memory ceiling used by adaptive chunk sizing (64 - 8192)
    pub max_memory_mb: usize,
    pub adaptive_chunk_size: bool,
    /// Retries of a failing fetch on top of the first attempt (1 - 10)
    pub max_retries: u32,
    /// Base delay between retries in seconds (0.1 - 60.0)
    pub retry_delay_secs: f64,
    pub enable_partial_import: bool,
    pub cleanup_on_failure: bool,
    pub storage_mode: StorageMode,
    /// Timeout of a single fetch attempt in seconds
    pub fetch_timeout_secs: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            max_import_size: 0,
            max_memory_mb: 512,
            adaptive_chunk_size: true,
            max_retries: 3,
            retry_delay_secs: 1.0,
            enable_partial_import: true,
            cleanup_on_failure: true,
            storage_mode: StorageMode::Dual,
            fetch_timeout_secs: 300,
        }
    }
}

impl ImportConfigBuilder {
    /// Builds and validates the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Configuration`] with every violated constraint.
    pub fn build(&self) -> Result<ImportConfig, ImportError> {
        let config = self.build_unvalidated().map_err(|err| {
            ImportError::Configuration(vec![ConfigViolation::new("builder", err.to_string())])
        })?;
        config.validate()?;
        Ok(config)
    }
}

impl ImportConfig {
    pub fn builder() -> ImportConfigBuilder {
        ImportConfigBuilder::default()
    }

    /// Reads the configuration from the process environment.
    ///
    /// A `.env` file in the working directory or one of its parents is loaded first; variables
    /// already set in the environment take precedence over it. See [`ImportConfig::from_vars`] for the accepted keys.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Configuration`] if the resulting configuration is invalid.
    pub fn from_env() -> Result<Self, ImportError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        tracing::debug!("Loading import config from environment");
        Self::from_vars(std::env::vars())
    }

    /// Builds the configuration from environment-like key/value pairs.
    ///
    /// Keys carry the [`ENV_PREFIX`] followed by `CHUNK_SIZE`, `MAX_IMPORT_SIZE`,
    /// `MAX_MEMORY_MB`, `ADAPTIVE_CHUNK_SIZE`, `MAX_RETRIES`, `RETRY_DELAY`,
    /// `ENABLE_PARTIAL_IMPORT`, `CLEANUP_ON_FAILURE`, `STORAGE_MODE` and `FETCH_TIMEOUT`. Other
    /// keys are ignored, later pairs override earlier ones, so defaults, environment and
    /// per-request overrides can simply be chained.
    ///
    /// Values that cannot be parsed fall back to the default and are logged. Parsed values that
    /// are out of range, and unknown storage modes, are reported as violations.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Configuration`] listing every violated constraint.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ImportError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = ImportConfig::default();
        let mut violations = Vec::new();

        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();

            match name {
                "CHUNK_SIZE" => parse_or_keep(name, value, &mut config.chunk_size),
                "MAX_IMPORT_SIZE" => parse_or_keep(name, value, &mut config.max_import_size),
                "MAX_MEMORY_MB" => parse_or_keep(name, value, &mut config.max_memory_mb),
                "ADAPTIVE_CHUNK_SIZE" => {
                    parse_flag_or_keep(name, value, &mut config.adaptive_chunk_size);
                }
                "MAX_RETRIES" => parse_or_keep(name, value, &mut config.max_retries),
                "RETRY_DELAY" => parse_or_keep(name, value, &mut config.retry_delay_secs),
                "ENABLE_PARTIAL_IMPORT" => {
                    parse_flag_or_keep(name, value, &mut config.enable_partial_import);
                }
                "CLEANUP_ON_FAILURE" => {
                    parse_flag_or_keep(name, value, &mut config.cleanup_on_failure);
                }
                "FETCH_TIMEOUT" => parse_or_keep(name, value, &mut config.fetch_timeout_secs),
                "STORAGE_MODE" => match StorageMode::from_str(&value.to_lowercase()) {
                    Ok(mode) => config.storage_mode = mode,
                    Err(_) => violations.push(ConfigViolation::new(
                        "storage_mode",
                        format!("must be one of dual, sink_only, alternate_only, got `{value}`"),
                    )),
                },
                _ => tracing::debug!(key = key.as_ref(), "Ignoring unknown import setting"),
            }
        }

        violations.extend(config.violations());
        if violations.is_empty() {
            Ok(config)
        } else {
            Err(ImportError::Configuration(violations))
        }
    }

    /// Checks every constraint and reports all violations at once
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Configuration`] if any constraint is violated.
    pub fn validate(&self) -> Result<(), ImportError> {
        let violations = self.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ImportError::Configuration(violations))
        }
    }

    fn violations(&self) -> Vec<ConfigViolation> {
        let mut violations = Vec::new();

        if !(10..=10_000).contains(&self.chunk_size) {
            violations.push(ConfigViolation::new(
                "chunk_size",
                format!("must be between 10 and 10000, got {}", self.chunk_size),
            ));
        }
        if !(64..=8192).contains(&self.max_memory_mb) {
            violations.push(ConfigViolation::new(
                "max_memory_mb",
                format!("must be between 64 and 8192, got {}", self.max_memory_mb),
            ));
        }
        if !(1..=10).contains(&self.max_retries) {
            violations.push(ConfigViolation::new(
                "max_retries",
                format!("must be between 1 and 10, got {}", self.max_retries),
            ));
        }
        if !(0.1..=60.0).contains(&self.retry_delay_secs) {
            violations.push(ConfigViolation::new(
                "retry_delay_secs",
                format!("must be between 0.1 and 60.0, got {}", self.retry_delay_secs),
            ));
        }
        if self.max_import_size > 0 && self.chunk_size > self.max_import_size {
            violations.push(ConfigViolation::new(
                "chunk_size",
                format!(
                    "must not exceed max_import_size ({}), got {}",
                    self.max_import_size, self.chunk_size
                ),
            ));
        }

        violations
    }

    /// Number of items per chunk for a dataset.
    ///
    /// Without adaptive sizing this is always `chunk_size`. With it, a known average item size
    /// turns 70% of the memory ceiling into an item count, bounded below by 100 and above by
    /// `chunk_size`. With only a dataset size, tiers apply: more than 10,000 items use at most
    /// 2000, more than 1000 at most 1000, anything smaller at most 500.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn effective_chunk_size(
        &self,
        dataset_size_hint: Option<usize>,
        avg_item_size_bytes: Option<usize>,
    ) -> usize {
        if !self.adaptive_chunk_size {
            return self.chunk_size;
        }

        match (avg_item_size_bytes, dataset_size_hint) {
            (Some(0), _) => self.chunk_size,
            (Some(avg_item_size), _) => {
                let budget = (self.max_memory_mb * BYTES_PER_MB) as f64 * CHUNK_MEMORY_SHARE;
                let computed = (budget / avg_item_size as f64).floor() as usize;
                computed
                    .max(MIN_ADAPTIVE_CHUNK_SIZE)
                    .min(self.chunk_size)
            }
            (None, Some(size)) if size > 10_000 => self.chunk_size.min(2000),
            (None, Some(size)) if size > 1000 => self.chunk_size.min(1000),
            (None, Some(_)) => self.chunk_size.min(500),
            (None, None) => self.chunk_size,
        }
    }

    /// Retry profile for fetching a dataset kind.
    ///
    /// Kinds listed in [`LARGE_DATASET_KINDS`] get twice the fetch timeout and a 50% longer
    /// base delay.
    pub fn effective_retry_config(&self, dataset_kind: &str) -> RetryProfile {
        let profile = RetryProfile {
            max_retries: self.max_retries,
            retry_delay_secs: self.retry_delay_secs,
            timeout_secs: self.fetch_timeout_secs,
        };

        if is_large_dataset(dataset_kind) {
            RetryProfile {
                retry_delay_secs: profile.retry_delay_secs * 1.5,
                timeout_secs: profile.timeout_secs * 2,
                ..profile
            }
        } else {
            profile
        }
    }
}

pub fn is_large_dataset(dataset_kind: &str) -> bool {
    LARGE_DATASET_KINDS.contains(&dataset_kind)
}

fn parse_or_keep<T>(name: &str, raw: &str, target: &mut T)
where
    T: FromStr + std::fmt::Display,
{
    match raw.parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(
            key = name,
            value = raw,
            default = %target,
            "Malformed import setting, keeping default"
        ),
    }
}

fn parse_flag_or_keep(name: &str, raw: &str, target: &mut bool) {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *target = true,
        "0" | "false" | "no" | "off" => *target = false,
        _ => tracing::warn!(
            key = name,
            value = raw,
            default = *target,
            "Malformed import flag, keeping default"
        ),
    }
}
