//! Errors raised by the ingestion pipeline
//!
//! Per-chunk sink failures are not errors at this level. They are reported as outcome values
//! and absorbed by partial import recovery; only conditions that end a run, or that the caller
//! must see immediately, are represented here.
use std::fmt;

use thiserror::Error;

/// A single violated configuration constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    pub field: &'static str,
    pub message: String,
}

impl ConfigViolation {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug)]
pub enum ImportError {
    /// Invalid or contradictory configuration. Lists every violation, not just the first.
    #[error("invalid import configuration: {}", join_violations(.0))]
    Configuration(Vec<ConfigViolation>),

    #[error("unsupported dataset kind `{0}`")]
    UnsupportedDataset(String),

    /// Fetching the source, or extracting an item from it, failed
    #[error("failed to fetch dataset `{dataset_kind}`{}", at_item(.item_index))]
    DatasetFetch {
        dataset_kind: String,
        item_index: Option<usize>,
        #[source]
        source: anyhow::Error,
    },

    /// An operation kept failing after all retries; carries the last underlying failure
    #[error("{operation} failed after {attempts} attempt(s) (max retries {max_retries})")]
    RetryExhausted {
        operation: String,
        max_retries: u32,
        attempts: u32,
        #[source]
        last_error: anyhow::Error,
    },

    /// A sink failed to commit a finished run
    #[error("failed to commit dataset `{dataset_id}`")]
    Commit {
        dataset_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("partial import recovery is disabled by configuration")]
    PartialImportDisabled,

    /// Cooperative cancellation was observed at a suspension point
    #[error("import cancelled")]
    Cancelled,
}

impl ImportError {
    /// Stable, snake_case tag for the error variant
    pub fn kind(&self) -> &'static str {
        match self {
            ImportError::Configuration(_) => "configuration",
            ImportError::UnsupportedDataset(_) => "unsupported_dataset",
            ImportError::DatasetFetch { .. } => "dataset_fetch",
            ImportError::RetryExhausted { .. } => "retry_exhausted",
            ImportError::Commit { .. } => "commit",
            ImportError::PartialImportDisabled => "partial_import_disabled",
            ImportError::Cancelled => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImportError::Cancelled)
    }

    /// Violations carried by a configuration error, empty for any other variant
    pub fn violations(&self) -> &[ConfigViolation] {
        match self {
            ImportError::Configuration(violations) => violations,
            _ => &[],
        }
    }
}

/// Best effort kind tag for an opaque error returned by a capability
pub fn error_kind(error: &anyhow::Error) -> &'static str {
    error
        .downcast_ref::<ImportError>()
        .map_or("external", ImportError::kind)
}

fn join_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[allow(clippy::ref_option)]
fn at_item(item_index: &Option<usize>) -> String {
    item_index.map_or_else(String::new, |index| format!(" at item {index}"))
}
