#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Leaf types and capability traits of the sluice ingestion pipeline

pub mod config;
pub mod errors;
pub mod ingest_traits;
pub mod retry;
pub mod source;

mod chunk;
mod chunk_stream;
mod metadata;

pub use crate::chunk::Chunk;
pub use crate::chunk_stream::ChunkStream;
pub use crate::config::{ImportConfig, ImportConfigBuilder, RetryProfile, StorageMode};
pub use crate::errors::{ConfigViolation, ImportError};
/// All traits are available from the root
pub use crate::ingest_traits::*;
pub use crate::metadata::Metadata;
pub use crate::retry::RetryStrategy;
pub use crate::source::{DatasetParams, RecordIter, SourceHandle};

/// Re-export of commonly used dependencies.
pub mod prelude;
