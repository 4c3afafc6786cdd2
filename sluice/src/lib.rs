//! # Sluice
//!
//! Sluice imports large datasets from remote or in-memory sources into one or two sinks while
//! keeping memory bounded. Datasets are streamed in chunks whose size adapts to the dataset, every
//! external call is retried with exponential backoff, chunks that fail to persist are recovered
//! after the stream ended, and a failed run releases everything it left behind.
//!
//! ## Features
//!
//! - Lazy, pull driven chunk streams; nothing is fetched before the consumer asks
//! - Adaptive chunk sizing based on the dataset size and the average item size
//! - Retries with exponential backoff, jitter, per attempt timeouts and cancellation
//! - Partial import: failed chunks are tracked and retried once more at the end of a run
//! - Automatic cleanup of temp files, scratch data and custom tasks when a run fails
//! - Dual storage: write to a primary and an alternate sink, or to either one
//! - `tracing` supported for logging and tracing
//!
//! ## Example
//!
//! ```no_run
//! # use sluice::config::{ImportConfig, StorageMode};
//! # use sluice::ingest::ImportPipeline;
//! # use sluice::sinks::{JsonlSink, MemorySink};
//! # use sluice::sources::StaticSource;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = ImportConfig::from_env()?;
//!
//! let report = ImportPipeline::from_fetcher(StaticSource::sample(10_000), config)
//!     .with_sink(JsonlSink::new("/tmp/datasets"))
//!     .with_alternate_sink(MemorySink::default())
//!     .with_progress(|processed: usize, total: Option<usize>| {
//!         println!("{processed} of {total:?}");
//!     })
//!     .run("sample", Default::default(), None)
//!     .await
//!     .into_result()?;
//!
//! println!("{} items imported as {}", report.total_processed, report.dataset_id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`config::ImportConfig`] is read from `SLUICE_IMPORT_*` environment variables or built in
//! code. Invalid configurations are rejected with every violation listed at once.

#[doc(inline)]
pub use sluice_core::prelude;

/// Capability traits implemented by sources, sinks and progress reporters
pub mod traits {
    #[doc(inline)]
    pub use sluice_core::ingest_traits::*;
}

/// Import configuration and the retry policies derived from it
pub mod config {
    #[doc(inline)]
    pub use sluice_core::config::*;
    #[doc(inline)]
    pub use sluice_core::retry::RetryStrategy;
}

/// Errors raised by an import
pub mod errors {
    #[doc(inline)]
    pub use sluice_core::errors::*;
}

/// The streaming import pipeline.
///
/// Use [`ingest::ImportPipeline`] for complete runs, or [`ingest::StreamProcessor`] to consume
/// the chunks of a dataset directly.
pub mod ingest {
    #[doc(inline)]
    pub use sluice_core::{Chunk, ChunkStream, DatasetParams, Metadata, RecordIter, SourceHandle};
    #[doc(inline)]
    pub use sluice_ingest::*;
}

/// Bundled source fetchers
pub mod sources {
    #[doc(inline)]
    pub use sluice_ingest::sources::*;
}

/// Bundled chunk sinks
pub mod sinks {
    #[doc(inline)]
    pub use sluice_ingest::sinks::*;
}
