//! Capabilities the pipeline consumes and exposes
//!
//! Fetching datasets and persisting chunks are left to the host. Implement [`SourceFetcher`] to
//! bring your own datasets and [`ChunkSink`] to bring your own storage; both are plain traits and
//! plug straight into the stream processor and the import pipeline.
use std::{fmt::Debug, path::PathBuf, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    metadata::Metadata,
    source::{DatasetParams, SourceHandle},
};

#[cfg(feature = "test-utils")]
#[doc(hidden)]
use mockall::automock;

#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
/// Retrieves a named dataset
///
/// Fetching must be safe to repeat with the same parameters, it is retried on failure.
pub trait SourceFetcher: Send + Sync + Debug {
    async fn fetch(&self, dataset_kind: &str, params: DatasetParams) -> Result<SourceHandle>;

    /// Whether `dataset_kind` can be fetched at all; checked before any I/O
    fn supports(&self, dataset_kind: &str) -> bool;

    /// Parameter keys accepted for `dataset_kind`. Others are dropped before fetching.
    fn accepted_params(&self, _dataset_kind: &str) -> Option<Vec<String>> {
        None
    }
}

#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
/// Persists chunks of items
///
/// An `Err` from `write_chunk` marks the chunk as failed; it is recorded for recovery and the
/// run continues. Chunks may be offered more than once, writes should replace rather than append.
pub trait ChunkSink: Send + Sync + Debug {
    async fn write_chunk(
        &self,
        items: Vec<String>,
        metadata: Vec<Metadata>,
        dataset_id: &str,
    ) -> Result<usize>;

    /// Called once after a run finished without a fatal error
    async fn commit(&self, _dataset_id: &str) -> Result<()> {
        Ok(())
    }

    /// Scratch files holding partial writes for `dataset_id`, removed when the run fails
    fn temp_paths(&self, _dataset_id: &str) -> Vec<PathBuf> {
        Vec::new()
    }
}

#[cfg_attr(feature = "test-utils", automock)]
/// Receives progress at chunk boundaries
///
/// May be called any number of times; `total_estimated` is not guaranteed to be monotonic.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, total_processed: usize, total_estimated: Option<usize>);
}

/// Use a closure as a progress reporter
impl<F> ProgressReporter for F
where
    F: Fn(usize, Option<usize>) + Send + Sync,
{
    fn report(&self, total_processed: usize, total_estimated: Option<usize>) {
        self(total_processed, total_estimated);
    }
}

#[async_trait]
impl<T: SourceFetcher + ?Sized> SourceFetcher for Arc<T> {
    async fn fetch(&self, dataset_kind: &str, params: DatasetParams) -> Result<SourceHandle> {
        (**self).fetch(dataset_kind, params).await
    }

    fn supports(&self, dataset_kind: &str) -> bool {
        (**self).supports(dataset_kind)
    }

    fn accepted_params(&self, dataset_kind: &str) -> Option<Vec<String>> {
        (**self).accepted_params(dataset_kind)
    }
}

#[async_trait]
impl<T: ChunkSink + ?Sized> ChunkSink for Arc<T> {
    async fn write_chunk(
        &self,
        items: Vec<String>,
        metadata: Vec<Metadata>,
        dataset_id: &str,
    ) -> Result<usize> {
        (**self).write_chunk(items, metadata, dataset_id).await
    }

    async fn commit(&self, dataset_id: &str) -> Result<()> {
        (**self).commit(dataset_id).await
    }

    fn temp_paths(&self, dataset_id: &str) -> Vec<PathBuf> {
        (**self).temp_paths(dataset_id)
    }
}
