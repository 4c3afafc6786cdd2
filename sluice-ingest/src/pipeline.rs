use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::TryStreamExt as _;
use serde::{Serialize, Serializer};
use sluice_core::{
    ChunkSink, DatasetParams, ImportConfig, ImportError, Metadata, ProgressReporter,
    RetryStrategy, SourceFetcher,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    cleanup::{AutoCleanupManager, CleanupReport},
    recovery::{ImportSummary, PartialImportRecovery, RecoveryReport},
    router::StorageRouter,
    stream_processor::StreamProcessor,
};

/// Imports a dataset from a source fetcher into one or two sinks.
///
/// A run streams the dataset in chunks and writes every chunk to the sinks selected by the
/// configured storage mode. Chunks that fail to write are recorded and, when partial import is
/// enabled, offered again after the stream ended. A run that fails fatally releases everything
/// registered for cleanup before reporting.
///
/// The outcome of a run is always an [`ImportReport`], also when the run failed.
///
/// # Example
///
/// ```no_run
/// # use sluice_core::{ImportConfig, StorageMode};
/// # use sluice_ingest::{ImportPipeline, sinks::MemorySink, sources::StaticSource};
/// # async fn example() -> anyhow::Result<()> {
/// let config = ImportConfig::builder()
///     .storage_mode(StorageMode::SinkOnly)
///     .build()?;
/// let sink = MemorySink::default();
///
/// let report = ImportPipeline::from_fetcher(StaticSource::sample(2500), config)
///     .with_sink(sink.clone())
///     .run("sample", Default::default(), None)
///     .await;
///
/// println!("imported {} items in {} chunks", report.total_processed, report.chunks);
/// report.into_result()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ImportPipeline {
    fetcher: Arc<dyn SourceFetcher>,
    config: ImportConfig,
    sink: Option<Arc<dyn ChunkSink>>,
    alternate_sink: Option<Arc<dyn ChunkSink>>,
    progress: Option<Arc<dyn ProgressReporter>>,
    cancellation: Option<CancellationToken>,
    fetch_strategy: Option<RetryStrategy>,
    recovery_strategy: Option<RetryStrategy>,
}

impl std::fmt::Debug for ImportPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportPipeline")
            .field("fetcher", &self.fetcher)
            .field("config", &self.config)
            .field("sink", &self.sink)
            .field("alternate_sink", &self.alternate_sink)
            .finish_non_exhaustive()
    }
}

/// Outcome of a single import run
#[derive(Debug, Serialize)]
pub struct ImportReport {
    pub run_id: String,
    /// Identifier the chunks were written under
    pub dataset_id: String,
    pub dataset_kind: String,
    pub total_processed: usize,
    pub chunks: usize,
    pub summary: ImportSummary,
    /// Present when a recovery pass ran
    pub recovery: Option<RecoveryReport>,
    /// Present when the run failed and cleanup ran
    pub cleanup: Option<CleanupReport>,
    /// The error that ended the run early, if any
    #[serde(serialize_with = "serialize_fatal_error")]
    pub fatal_error: Option<ImportError>,
    pub elapsed: Duration,
}

impl ImportReport {
    /// Whether the run finished without a fatal error. Failed chunks may still be reported in
    /// the summary.
    pub fn is_success(&self) -> bool {
        self.fatal_error.is_none()
    }

    /// Whether every chunk of a successful run was persisted
    pub fn is_complete(&self) -> bool {
        self.is_success() && self.summary.failed_chunks == 0
    }

    /// # Errors
    ///
    /// Returns the fatal error of the run, if any.
    pub fn into_result(mut self) -> Result<Self, ImportError> {
        match self.fatal_error.take() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

impl ImportPipeline {
    pub fn from_fetcher(fetcher: impl SourceFetcher + 'static, config: ImportConfig) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            config,
            sink: None,
            alternate_sink: None,
            progress: None,
            cancellation: None,
            fetch_strategy: None,
            recovery_strategy: None,
        }
    }

    /// The primary sink, used in the `dual` and `sink_only` storage modes
    #[must_use]
    pub fn with_sink(mut self, sink: impl ChunkSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// The alternate sink, used in the `dual` and `alternate_only` storage modes
    #[must_use]
    pub fn with_alternate_sink(mut self, sink: impl ChunkSink + 'static) -> Self {
        self.alternate_sink = Some(Arc::new(sink));
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: impl ProgressReporter + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Overrides the retry policy used to fetch the dataset
    #[must_use]
    pub fn with_fetch_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.fetch_strategy = Some(strategy);
        self
    }

    /// Overrides the gentle retry policy used to recover failed chunks
    #[must_use]
    pub fn with_recovery_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.recovery_strategy = Some(strategy);
        self
    }

    /// Imports `dataset_kind`, see [`ImportPipeline`].
    pub async fn run(
        &self,
        dataset_kind: &str,
        params: DatasetParams,
        max_items: Option<usize>,
    ) -> ImportReport {
        let cleanup = AutoCleanupManager::new(&self.config);
        self.run_with_cleanup(dataset_kind, params, max_items, cleanup)
            .await
    }

    /// Imports `dataset_kind` with resources the caller already registered for cleanup, such
    /// as a downloaded archive.
    #[tracing::instrument(skip_all, fields(dataset_kind = dataset_kind, max_items = max_items))]
    pub async fn run_with_cleanup(
        &self,
        dataset_kind: &str,
        params: DatasetParams,
        max_items: Option<usize>,
        mut cleanup: AutoCleanupManager,
    ) -> ImportReport {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let dataset_id = Uuid::new_v4().to_string();

        tracing::info!(
            run_id = run_id.as_str(),
            dataset_id = dataset_id.as_str(),
            storage_mode = %self.config.storage_mode,
            "Starting import"
        );

        let mut recovery = PartialImportRecovery::new(&self.config);
        if let Some(strategy) = &self.recovery_strategy {
            recovery = recovery.with_retry_strategy(strategy.clone());
        }
        if let Some(token) = &self.cancellation {
            recovery = recovery.with_cancellation_token(token.clone());
        }

        let mut report = ImportReport {
            run_id,
            dataset_id,
            dataset_kind: dataset_kind.to_string(),
            total_processed: 0,
            chunks: 0,
            summary: ImportSummary::default(),
            recovery: None,
            cleanup: None,
            fatal_error: None,
            elapsed: Duration::ZERO,
        };

        let result = self
            .drive(&mut report, &mut recovery, &mut cleanup, params, max_items)
            .await;

        report.summary = recovery.finalize();
        report.cleanup = cleanup.finish(&report.run_id, &result).await;
        report.fatal_error = result.err();
        report.elapsed = started.elapsed();

        match &report.fatal_error {
            None => tracing::info!(
                total_processed = report.total_processed,
                chunks = report.chunks,
                failed_chunks = report.summary.failed_chunks,
                elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
                "Import finished"
            ),
            Some(error) => tracing::error!(
                total_processed = report.total_processed,
                chunks = report.chunks,
                error_kind = error.kind(),
                error = ?error,
                "Import failed"
            ),
        }

        report
    }

    async fn drive(
        &self,
        report: &mut ImportReport,
        recovery: &mut PartialImportRecovery,
        cleanup: &mut AutoCleanupManager,
        params: DatasetParams,
        max_items: Option<usize>,
    ) -> Result<(), ImportError> {
        let router = StorageRouter::new(
            self.config.storage_mode,
            self.sink.clone(),
            self.alternate_sink.clone(),
        )?;
        for path in router.temp_paths(&report.dataset_id) {
            cleanup.register_temp_file(path);
        }

        let mut processor = StreamProcessor::from_shared(Arc::clone(&self.fetcher), self.config.clone())
            .with_shared_progress(self.progress.clone());
        if let Some(token) = &self.cancellation {
            processor = processor.with_cancellation_token(token.clone());
        }
        if let Some(strategy) = &self.fetch_strategy {
            processor = processor.with_retry_strategy(strategy.clone());
        }

        let mut chunks = processor.process_stream(&report.dataset_kind, params, max_items)?;

        while let Some(chunk) = chunks.try_next().await? {
            report.chunks += 1;
            report.total_processed = chunk.total_processed();

            let chunk_index = chunk.chunk_index();
            let size = chunk.len();
            let outcome_metadata = Metadata::from([
                ("total_processed", chunk.total_processed()),
                ("size", size),
            ]);

            let (written, retained) = if self.config.enable_partial_import {
                let written = router
                    .write_chunk(
                        chunk.items().to_vec(),
                        chunk.metadata().to_vec(),
                        &report.dataset_id,
                    )
                    .await;
                (written, Some(chunk))
            } else {
                let (items, metadata) = chunk.into_parts();
                let written = router
                    .write_chunk(items, metadata, &report.dataset_id)
                    .await;
                (written, None)
            };

            match written {
                Ok(written) => {
                    tracing::debug!(chunk_index, written, "Chunk written");
                    recovery.record_success(chunk_index, size, outcome_metadata);
                }
                Err(err) => recovery.record_failure(chunk_index, &err, retained, outcome_metadata),
            }
        }

        let failed_chunks = recovery.summary().failed_chunks;
        if failed_chunks > 0 {
            if self.config.enable_partial_import {
                report.recovery = Some(recovery.attempt_recovery(&router, &report.dataset_id).await?);
            } else {
                tracing::warn!(
                    failed_chunks,
                    "Partial import is disabled, failed chunks are lost"
                );
            }
        }

        router
            .commit(&report.dataset_id)
            .await
            .map_err(|source| ImportError::Commit {
                dataset_id: report.dataset_id.clone(),
                source,
            })
    }
}

#[allow(clippy::ref_option)]
fn serialize_fatal_error<S: Serializer>(
    error: &Option<ImportError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct FatalError {
        kind: &'static str,
        message: String,
    }

    error
        .as_ref()
        .map(|error| FatalError {
            kind: error.kind(),
            message: error_chain(error),
        })
        .serialize(serializer)
}

fn error_chain(error: &ImportError) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sinks::MemorySink, sources::StaticSource};
    use anyhow::anyhow;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use sluice_core::{MockChunkSink, StorageMode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sink_only(chunk_size: usize) -> ImportConfig {
        ImportConfig::builder()
            .chunk_size(chunk_size)
            .adaptive_chunk_size(false)
            .storage_mode(StorageMode::SinkOnly)
            .build()
            .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_simple_run() {
        let sink = MemorySink::default();
        let report = ImportPipeline::from_fetcher(StaticSource::sample(250), sink_only(100))
            .with_sink(sink.clone())
            .run("sample", DatasetParams::default(), None)
            .await;

        assert!(report.is_complete());
        assert_eq!(report.total_processed, 250);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.summary.successful_chunks, 3);
        assert_eq!(report.recovery, None);
        assert_eq!(report.cleanup, None);
        assert_eq!(sink.len(&report.dataset_id).await, 250);
        assert!(sink.is_committed(&report.dataset_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_is_recovered_after_the_stream() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut sink = MockChunkSink::new();
        sink.expect_temp_paths().returning(|_| Vec::new());
        sink.expect_commit().returning(|_| Ok(()));
        sink.expect_write_chunk().returning(move |items, _, _| {
            // The second write, chunk 1, fails once
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(anyhow!("write timeout"));
            }
            Ok(items.len())
        });

        let report = ImportPipeline::from_fetcher(StaticSource::sample(30), sink_only(10))
            .with_sink(sink)
            .with_recovery_strategy(RetryStrategy::gentle().with_jitter(false))
            .run("sample", DatasetParams::default(), None)
            .await;

        assert!(report.is_complete());
        assert_eq!(
            report.recovery,
            Some(RecoveryReport {
                recovered_chunks: 1,
                still_failed_chunks: 0,
                total_attempted: 1,
            })
        );
        assert_eq!(report.summary.successful_chunks, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failed_chunks_without_partial_import_are_lost() {
        let mut sink = MockChunkSink::new();
        sink.expect_temp_paths().returning(|_| Vec::new());
        sink.expect_commit().returning(|_| Ok(()));
        sink.expect_write_chunk()
            .returning(|_, _, _| Err(anyhow!("read only")));

        let config = ImportConfig::builder()
            .chunk_size(10)
            .adaptive_chunk_size(false)
            .storage_mode(StorageMode::SinkOnly)
            .enable_partial_import(false)
            .build()
            .unwrap();

        let report = ImportPipeline::from_fetcher(StaticSource::sample(20), config)
            .with_sink(sink)
            .run("sample", DatasetParams::default(), None)
            .await;

        assert!(report.is_success());
        assert!(!report.is_complete());
        assert_eq!(report.summary.failed_chunks, 2);
        assert!(!report.summary.can_recover);
        assert_eq!(report.recovery, None);
    }

    #[tokio::test]
    async fn test_missing_sink_fails_before_fetching() {
        let report = ImportPipeline::from_fetcher(StaticSource::sample(10), ImportConfig::default())
            .with_sink(MemorySink::default())
            .run("sample", DatasetParams::default(), None)
            .await;

        let Some(ImportError::Configuration(violations)) = &report.fatal_error else {
            panic!("expected a configuration error, got {:?}", report.fatal_error);
        };
        assert_eq!(violations.len(), 1);
        assert_eq!(report.total_processed, 0);
    }

    #[tokio::test]
    async fn test_fatal_errors_run_cleanup_and_are_reported() {
        let dir = temp_dir::TempDir::new().unwrap();
        let archive = dir.path().join("archive.zip");
        std::fs::write(&archive, "zip").unwrap();

        let mut cleanup = AutoCleanupManager::new(&sink_only(10));
        cleanup.register_temp_file(&archive);

        let source = StaticSource::default().with_dataset("broken", json!(["a", null]));
        let report = ImportPipeline::from_fetcher(source, sink_only(10))
            .with_sink(MemorySink::default())
            .run_with_cleanup("broken", DatasetParams::default(), None, cleanup)
            .await;

        assert!(!report.is_success());
        assert_eq!(report.cleanup.unwrap().files_cleaned, 1);
        assert!(!archive.exists());

        let serialized = serde_json::to_value(&report).unwrap();
        assert_eq!(serialized["fatal_error"]["kind"], "dataset_fetch");
        assert!(
            serialized["fatal_error"]["message"]
                .as_str()
                .unwrap()
                .contains("record 1 is null")
        );

        assert!(matches!(
            report.into_result(),
            Err(ImportError::DatasetFetch { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_dataset_is_fatal() {
        let report = ImportPipeline::from_fetcher(StaticSource::sample(10), sink_only(10))
            .with_sink(MemorySink::default())
            .run("unknown", DatasetParams::default(), None)
            .await;

        assert!(matches!(
            report.fatal_error,
            Some(ImportError::UnsupportedDataset(_))
        ));
        assert_eq!(report.cleanup, Some(CleanupReport::default()));
    }

    #[tokio::test]
    async fn test_cancelled_runs_are_distinguished() {
        let token = CancellationToken::new();
        token.cancel();

        let report = ImportPipeline::from_fetcher(StaticSource::sample(10), sink_only(10))
            .with_sink(MemorySink::default())
            .with_cancellation_token(token)
            .run("sample", DatasetParams::default(), None)
            .await;

        assert!(report.fatal_error.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_commit_failures_are_fatal() {
        let mut sink = MockChunkSink::new();
        sink.expect_temp_paths().returning(|_| Vec::new());
        sink.expect_write_chunk()
            .returning(|items, _, _| Ok(items.len()));
        sink.expect_commit()
            .returning(|_| Err(anyhow!("rename failed")));

        let report = ImportPipeline::from_fetcher(StaticSource::sample(5), sink_only(10))
            .with_sink(sink)
            .run("sample", DatasetParams::default(), None)
            .await;

        assert!(matches!(report.fatal_error, Some(ImportError::Commit { .. })));
        assert_eq!(report.summary.successful_chunks, 1);
    }
}
