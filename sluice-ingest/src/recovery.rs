//! Bookkeeping of chunk outcomes and best effort recovery of failed chunks
//!
//! Chunk write failures do not end a run. They are recorded here together with the items of the
//! chunk, and [`PartialImportRecovery::attempt_recovery`] offers those items to the sink again
//! with a short retry policy.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sluice_core::{
    Chunk, ChunkSink, ImportConfig, ImportError, Metadata, RetryStrategy, errors::error_kind,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuccessfulChunk {
    pub chunk_index: usize,
    pub size: usize,
    pub created_at: DateTime<Utc>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedChunk {
    pub chunk_index: usize,
    pub error_message: String,
    pub error_kind: &'static str,
    pub created_at: DateTime<Utc>,
    /// Items kept to retry the chunk; dropped once recovery is decided or the run ends
    #[serde(skip)]
    pub retained: Option<Chunk>,
    pub metadata: Metadata,
}

/// Tally of a recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub recovered_chunks: usize,
    pub still_failed_chunks: usize,
    pub total_attempted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ImportSummary {
    pub total_chunks: usize,
    pub successful_chunks: usize,
    pub failed_chunks: usize,
    /// Share of successful chunks, 0 when no chunk was processed
    pub success_rate: f64,
    pub can_recover: bool,
    pub partial_data_available: bool,
}

/// Tracks which chunks of a run were persisted and which failed.
///
/// Records are keyed by chunk index: recording the same index again replaces the earlier
/// record, and a success supersedes a failure.
#[derive(Debug)]
pub struct PartialImportRecovery {
    enabled: bool,
    successful: BTreeMap<usize, SuccessfulChunk>,
    failed: BTreeMap<usize, FailedChunk>,
    still_failed_total: usize,
    finalized: bool,
    retry_strategy: RetryStrategy,
    cancellation: Option<CancellationToken>,
}

impl PartialImportRecovery {
    pub fn new(config: &ImportConfig) -> Self {
        Self {
            enabled: config.enable_partial_import,
            successful: BTreeMap::new(),
            failed: BTreeMap::new(),
            still_failed_total: 0,
            finalized: false,
            retry_strategy: RetryStrategy::gentle(),
            cancellation: None,
        }
    }

    /// Replaces the gentle retry policy used to re-offer failed chunks
    #[must_use]
    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Records a persisted chunk of `size` items.
    ///
    /// # Panics
    ///
    /// Panics when called after [`PartialImportRecovery::finalize`].
    pub fn record_success(&mut self, chunk_index: usize, size: usize, metadata: Metadata) {
        assert!(!self.finalized, "chunk outcome recorded after finalize");

        if self.failed.remove(&chunk_index).is_some() {
            tracing::debug!(chunk_index, "Chunk previously failed, now successful");
        }
        self.successful.insert(
            chunk_index,
            SuccessfulChunk {
                chunk_index,
                size,
                created_at: Utc::now(),
                metadata,
            },
        );
    }

    /// Records a chunk that could not be persisted, keeping `retained` for recovery.
    ///
    /// # Panics
    ///
    /// Panics when called after [`PartialImportRecovery::finalize`].
    pub fn record_failure(
        &mut self,
        chunk_index: usize,
        error: &anyhow::Error,
        retained: Option<Chunk>,
        metadata: Metadata,
    ) {
        assert!(!self.finalized, "chunk outcome recorded after finalize");

        if self.successful.contains_key(&chunk_index) {
            tracing::warn!(
                chunk_index,
                "Ignoring failure of a chunk that already succeeded"
            );
            return;
        }

        tracing::warn!(chunk_index, error = ?error, "Chunk failed");
        self.failed.insert(
            chunk_index,
            FailedChunk {
                chunk_index,
                error_message: error.to_string(),
                error_kind: error_kind(error),
                created_at: Utc::now(),
                retained,
                metadata,
            },
        );
    }

    /// Offers every failed chunk to `sink` again.
    ///
    /// Chunks without retained items cannot be rebuilt and stay failed. A chunk whose retries
    /// are exhausted stays failed as well and its retained items are dropped.
    ///
    /// # Errors
    ///
    /// [`ImportError::PartialImportDisabled`] when partial import is disabled and
    /// [`ImportError::Cancelled`] when the cancellation token fires; any chunk not yet recovered
    /// at that point keeps its failed record. Failures of the sink itself are never returned.
    #[tracing::instrument(skip_all, fields(dataset_id = dataset_id), err)]
    pub async fn attempt_recovery(
        &mut self,
        sink: &dyn ChunkSink,
        dataset_id: &str,
    ) -> Result<RecoveryReport, ImportError> {
        if !self.enabled {
            return Err(ImportError::PartialImportDisabled);
        }

        let strategy = match &self.cancellation {
            Some(token) => self
                .retry_strategy
                .clone()
                .with_cancellation_token(token.clone()),
            None => self.retry_strategy.clone(),
        };

        let mut report = RecoveryReport::default();
        let mut pending = std::mem::take(&mut self.failed).into_iter();

        while let Some((chunk_index, mut record)) = pending.next() {
            if self
                .cancellation
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
            {
                self.failed.insert(chunk_index, record);
                self.failed.extend(pending);
                return Err(ImportError::Cancelled);
            }

            report.total_attempted += 1;

            let Some(chunk) = record.retained.take() else {
                tracing::warn!(chunk_index, "No retained items, chunk cannot be recovered");
                report.still_failed_chunks += 1;
                self.still_failed_total += 1;
                self.failed.insert(chunk_index, record);
                continue;
            };

            let operation = format!("recover chunk {chunk_index}");
            let outcome = strategy
                .execute(&operation, || {
                    let items = chunk.items().to_vec();
                    let metadata = chunk.metadata().to_vec();
                    async move { sink.write_chunk(items, metadata, dataset_id).await }
                })
                .await;

            match outcome {
                Ok(written) => {
                    tracing::info!(chunk_index, written, "Recovered chunk");
                    report.recovered_chunks += 1;
                    self.record_success(chunk_index, chunk.len(), record.metadata);
                }
                Err(ImportError::Cancelled) => {
                    record.retained = Some(chunk);
                    self.failed.insert(chunk_index, record);
                    self.failed.extend(pending);
                    return Err(ImportError::Cancelled);
                }
                Err(err) => {
                    if let ImportError::RetryExhausted { last_error, .. } = &err {
                        record.error_message = last_error.to_string();
                        record.error_kind = error_kind(last_error);
                    } else {
                        record.error_message = err.to_string();
                        record.error_kind = err.kind();
                    }
                    tracing::warn!(chunk_index, error = %record.error_message, "Chunk still failed");
                    report.still_failed_chunks += 1;
                    self.still_failed_total += 1;
                    self.failed.insert(chunk_index, record);
                }
            }
        }

        tracing::info!(
            recovered = report.recovered_chunks,
            still_failed = report.still_failed_chunks,
            attempted = report.total_attempted,
            "Recovery finished"
        );
        Ok(report)
    }

    pub fn summary(&self) -> ImportSummary {
        let successful_chunks = self.successful.len();
        let failed_chunks = self.failed.len();
        let total_chunks = successful_chunks + failed_chunks;

        #[allow(clippy::cast_precision_loss)]
        let success_rate = if total_chunks == 0 {
            0.0
        } else {
            successful_chunks as f64 / total_chunks as f64
        };

        ImportSummary {
            total_chunks,
            successful_chunks,
            failed_chunks,
            success_rate,
            can_recover: self.enabled && failed_chunks > 0,
            partial_data_available: successful_chunks > 0,
        }
    }

    /// Ends the run: drops every retained payload and rejects further records
    pub fn finalize(&mut self) -> ImportSummary {
        self.finalized = true;
        for record in self.failed.values_mut() {
            record.retained = None;
        }
        self.summary()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Number of recovery attempts, over all passes, that left a chunk failed
    pub fn still_failed_total(&self) -> usize {
        self.still_failed_total
    }

    pub fn successful_chunks(&self) -> impl Iterator<Item = &SuccessfulChunk> {
        self.successful.values()
    }

    pub fn failed_chunks(&self) -> impl Iterator<Item = &FailedChunk> {
        self.failed.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use mockall::Sequence;
    use pretty_assertions::assert_eq;
    use sluice_core::MockChunkSink;
    use std::time::Duration;

    fn chunk(index: usize) -> Chunk {
        Chunk::new(
            vec![format!("item {index}")],
            vec![Metadata::default()],
            index,
            index + 1,
            None,
        )
    }

    fn recovery(enabled: bool) -> PartialImportRecovery {
        let config = ImportConfig::builder()
            .enable_partial_import(enabled)
            .build()
            .unwrap();
        PartialImportRecovery::new(&config)
            .with_retry_strategy(RetryStrategy::gentle().with_jitter(false))
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_failed_chunk_is_recovered() {
        let mut recovery = recovery(true);
        recovery.record_success(0, 1, Metadata::default());
        recovery.record_failure(1, &anyhow!("sink down"), Some(chunk(1)), Metadata::default());
        recovery.record_success(2, 1, Metadata::default());

        let before = recovery.summary();
        assert_eq!(before.failed_chunks, 1);
        assert!(before.can_recover);

        let mut sink = MockChunkSink::new();
        sink.expect_write_chunk()
            .withf(|items, _, dataset_id| items == &["item 1".to_string()] && dataset_id == "ds")
            .times(1)
            .returning(|items, _, _| Ok(items.len()));

        let report = recovery.attempt_recovery(&sink, "ds").await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                recovered_chunks: 1,
                still_failed_chunks: 0,
                total_attempted: 1,
            }
        );

        let summary = recovery.summary();
        assert_eq!(summary.successful_chunks, 3);
        assert_eq!(summary.failed_chunks, 0);
        assert!((summary.success_rate - 1.0).abs() < f64::EPSILON);
        assert!(!summary.can_recover);

        let again = recovery.attempt_recovery(&sink, "ds").await.unwrap();
        assert_eq!(again.total_attempted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_retries_with_the_gentle_policy() {
        let mut recovery = recovery(true);
        recovery.record_failure(0, &anyhow!("timeout"), Some(chunk(0)), Metadata::default());

        let mut seq = Sequence::new();
        let mut sink = MockChunkSink::new();
        sink.expect_write_chunk()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(anyhow!("still down")));
        sink.expect_write_chunk()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|items, _, _| Ok(items.len()));

        let report = recovery.attempt_recovery(&sink, "ds").await.unwrap();
        assert_eq!(report.recovered_chunks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_recovery_keeps_the_chunk_failed() {
        let mut recovery = recovery(true);
        recovery.record_failure(4, &anyhow!("timeout"), Some(chunk(4)), Metadata::default());

        let mut sink = MockChunkSink::new();
        sink.expect_write_chunk()
            .times(3)
            .returning(|_, _, _| Err(anyhow!("disk full")));

        let report = recovery.attempt_recovery(&sink, "ds").await.unwrap();
        assert_eq!(report.still_failed_chunks, 1);
        assert_eq!(recovery.still_failed_total(), 1);

        let failed: Vec<_> = recovery.failed_chunks().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].chunk_index, 4);
        assert_eq!(failed[0].error_message, "disk full");
        assert_eq!(failed[0].error_kind, "external");
        assert!(failed[0].retained.is_none());
    }

    #[tokio::test]
    async fn test_chunks_without_retained_items_stay_failed() {
        let mut recovery = recovery(true);
        recovery.record_failure(0, &anyhow!("lost"), None, Metadata::default());

        let mut sink = MockChunkSink::new();
        sink.expect_write_chunk().never();

        let report = recovery.attempt_recovery(&sink, "ds").await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                recovered_chunks: 0,
                still_failed_chunks: 1,
                total_attempted: 1,
            }
        );
        assert_eq!(recovery.summary().failed_chunks, 1);
    }

    #[tokio::test]
    async fn test_disabled_recovery_fails_fast() {
        let mut recovery = recovery(false);
        recovery.record_failure(0, &anyhow!("lost"), Some(chunk(0)), Metadata::default());

        let sink = MockChunkSink::new();
        let err = recovery.attempt_recovery(&sink, "ds").await.unwrap_err();

        assert!(matches!(err, ImportError::PartialImportDisabled));
        assert!(!recovery.summary().can_recover);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_restores_pending_records() {
        let token = CancellationToken::new();
        let mut recovery = recovery(true)
            .with_retry_strategy(RetryStrategy::new(3, Duration::from_secs(10)))
            .with_cancellation_token(token.clone());
        for index in 0..3 {
            recovery.record_failure(index, &anyhow!("down"), Some(chunk(index)), Metadata::default());
        }

        let mut sink = MockChunkSink::new();
        sink.expect_write_chunk().returning(move |_, _, _| {
            token.cancel();
            Err(anyhow!("down"))
        });

        let err = recovery.attempt_recovery(&sink, "ds").await.unwrap_err();
        assert!(err.is_cancelled());

        let failed: Vec<_> = recovery.failed_chunks().collect();
        assert_eq!(failed.len(), 3);
        assert!(failed.iter().all(|record| record.retained.is_some()));
    }

    #[test]
    fn test_summary_without_chunks() {
        let summary = recovery(true).summary();
        assert_eq!(summary, ImportSummary::default());
    }

    #[test]
    fn test_success_supersedes_failure() {
        let mut recovery = recovery(true);
        recovery.record_failure(0, &anyhow!("flaky"), Some(chunk(0)), Metadata::default());
        recovery.record_success(0, 1, Metadata::default());
        recovery.record_failure(0, &anyhow!("late"), None, Metadata::default());

        let summary = recovery.summary();
        assert_eq!(summary.successful_chunks, 1);
        assert_eq!(summary.failed_chunks, 0);
        assert!(summary.partial_data_available);
    }

    #[test]
    fn test_finalize_drops_retained_items() {
        let mut recovery = recovery(true);
        recovery.record_failure(0, &anyhow!("down"), Some(chunk(0)), Metadata::default());

        let summary = recovery.finalize();
        assert_eq!(summary.failed_chunks, 1);
        assert!(recovery.is_finalized());
        assert!(recovery.failed_chunks().all(|record| record.retained.is_none()));
    }

    #[test]
    #[should_panic(expected = "recorded after finalize")]
    fn test_recording_after_finalize_panics() {
        let mut recovery = recovery(true);
        recovery.finalize();
        recovery.record_success(0, 0, Metadata::default());
    }
}
