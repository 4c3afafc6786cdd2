//! Pull driven chunk production from a source fetcher
//!
//! [`StreamProcessor::process_stream`] returns a lazy [`ChunkStream`]. Nothing is fetched until the
//! consumer polls it, and every chunk is only produced once the consumer asks for it, so a slow
//! sink naturally slows down production.
use std::{fmt, sync::Arc};

use futures_util::stream;
use sluice_core::{
    Chunk, ChunkStream, DatasetParams, ImportConfig, ImportError, Metadata, ProgressReporter,
    RetryStrategy, SourceFetcher, source::filter_params,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::extract::Records;

/// Number of leading items sampled to estimate the average item size
pub const SIZE_SAMPLE: usize = 10;

/// Drives a [`SourceFetcher`] and cuts its items into chunks.
///
/// A processor can be reused; every call to [`StreamProcessor::process_stream`] fetches the
/// source again.
///
/// # Example
///
/// ```no_run
/// # use sluice_core::{ImportConfig, prelude::*};
/// # use sluice_ingest::{StreamProcessor, sources::StaticSource};
/// # async fn example() -> anyhow::Result<()> {
/// let processor = StreamProcessor::new(StaticSource::sample(2500), ImportConfig::default());
/// let mut chunks = processor.process_stream("sample", Default::default(), None)?;
///
/// while let Some(chunk) = chunks.try_next().await? {
///     println!("chunk {} with {} items", chunk.chunk_index(), chunk.len());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StreamProcessor {
    fetcher: Arc<dyn SourceFetcher>,
    config: ImportConfig,
    progress: Option<Arc<dyn ProgressReporter>>,
    cancellation: Option<CancellationToken>,
    retry_strategy: Option<RetryStrategy>,
}

impl fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("fetcher", &self.fetcher)
            .field("config", &self.config)
            .field("progress", &self.progress.is_some())
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

impl StreamProcessor {
    pub fn new(fetcher: impl SourceFetcher + 'static, config: ImportConfig) -> Self {
        Self::from_shared(Arc::new(fetcher), config)
    }

    pub fn from_shared(fetcher: Arc<dyn SourceFetcher>, config: ImportConfig) -> Self {
        Self {
            fetcher,
            config,
            progress: None,
            cancellation: None,
            retry_strategy: None,
        }
    }

    /// Reports progress once for every yielded chunk. Closures can be used as reporters.
    #[must_use]
    pub fn with_progress(mut self, progress: impl ProgressReporter + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    #[must_use]
    pub fn with_shared_progress(mut self, progress: Option<Arc<dyn ProgressReporter>>) -> Self {
        self.progress = progress;
        self
    }

    /// Checks the token while fetching, between retries and before every item
    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Overrides the fetch retry policy derived from the configuration
    #[must_use]
    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Streams the dataset as chunks.
    ///
    /// At most `max_items` items are produced, further bounded by `max_import_size` when it is
    /// set. The stream ends after the first error.
    ///
    /// # Errors
    ///
    /// Fails immediately, without any I/O, with [`ImportError::UnsupportedDataset`] when the
    /// fetcher does not support `dataset_kind`. Errors while fetching or extracting are
    /// yielded by the stream.
    pub fn process_stream(
        &self,
        dataset_kind: &str,
        params: DatasetParams,
        max_items: Option<usize>,
    ) -> Result<ChunkStream, ImportError> {
        if !self.fetcher.supports(dataset_kind) {
            return Err(ImportError::UnsupportedDataset(dataset_kind.to_string()));
        }

        let limit = match (max_items, self.config.max_import_size) {
            (Some(max_items), 0) => Some(max_items),
            (Some(max_items), max_import) => Some(max_items.min(max_import)),
            (None, 0) => None,
            (None, max_import) => Some(max_import),
        };

        let retry_strategy = self.retry_strategy.clone().unwrap_or_else(|| {
            RetryStrategy::from(&self.config.effective_retry_config(dataset_kind))
        });
        let retry_strategy = match &self.cancellation {
            Some(token) => retry_strategy.with_cancellation_token(token.clone()),
            None => retry_strategy,
        };

        let fetch = Fetch {
            fetcher: Arc::clone(&self.fetcher),
            dataset_kind: dataset_kind.to_string(),
            params,
            limit,
            config: self.config.clone(),
            retry_strategy,
            progress: self.progress.clone(),
            cancellation: self.cancellation.clone(),
        };

        let span = tracing::info_span!("process_stream", dataset_kind, limit);
        let chunks = stream::try_unfold(State::Fetch(Box::new(fetch)), move |state| {
            async move {
                let mut emitter = match state {
                    State::Fetch(fetch) => fetch.open().await?,
                    State::Emit(emitter) => emitter,
                    State::Done => return Ok(None),
                };

                let Some(chunk) = emitter.next_chunk()? else {
                    return Ok(None);
                };
                let next = if emitter.finished {
                    State::Done
                } else {
                    State::Emit(emitter)
                };
                Ok::<_, ImportError>(Some((chunk, next)))
            }
            .instrument(span.clone())
        });

        Ok(ChunkStream::new(chunks))
    }
}

enum State {
    Fetch(Box<Fetch>),
    Emit(Box<Emitter>),
    Done,
}

struct Fetch {
    fetcher: Arc<dyn SourceFetcher>,
    dataset_kind: String,
    params: DatasetParams,
    limit: Option<usize>,
    config: ImportConfig,
    retry_strategy: RetryStrategy,
    progress: Option<Arc<dyn ProgressReporter>>,
    cancellation: Option<CancellationToken>,
}

impl Fetch {
    async fn open(self: Box<Self>) -> Result<Box<Emitter>, ImportError> {
        let Fetch {
            fetcher,
            dataset_kind,
            params,
            limit,
            config,
            retry_strategy,
            progress,
            cancellation,
        } = *self;

        let params = filter_params(&params, fetcher.accepted_params(&dataset_kind).as_deref());
        let operation = format!("fetch `{dataset_kind}`");

        let handle = retry_strategy
            .execute(&operation, || {
                let fetcher = Arc::clone(&fetcher);
                let params = params.clone();
                let dataset_kind = dataset_kind.clone();
                async move { fetcher.fetch(&dataset_kind, params).await }
            })
            .await
            .map_err(|err| match err {
                ImportError::Cancelled => ImportError::Cancelled,
                exhausted => ImportError::DatasetFetch {
                    dataset_kind: dataset_kind.clone(),
                    item_index: None,
                    source: exhausted.into(),
                },
            })?;

        let source_len = handle.len();
        let total_known = match (source_len, limit) {
            (Some(len), Some(limit)) => Some(len.min(limit)),
            (len, limit) => len.or(limit),
        };
        let avg_item_size = handle.average_item_size(SIZE_SAMPLE);
        let chunk_size = config
            .effective_chunk_size(total_known, avg_item_size)
            .max(1);

        tracing::info!(
            dataset_kind = dataset_kind.as_str(),
            shape = handle.shape(),
            source_len,
            avg_item_size,
            chunk_size,
            "Fetched dataset"
        );

        Ok(Box::new(Emitter {
            dataset_kind,
            records: Records::from_handle(handle),
            chunk_size,
            limit,
            total_known,
            processed: 0,
            chunk_index: 0,
            finished: false,
            progress,
            cancellation,
        }))
    }
}

struct Emitter {
    dataset_kind: String,
    records: Records,
    chunk_size: usize,
    limit: Option<usize>,
    total_known: Option<usize>,
    processed: usize,
    chunk_index: usize,
    finished: bool,
    progress: Option<Arc<dyn ProgressReporter>>,
    cancellation: Option<CancellationToken>,
}

impl Emitter {
    fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.processed >= limit)
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>, ImportError> {
        if self.finished {
            return Ok(None);
        }

        let mut items = Vec::with_capacity(self.chunk_size);
        let mut metadata: Vec<Metadata> = Vec::with_capacity(self.chunk_size);

        while items.len() < self.chunk_size {
            if self.limit_reached() {
                self.finished = true;
                break;
            }
            if self
                .cancellation
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
            {
                tracing::info!(
                    dataset_kind = self.dataset_kind.as_str(),
                    processed = self.processed,
                    "Cancelled while streaming"
                );
                return Err(ImportError::Cancelled);
            }

            match self.records.next_item(self.processed) {
                Some(Ok((text, item_metadata))) => {
                    items.push(text);
                    metadata.push(item_metadata);
                    self.processed += 1;
                }
                Some(Err(source)) => {
                    self.finished = true;
                    return Err(ImportError::DatasetFetch {
                        dataset_kind: self.dataset_kind.clone(),
                        item_index: Some(self.processed),
                        source,
                    });
                }
                None => {
                    self.finished = true;
                    break;
                }
            }
        }

        if self.limit_reached() || self.total_known.is_some_and(|total| self.processed >= total) {
            self.finished = true;
        }

        if items.is_empty() {
            return Ok(None);
        }

        let estimated_remaining = if self.finished {
            Some(0)
        } else {
            self.total_known
                .map(|total| total.saturating_sub(self.processed))
        };

        let chunk = Chunk::new(
            items,
            metadata,
            self.chunk_index,
            self.processed,
            estimated_remaining,
        );
        self.chunk_index += 1;

        tracing::debug!(
            dataset_kind = self.dataset_kind.as_str(),
            chunk_index = chunk.chunk_index(),
            chunk_len = chunk.len(),
            total_processed = self.processed,
            "Yielding chunk"
        );
        if let Some(progress) = &self.progress {
            progress.report(self.processed, self.total_known);
        }

        Ok(Some(chunk))
    }
}
