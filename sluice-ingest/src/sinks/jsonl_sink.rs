//! Persist chunks as JSON lines on disk
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt as _;

use sluice_core::{ChunkSink, Metadata};

use crate::extract::INDEX_KEY;

const PARTIAL_SUFFIX: &str = ".jsonl.partial";
const FINAL_SUFFIX: &str = ".jsonl";
const PART_EXTENSION: &str = "jsonl";

#[derive(Serialize)]
struct Line<'a> {
    text: &'a str,
    metadata: &'a Metadata,
}

/// Writes every item as a JSON object on its own line.
///
/// Each chunk is written to its own part file in `<dir>/<dataset_id>.jsonl.partial/`, named after
/// the `index` of its first item. Offering the same chunk again replaces its part, so recovered
/// chunks are never duplicated. On commit the parts are concatenated in index order into
/// `<dataset_id>.jsonl`. The partial directory is reported as a temp path, so a failed run
/// removes it.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    dir: PathBuf,
    unindexed: Arc<AtomicUsize>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            unindexed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding the parts of a dataset until it is committed
    pub fn partial_path(&self, dataset_id: &str) -> PathBuf {
        self.dir.join(format!("{dataset_id}{PARTIAL_SUFFIX}"))
    }

    pub fn final_path(&self, dataset_id: &str) -> PathBuf {
        self.dir.join(format!("{dataset_id}{FINAL_SUFFIX}"))
    }

    /// Zero padded so that parts sort in index order; chunks without an index sort last
    fn part_name(&self, metadata: &[Metadata]) -> String {
        match metadata
            .first()
            .and_then(|metadata| metadata.get(INDEX_KEY))
            .and_then(serde_json::Value::as_u64)
        {
            Some(index) => format!("{index:020}.{PART_EXTENSION}"),
            None => format!(
                "u{:020}.{PART_EXTENSION}",
                self.unindexed.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }
}

#[async_trait]
impl ChunkSink for JsonlSink {
    #[tracing::instrument(skip(self, items, metadata), fields(items = items.len()), err)]
    async fn write_chunk(
        &self,
        items: Vec<String>,
        metadata: Vec<Metadata>,
        dataset_id: &str,
    ) -> Result<usize> {
        let mut buffer = Vec::new();
        for (text, metadata) in items.iter().zip(&metadata) {
            serde_json::to_writer(&mut buffer, &Line { text, metadata })?;
            buffer.push(b'\n');
        }

        let partial = self.partial_path(dataset_id);
        fs_err::tokio::create_dir_all(&partial).await?;

        let part = partial.join(self.part_name(&metadata));
        let staging = part.with_extension("tmp");
        fs_err::tokio::write(&staging, &buffer).await?;
        fs_err::tokio::rename(&staging, &part).await?;

        Ok(items.len())
    }

    async fn commit(&self, dataset_id: &str) -> Result<()> {
        let partial = self.partial_path(dataset_id);
        let target = self.final_path(dataset_id);

        let mut parts = Vec::new();
        match fs_err::tokio::read_dir(&partial).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == PART_EXTENSION) {
                        parts.push(path);
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                fs_err::tokio::create_dir_all(&self.dir).await?;
            }
            Err(err) => return Err(err.into()),
        }
        parts.sort();

        let mut file = fs_err::tokio::File::create(&target)
            .await
            .context("Failed to create dataset file")?;
        for part in &parts {
            file.write_all(&fs_err::tokio::read(part).await?).await?;
        }
        file.flush().await?;

        if !parts.is_empty() {
            fs_err::tokio::remove_dir_all(&partial).await?;
        }

        tracing::debug!(path = %target.display(), parts = parts.len(), "Committed dataset");
        Ok(())
    }

    fn temp_paths(&self, dataset_id: &str) -> Vec<PathBuf> {
        vec![self.partial_path(dataset_id)]
    }
}
