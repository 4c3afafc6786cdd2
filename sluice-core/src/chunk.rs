//! A bounded batch of extracted items, as yielded by the stream processor.
use std::fmt;

use serde::Serialize;

use crate::metadata::Metadata;

/// Characters of the first item shown by `Debug`
const PREVIEW_CHARS: usize = 50;

/// Items with their aligned metadata, plus the position of the batch in the run.
///
/// Chunks are immutable once created; the consumer owns them after they are yielded.
#[derive(Clone, PartialEq, Serialize)]
pub struct Chunk {
    items: Vec<String>,
    metadata: Vec<Metadata>,
    chunk_index: usize,
    total_processed: usize,
    estimated_remaining: Option<usize>,
}

impl Chunk {
    /// Creates a chunk.
    ///
    /// # Panics
    ///
    /// Panics if `items` and `metadata` are not aligned one to one.
    pub fn new(
        items: Vec<String>,
        metadata: Vec<Metadata>,
        chunk_index: usize,
        total_processed: usize,
        estimated_remaining: Option<usize>,
    ) -> Self {
        assert_eq!(
            items.len(),
            metadata.len(),
            "every item needs exactly one metadata entry"
        );

        Self {
            items,
            metadata,
            chunk_index,
            total_processed,
            estimated_remaining,
        }
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn metadata(&self) -> &[Metadata] {
        &self.metadata
    }

    pub fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    /// Items processed in the run up to and including this chunk
    pub fn total_processed(&self) -> usize {
        self.total_processed
    }

    /// Items still expected after this chunk, if the total is known
    pub fn estimated_remaining(&self) -> Option<usize> {
        self.estimated_remaining
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Metadata>) {
        (self.items, self.metadata)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("chunk_index", &self.chunk_index)
            .field("len", &self.items.len())
            .field(
                "first_item",
                &self.items.first().map(|item| preview(item)),
            )
            .field("total_processed", &self.total_processed)
            .field("estimated_remaining", &self.estimated_remaining)
            .finish()
    }
}

fn preview(item: &str) -> String {
    let len = item.chars().count();
    if len <= PREVIEW_CHARS {
        return item.to_string();
    }
    let head: String = item.chars().take(PREVIEW_CHARS).collect();
    format!("{head}.. ({len} chars)")
}
