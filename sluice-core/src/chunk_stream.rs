//! The lazy sequence of chunks handed out by a stream processor
use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::stream::{Stream, StreamExt as _};

use crate::{chunk::Chunk, errors::ImportError};

type BoxedChunks = Pin<Box<dyn Stream<Item = Result<Chunk, ImportError>> + Send>>;

/// Chunks of one dataset, produced only when the consumer polls for the next one.
///
/// A stream built by the stream processor ends after yielding its first error.
#[pin_project::pin_project]
pub struct ChunkStream {
    #[pin]
    chunks: BoxedChunks,
}

impl ChunkStream {
    pub fn new(chunks: impl Stream<Item = Result<Chunk, ImportError>> + Send + 'static) -> Self {
        Self {
            chunks: chunks.boxed(),
        }
    }
}

impl Stream for ChunkStream {
    type Item = Result<Chunk, ImportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().chunks.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream").finish_non_exhaustive()
    }
}
