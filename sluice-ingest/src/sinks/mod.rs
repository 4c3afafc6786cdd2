//! Bundled chunk sinks
mod jsonl_sink;
mod memory_sink;

pub use jsonl_sink::JsonlSink;
pub use memory_sink::{MemorySink, MemorySinkBuilder, StoredItem};
