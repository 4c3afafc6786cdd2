//! Bundled source fetchers
mod static_source;

pub use static_source::{SAMPLE_DATASET, StaticSource};
