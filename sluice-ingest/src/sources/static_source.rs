//! Serve datasets from memory
use std::collections::HashMap;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use sluice_core::{DatasetParams, SourceFetcher, SourceHandle};

/// Kind under which [`StaticSource::sample`] registers its synthetic dataset
pub const SAMPLE_DATASET: &str = "sample";

/// A [`SourceFetcher`] serving JSON documents held in memory.
///
/// Every fetch hands out a fresh copy, so fetching can be repeated freely. Useful for testing
/// and for hosts that already have the data at hand.
///
/// # Example
///
/// ```
/// # use serde_json::json;
/// # use sluice_ingest::sources::StaticSource;
/// # use sluice_core::SourceFetcher;
/// let source = StaticSource::default()
///     .with_dataset("greetings", json!(["hello", "hi"]))
///     .with_accepted_params("greetings", &["split"]);
///
/// assert!(source.supports("greetings"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    datasets: HashMap<String, Value>,
    accepted_params: HashMap<String, Vec<String>>,
}

impl StaticSource {
    /// A source holding the synthetic `sample` dataset of `items` records
    pub fn sample(items: usize) -> Self {
        let records = (0..items)
            .map(|i| json!({ "text": format!("sample item {i}"), "id": i }))
            .collect();

        StaticSource::default().with_dataset(SAMPLE_DATASET, Value::Array(records))
    }

    #[must_use]
    pub fn with_dataset(mut self, dataset_kind: impl Into<String>, document: Value) -> Self {
        self.datasets.insert(dataset_kind.into(), document);
        self
    }

    /// Declares the parameter keys accepted for a dataset kind. Without a declaration every
    /// parameter is passed through.
    #[must_use]
    pub fn with_accepted_params(
        mut self,
        dataset_kind: impl Into<String>,
        params: &[impl AsRef<str>],
    ) -> Self {
        self.accepted_params.insert(
            dataset_kind.into(),
            params.iter().map(|p| p.as_ref().to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl SourceFetcher for StaticSource {
    /// Static datasets take no parameters, whatever is passed is ignored
    #[tracing::instrument(skip(self, _params))]
    async fn fetch(&self, dataset_kind: &str, _params: DatasetParams) -> Result<SourceHandle> {
        let document = self
            .datasets
            .get(dataset_kind)
            .ok_or_else(|| anyhow!("no dataset registered for `{dataset_kind}`"))?;

        Ok(SourceHandle::from_json(document.clone()))
    }

    fn supports(&self, dataset_kind: &str) -> bool {
        self.datasets.contains_key(dataset_kind)
    }

    fn accepted_params(&self, dataset_kind: &str) -> Option<Vec<String>> {
        self.accepted_params.get(dataset_kind).cloned()
    }
}
