use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::Result;
use async_trait::async_trait;
use derive_builder::Builder;
use serde::Serialize;
use tokio::sync::RwLock;

use sluice_core::{ChunkSink, Metadata};

use crate::extract::INDEX_KEY;

/// An item as persisted by a sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredItem {
    pub text: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum ItemKey {
    Index(u64),
    Counter(usize),
}

type Datasets = HashMap<String, BTreeMap<ItemKey, StoredItem>>;

#[derive(Debug, Default, Builder, Clone)]
#[builder(pattern = "owned")]
/// A simple in-memory sink.
///
/// Great for experimentation and testing.
///
/// Items are keyed per dataset by their position in the source, the `index` tag the pipeline
/// sets, so offering the same chunk twice replaces instead of duplicating. Items without an
/// index get an incremental counter as key.
pub struct MemorySink {
    #[builder(default)]
    data: Arc<RwLock<Datasets>>,
    #[builder(default)]
    committed: Arc<RwLock<HashSet<String>>>,
    #[builder(default = Arc::new(AtomicUsize::new(0)))]
    item_count: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn builder() -> MemorySinkBuilder {
        MemorySinkBuilder::default()
    }

    fn key(&self, metadata: &Metadata) -> ItemKey {
        match metadata.get(INDEX_KEY).and_then(serde_json::Value::as_u64) {
            Some(index) => ItemKey::Index(index),
            None => ItemKey::Counter(self.item_count.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Retrieve an item of a dataset by its `index`
    pub async fn get(&self, dataset_id: &str, index: u64) -> Option<StoredItem> {
        self.data
            .read()
            .await
            .get(dataset_id)
            .and_then(|items| items.get(&ItemKey::Index(index)))
            .cloned()
    }

    /// All items of a dataset, indexed items first in index order
    pub async fn items(&self, dataset_id: &str) -> Vec<StoredItem> {
        self.data
            .read()
            .await
            .get(dataset_id)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, dataset_id: &str) -> usize {
        self.data
            .read()
            .await
            .get(dataset_id)
            .map_or(0, BTreeMap::len)
    }

    pub async fn is_committed(&self, dataset_id: &str) -> bool {
        self.committed.read().await.contains(dataset_id)
    }

    pub async fn dataset_ids(&self) -> Vec<String> {
        self.data.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ChunkSink for MemorySink {
    /// Stores the items of a chunk, replacing items with the same index
    async fn write_chunk(
        &self,
        items: Vec<String>,
        metadata: Vec<Metadata>,
        dataset_id: &str,
    ) -> Result<usize> {
        let mut lock = self.data.write().await;
        let dataset = lock.entry(dataset_id.to_string()).or_default();

        let mut written = 0;
        for (text, metadata) in items.into_iter().zip(metadata) {
            dataset.insert(self.key(&metadata), StoredItem { text, metadata });
            written += 1;
        }

        Ok(written)
    }

    async fn commit(&self, dataset_id: &str) -> Result<()> {
        self.committed
            .write()
            .await
            .insert(dataset_id.to_string());
        Ok(())
    }
}
