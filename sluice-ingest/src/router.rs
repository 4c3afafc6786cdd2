//! Route chunk writes according to the configured storage mode
use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use sluice_core::{ChunkSink, ConfigViolation, ImportError, Metadata, StorageMode};

/// A [`ChunkSink`] writing to the primary sink, the alternate sink, or both.
///
/// In [`StorageMode::Dual`] a chunk only succeeds when both sinks accepted it. Since failed chunks
/// are offered again, both sinks should replace rather than append.
#[derive(Debug, Clone)]
pub struct StorageRouter {
    mode: StorageMode,
    primary: Option<Arc<dyn ChunkSink>>,
    alternate: Option<Arc<dyn ChunkSink>>,
}

impl StorageRouter {
    /// # Errors
    ///
    /// Returns [`ImportError::Configuration`] when the mode requires a sink that is missing.
    pub fn new(
        mode: StorageMode,
        primary: Option<Arc<dyn ChunkSink>>,
        alternate: Option<Arc<dyn ChunkSink>>,
    ) -> Result<Self, ImportError> {
        let mut violations = Vec::new();
        if matches!(mode, StorageMode::Dual | StorageMode::SinkOnly) && primary.is_none() {
            violations.push(ConfigViolation::new(
                "storage_mode",
                format!("`{mode}` requires a sink"),
            ));
        }
        if matches!(mode, StorageMode::Dual | StorageMode::AlternateOnly) && alternate.is_none() {
            violations.push(ConfigViolation::new(
                "storage_mode",
                format!("`{mode}` requires an alternate sink"),
            ));
        }
        if !violations.is_empty() {
            return Err(ImportError::Configuration(violations));
        }

        Ok(Self {
            mode,
            primary,
            alternate,
        })
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    fn targets(&self) -> Vec<(&'static str, &Arc<dyn ChunkSink>)> {
        let primary = self.primary.as_ref().map(|sink| ("sink", sink));
        let alternate = self.alternate.as_ref().map(|sink| ("alternate sink", sink));

        match self.mode {
            StorageMode::Dual => primary.into_iter().chain(alternate).collect(),
            StorageMode::SinkOnly => primary.into_iter().collect(),
            StorageMode::AlternateOnly => alternate.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ChunkSink for StorageRouter {
    async fn write_chunk(
        &self,
        items: Vec<String>,
        metadata: Vec<Metadata>,
        dataset_id: &str,
    ) -> Result<usize> {
        match self.targets().as_slice() {
            [] => anyhow::bail!("no sink configured for `{}`", self.mode),
            [(name, sink)] => sink
                .write_chunk(items, metadata, dataset_id)
                .await
                .with_context(|| format!("Failed to write chunk to {name}")),
            [(first_name, first), (second_name, second), ..] => {
                let first_write = first.write_chunk(items.clone(), metadata.clone(), dataset_id);
                let second_write = second.write_chunk(items, metadata, dataset_id);

                let (written, _) = futures_util::future::try_join(
                    async {
                        first_write
                            .await
                            .with_context(|| format!("Failed to write chunk to {first_name}"))
                    },
                    async {
                        second_write
                            .await
                            .with_context(|| format!("Failed to write chunk to {second_name}"))
                    },
                )
                .await?;
                Ok(written)
            }
        }
    }

    async fn commit(&self, dataset_id: &str) -> Result<()> {
        for (name, sink) in self.targets() {
            sink.commit(dataset_id)
                .await
                .with_context(|| format!("Failed to commit {name}"))?;
        }
        Ok(())
    }

    fn temp_paths(&self, dataset_id: &str) -> Vec<PathBuf> {
        self.targets()
            .into_iter()
            .flat_map(|(_, sink)| sink.temp_paths(dataset_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::MemorySink;
    use anyhow::anyhow;
    use sluice_core::MockChunkSink;
    use test_case::test_case;

    fn items() -> (Vec<String>, Vec<Metadata>) {
        (vec!["a".to_string()], vec![Metadata::from([("index", 0)])])
    }

    #[test_case(StorageMode::Dual, 1, 1 ; "dual")]
    #[test_case(StorageMode::SinkOnly, 1, 0 ; "sink only")]
    #[test_case(StorageMode::AlternateOnly, 0, 1 ; "alternate only")]
    #[tokio::test]
    async fn test_routes_by_mode(mode: StorageMode, in_primary: usize, in_alternate: usize) {
        let primary = MemorySink::default();
        let alternate = MemorySink::default();
        let router = StorageRouter::new(
            mode,
            Some(Arc::new(primary.clone())),
            Some(Arc::new(alternate.clone())),
        )
        .unwrap();

        let (items, metadata) = items();
        router.write_chunk(items, metadata, "ds").await.unwrap();

        assert_eq!(primary.len("ds").await, in_primary);
        assert_eq!(alternate.len("ds").await, in_alternate);
    }

    #[test]
    fn test_missing_sinks_are_configuration_errors() {
        let err = StorageRouter::new(StorageMode::Dual, None, None).unwrap_err();
        assert_eq!(err.violations().len(), 2);

        let sink: Arc<dyn ChunkSink> = Arc::new(MemorySink::default());
        assert!(StorageRouter::new(StorageMode::SinkOnly, Some(sink.clone()), None).is_ok());
        assert!(StorageRouter::new(StorageMode::AlternateOnly, Some(sink), None).is_err());
    }

    #[tokio::test]
    async fn test_dual_fails_when_one_sink_fails() {
        let mut failing = MockChunkSink::new();
        failing
            .expect_write_chunk()
            .returning(|_, _, _| Err(anyhow!("alternate unavailable")));

        let router = StorageRouter::new(
            StorageMode::Dual,
            Some(Arc::new(MemorySink::default())),
            Some(Arc::new(failing)),
        )
        .unwrap();

        let (items, metadata) = items();
        let err = router.write_chunk(items, metadata, "ds").await.unwrap_err();
        assert!(format!("{err:#}").contains("alternate unavailable"));
        assert!(err.to_string().contains("alternate sink"));
    }

    #[test]
    fn test_temp_paths_of_routed_sinks() {
        let mut primary = MockChunkSink::new();
        primary
            .expect_temp_paths()
            .returning(|id| vec![PathBuf::from(format!("/tmp/{id}.partial"))]);
        let mut alternate = MockChunkSink::new();
        alternate.expect_temp_paths().never();

        let router = StorageRouter::new(
            StorageMode::SinkOnly,
            Some(Arc::new(primary)),
            Some(Arc::new(alternate)),
        )
        .unwrap();

        assert_eq!(
            router.temp_paths("ds"),
            vec![PathBuf::from("/tmp/ds.partial")]
        );
    }
}
