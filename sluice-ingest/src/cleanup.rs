//! Release resources of a failed run
//!
//! Components register what they leave behind while a run progresses: cleanup tasks, temp files
//! and in-memory scratch data. When the run fails, [`AutoCleanupManager::cleanup_on_failure`]
//! releases all of it once. When the run succeeds, the registrations are simply dropped.
use std::{
    any::Any,
    fmt,
    future::Future,
    io::ErrorKind,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    pin::Pin,
};

use futures_util::FutureExt as _;
use serde::Serialize;
use sluice_core::{ImportConfig, ImportError};

type CleanupFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type CleanupTask = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Tally of a cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Tasks that completed without error
    pub tasks_executed: usize,
    /// Tasks that returned an error or panicked
    pub tasks_failed: usize,
    pub files_cleaned: usize,
    pub files_failed: usize,
    pub data_cleared: usize,
}

/// Collects cleanup actions during a run and runs them at most once on failure.
///
/// Cleanup never fails: misbehaving tasks and undeletable files are logged and counted, and the
/// remaining resources are still released.
///
/// # Example
///
/// ```no_run
/// # use sluice_core::{ImportConfig, ImportError};
/// # use sluice_ingest::AutoCleanupManager;
/// # async fn example(result: Result<(), ImportError>) {
/// let mut cleanup = AutoCleanupManager::new(&ImportConfig::default());
/// cleanup.register_temp_file("/tmp/download.partial");
/// cleanup.register_cleanup_task("drop staging table", || async { Ok(()) });
///
/// // Runs the cleanup only if the run failed
/// let report = cleanup.finish("run-1", &result).await;
/// # }
/// ```
pub struct AutoCleanupManager {
    enabled: bool,
    tasks: Vec<(String, CleanupTask)>,
    temp_files: Vec<PathBuf>,
    temp_data: Vec<Box<dyn Any + Send>>,
    executed: bool,
}

impl fmt::Debug for AutoCleanupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoCleanupManager")
            .field("enabled", &self.enabled)
            .field(
                "tasks",
                &self.tasks.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field("temp_files", &self.temp_files)
            .field("temp_data", &self.temp_data.len())
            .field("executed", &self.executed)
            .finish()
    }
}

impl AutoCleanupManager {
    pub fn new(config: &ImportConfig) -> Self {
        Self {
            enabled: config.cleanup_on_failure,
            tasks: Vec::new(),
            temp_files: Vec::new(),
            temp_data: Vec::new(),
            executed: false,
        }
    }

    /// Registers an async cleanup action. Actions run in registration order.
    pub fn register_cleanup_task<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tasks
            .push((name.into(), Box::new(move || Box::pin(task()) as CleanupFuture)));
    }

    /// Registers a file or directory to delete on failure
    pub fn register_temp_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.temp_files.contains(&path) {
            self.temp_files.push(path);
        }
    }

    /// Takes ownership of scratch data, dropped on cleanup
    pub fn register_temp_data<T: Any + Send>(&mut self, data: T) {
        self.temp_data.push(Box::new(data));
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn temp_files(&self) -> &[PathBuf] {
        &self.temp_files
    }

    /// Releases every registered resource.
    ///
    /// Does nothing when cleanup on failure is disabled or cleanup already ran.
    #[tracing::instrument(skip(self, error), fields(error_kind = error.kind()))]
    pub async fn cleanup_on_failure(&mut self, error: &ImportError, run_id: &str) -> CleanupReport {
        let mut report = CleanupReport::default();

        if !self.enabled {
            tracing::info!(%error, "Cleanup on failure is disabled, leaving resources in place");
            return report;
        }
        if self.executed {
            tracing::debug!("Cleanup already ran");
            return report;
        }
        self.executed = true;

        for (name, task) in self.tasks.drain(..) {
            let outcome = AssertUnwindSafe(async move { task().await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => report.tasks_executed += 1,
                Ok(Err(err)) => {
                    tracing::warn!(task = name.as_str(), error = ?err, "Cleanup task failed");
                    report.tasks_failed += 1;
                }
                Err(_) => {
                    tracing::warn!(task = name.as_str(), "Cleanup task panicked");
                    report.tasks_failed += 1;
                }
            }
        }

        for path in std::mem::take(&mut self.temp_files) {
            match remove_path(&path).await {
                Ok(true) => report.files_cleaned += 1,
                Ok(false) => tracing::debug!(path = %path.display(), "Temp path already gone"),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = ?err, "Failed to remove temp path");
                    report.files_failed += 1;
                }
            }
        }

        report.data_cleared = self.temp_data.len();
        self.temp_data.clear();

        tracing::info!(
            tasks_executed = report.tasks_executed,
            tasks_failed = report.tasks_failed,
            files_cleaned = report.files_cleaned,
            files_failed = report.files_failed,
            data_cleared = report.data_cleared,
            "Cleanup finished"
        );
        report
    }

    /// Ends the scope of a run: cleans up once if `result` is an error, otherwise discards the
    /// registrations without running them.
    pub async fn finish<T>(
        mut self,
        run_id: &str,
        result: &Result<T, ImportError>,
    ) -> Option<CleanupReport> {
        match result {
            Ok(_) => {
                tracing::debug!(
                    run_id,
                    discarded_tasks = self.tasks.len(),
                    discarded_files = self.temp_files.len(),
                    "Run succeeded, discarding cleanup registrations"
                );
                None
            }
            Err(error) => Some(self.cleanup_on_failure(error, run_id).await),
        }
    }
}

/// Removes a file, or a directory recursively. `Ok(false)` if nothing was there.
async fn remove_path(path: &Path) -> std::io::Result<bool> {
    let metadata = match fs_err::tokio::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    let removed = if metadata.is_dir() {
        fs_err::tokio::remove_dir_all(path).await
    } else {
        fs_err::tokio::remove_file(path).await
    };

    match removed {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use temp_dir::TempDir;

    fn manager(enabled: bool) -> AutoCleanupManager {
        let config = ImportConfig::builder()
            .cleanup_on_failure(enabled)
            .build()
            .unwrap();
        AutoCleanupManager::new(&config)
    }

    #[test_log::test(tokio::test)]
    async fn test_failing_tasks_do_not_block_the_rest() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut cleanup = manager(true);

        for name in ["first", "failing", "panicking", "last"] {
            let order = Arc::clone(&order);
            cleanup.register_cleanup_task(name, move || async move {
                order.lock().unwrap().push(name);
                match name {
                    "failing" => Err(anyhow!("cannot drop table")),
                    "panicking" => panic!("cleanup bug"),
                    _ => Ok(()),
                }
            });
        }

        let report = cleanup
            .cleanup_on_failure(&ImportError::Cancelled, "run")
            .await;

        assert_eq!(report.tasks_executed, 2);
        assert_eq!(report.tasks_failed, 2);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["first", "failing", "panicking", "last"]
        );
    }

    #[tokio::test]
    async fn test_only_existing_files_are_counted() {
        let dir = TempDir::new().unwrap();
        let mut cleanup = manager(true);

        let mut existing = Vec::new();
        for i in 0..5 {
            let path = dir.path().join(format!("file-{i}"));
            if i % 2 == 0 {
                std::fs::write(&path, "partial").unwrap();
                existing.push(path.clone());
            }
            cleanup.register_temp_file(path);
        }

        let report = cleanup
            .cleanup_on_failure(&ImportError::PartialImportDisabled, "run")
            .await;

        assert_eq!(report.files_cleaned, 3);
        assert_eq!(report.files_failed, 0);
        assert!(existing.iter().all(|path| !path.exists()));
    }

    #[tokio::test]
    async fn test_directories_are_removed_recursively() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("extract");
        std::fs::create_dir_all(nested.join("inner")).unwrap();
        std::fs::write(nested.join("inner").join("data.json"), "{}").unwrap();

        let mut cleanup = manager(true);
        cleanup.register_temp_file(&nested);
        cleanup.register_temp_data(vec![0u8; 1024]);

        let report = cleanup
            .cleanup_on_failure(&ImportError::Cancelled, "run")
            .await;

        assert_eq!(report.files_cleaned, 1);
        assert_eq!(report.data_cleared, 1);
        assert!(!nested.exists());
    }

    #[tokio::test]
    async fn test_cleanup_runs_at_most_once() {
        let runs = Arc::new(Mutex::new(0));
        let mut cleanup = manager(true);
        let counter = Arc::clone(&runs);
        cleanup.register_cleanup_task("count", move || async move {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        let first = cleanup
            .cleanup_on_failure(&ImportError::Cancelled, "run")
            .await;
        let second = cleanup
            .cleanup_on_failure(&ImportError::Cancelled, "run")
            .await;

        assert_eq!(first.tasks_executed, 1);
        assert_eq!(second, CleanupReport::default());
        assert_eq!(*runs.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disabled_cleanup_leaves_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keep");
        std::fs::write(&path, "data").unwrap();

        let mut cleanup = manager(false);
        cleanup.register_temp_file(&path);
        let report = cleanup
            .cleanup_on_failure(&ImportError::Cancelled, "run")
            .await;

        assert_eq!(report, CleanupReport::default());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_finish_only_cleans_up_failed_runs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output");

        std::fs::write(&path, "data").unwrap();
        let mut cleanup = manager(true);
        cleanup.register_temp_file(&path);
        let succeeded: Result<(), ImportError> = Ok(());
        assert_eq!(cleanup.finish("run", &succeeded).await, None);
        assert!(path.exists());

        let mut cleanup = manager(true);
        cleanup.register_temp_file(&path);
        let failed: Result<(), ImportError> = Err(ImportError::Cancelled);
        let report = cleanup.finish("run", &failed).await.unwrap();
        assert_eq!(report.files_cleaned, 1);
        assert!(!path.exists());
    }
}
