// show feature flags in the generated documentation
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod cleanup;
pub mod extract;
pub mod recovery;
pub mod sinks;
pub mod sources;
pub mod stream_processor;

mod pipeline;
mod router;

pub use cleanup::{AutoCleanupManager, CleanupReport};
pub use pipeline::{ImportPipeline, ImportReport};
pub use recovery::{
    FailedChunk, ImportSummary, PartialImportRecovery, RecoveryReport, SuccessfulChunk,
};
pub use router::StorageRouter;
pub use stream_processor::StreamProcessor;
