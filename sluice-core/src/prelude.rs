pub use anyhow::{Context as _, Result};
pub use async_trait::async_trait;
pub use derive_builder::Builder;
pub use futures_util::{StreamExt, TryStreamExt};
pub use std::sync::Arc;
pub use tracing::Instrument;
