//! Acquisition, reconciliation and the run pipeline.

pub mod acquisition;
pub mod pipeline;
pub mod store;

pub use acquisition::{Acquisition, AcquisitionError, AcquisitionEvent, AcquisitionRequest};
pub use pipeline::{run, Pipeline, RunOptions, RunSummary, ScrapeOptions, SyncConfig};
pub use store::{BidStore, MergeOutcome};

pub const CRATE_NAME: &str = "mps-sync";

/// Connects to `database_url` and applies pending migrations.
pub async fn migrate(database_url: &str) -> anyhow::Result<()> {
    let store = BidStore::connect(database_url).await?;
    store.migrate().await
}
