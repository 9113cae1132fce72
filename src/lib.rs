// ABOUTME: Library root for the transcript backfill orchestrator
// ABOUTME: Drives resumable embedding, entity and deal heat backfills plus full reindex jobs

pub mod auth;
pub mod backfill;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod reindex;
pub mod remote;
pub mod status;

#[cfg(test)]
pub(crate) mod mock;

pub use backfill::{BackfillKind, BackfillReport, LoopOutcome, StartOutcome};
pub use config::Config;
pub use error::{InvokeError, ReindexError};
pub use orchestrator::Orchestrator;
