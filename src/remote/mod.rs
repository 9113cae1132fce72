// ABOUTME: Remote boundary module
// ABOUTME: HTTP client and wire models for batch processors and background jobs

pub mod client;
pub mod models;

pub use client::RemoteClient;
pub use models::{BackgroundJob, BatchResult, IndexStatus, JobProgress, JobStatus};
