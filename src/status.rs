// ABOUTME: Progress tracking and the aggregated status shown to operators
// ABOUTME: Caches global index counts that seed each backfill run's baseline

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::backfill::{BackfillKind, BackfillSnapshot};
use crate::reindex::ReindexSnapshot;
use crate::remote::IndexStatus;

/// Source of global index counts.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_index_status(&self) -> Result<IndexStatus>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub processed: u64,
    pub total: u64,
}

impl Progress {
    pub fn new(processed: u64, total: u64) -> Self {
        Self { processed, total }
    }

    /// Whole percent complete. Nothing to do counts as done.
    pub fn percent(&self) -> u8 {
        percent(self.processed, self.total)
    }

    /// Record a successful batch. `remaining` is the processor's own count and
    /// may grow the total when new work appeared since the baseline was taken.
    pub fn advance(&mut self, success_count: u64, remaining: Option<u64>) {
        self.processed += success_count;
        self.total = self.total.max(self.processed + remaining.unwrap_or(0));
    }

    pub fn finish(&mut self) {
        self.total = self.total.max(self.processed);
        self.processed = self.total;
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as f64 / total as f64) * 100.0).floor() as u8
}

/// Records still waiting on `kind`.
pub fn missing_for(kind: BackfillKind, status: &IndexStatus) -> u64 {
    match kind {
        BackfillKind::Embeddings => status.missing_embeddings(),
        BackfillKind::Entities => status.ner_pending,
        BackfillKind::DealHeat => status.missing_deal_heat(),
    }
}

fn percent_complete(kind: BackfillKind, status: &IndexStatus) -> u8 {
    match kind {
        BackfillKind::Embeddings => percent(status.chunks_with_embeddings, status.total_chunks),
        BackfillKind::Entities => percent(
            status.ner_completed,
            status.ner_completed + status.ner_pending,
        ),
        BackfillKind::DealHeat => percent(status.calls_with_deal_heat, status.total_calls),
    }
}

/// Last known global counts, shared by all backfill controllers.
pub struct StatusTracker {
    source: Arc<dyn StatusSource>,
    latest: RwLock<Option<IndexStatus>>,
}

impl StatusTracker {
    pub fn new(source: Arc<dyn StatusSource>) -> Self {
        Self {
            source,
            latest: RwLock::new(None),
        }
    }

    pub async fn refresh(&self) -> Result<IndexStatus> {
        let status = self.source.fetch_index_status().await?;
        debug!(
            total_chunks = status.total_chunks,
            missing_embeddings = status.missing_embeddings(),
            ner_pending = status.ner_pending,
            "Index status refreshed"
        );
        *self.latest.write().await = Some(status.clone());
        Ok(status)
    }

    pub async fn current(&self) -> Option<IndexStatus> {
        self.latest.read().await.clone()
    }

    /// Missing count for `kind`, fetching the counts first if none are cached.
    pub async fn baseline(&self, kind: BackfillKind) -> Result<u64> {
        let status = match self.current().await {
            Some(status) => status,
            None => self.refresh().await?,
        };
        Ok(missing_for(kind, &status))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KindSummary {
    pub kind: BackfillKind,
    pub running: bool,
    pub missing: Option<u64>,
    pub percent_complete: Option<u8>,
    pub run_progress: Option<Progress>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub kinds: Vec<KindSummary>,
    pub reindex_job_id: Option<String>,
    pub reindex_running: bool,
    pub reindex_stalled: bool,
    pub reindex_percent: Option<f64>,
    pub reindex_message: Option<String>,
}

impl StatusSummary {
    pub fn build(
        status: Option<&IndexStatus>,
        backfills: &[(BackfillKind, BackfillSnapshot)],
        reindex: &ReindexSnapshot,
    ) -> Self {
        let kinds = backfills
            .iter()
            .map(|(kind, snapshot)| KindSummary {
                kind: *kind,
                running: snapshot.is_running,
                missing: status.map(|s| missing_for(*kind, s)),
                percent_complete: status.map(|s| percent_complete(*kind, s)),
                run_progress: snapshot.progress,
                retry_count: snapshot.retry_count,
            })
            .collect();

        let job = reindex.job.as_ref();
        let progress = job.and_then(|j| j.progress.as_ref());

        Self {
            kinds,
            reindex_job_id: reindex.tracked_job_id.clone(),
            reindex_running: job.map(|j| !j.status.is_terminal()).unwrap_or(false),
            reindex_stalled: reindex.stalled,
            reindex_percent: progress.and_then(|p| p.percent),
            reindex_message: progress.and_then(|p| p.message.clone()),
        }
    }
}
