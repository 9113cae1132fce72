// ABOUTME: Wires the backfill controllers, reindex poller and status tracker together
// ABOUTME: Single entry point for starting, stopping and summarizing maintenance jobs

use anyhow::Result;
use std::sync::Arc;

use crate::auth::{SessionTokenProvider, TokenProvider};
use crate::backfill::{BackfillController, BackfillKind, BatchEndpoint, BatchInvoker, LoopSettings};
use crate::config::Config;
use crate::events::Notifier;
use crate::reindex::{JobStore, ReindexPoller};
use crate::remote::RemoteClient;
use crate::status::{StatusSource, StatusSummary, StatusTracker};

/// Maintenance jobs for transcript analysis. Each backfill kind owns its own
/// controller and state; the only thing they share is the cached index counts.
pub struct Orchestrator {
    embeddings: BackfillController,
    entities: BackfillController,
    deal_heat: BackfillController,
    reindex: ReindexPoller,
    status: Arc<StatusTracker>,
    notifier: Notifier,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        endpoint: Arc<dyn BatchEndpoint>,
        tokens: Arc<dyn TokenProvider>,
        status_source: Arc<dyn StatusSource>,
        job_store: Arc<dyn JobStore>,
    ) -> Self {
        let notifier = Notifier::new();
        let status = Arc::new(StatusTracker::new(status_source));
        let invoker = Arc::new(BatchInvoker::new(endpoint, Arc::clone(&tokens)));

        let controller = |kind: BackfillKind| {
            BackfillController::new(
                kind,
                LoopSettings::from_config(kind, &config.backfill),
                Arc::clone(&invoker),
                Arc::clone(&tokens),
                Arc::clone(&status),
                notifier.clone(),
            )
        };

        Self {
            embeddings: controller(BackfillKind::Embeddings),
            entities: controller(BackfillKind::Entities),
            deal_heat: controller(BackfillKind::DealHeat),
            reindex: ReindexPoller::new(
                job_store,
                Arc::clone(&tokens),
                config.reindex.clone(),
                notifier.clone(),
            ),
            status,
            notifier,
        }
    }

    /// Build the orchestrator against the configured Supabase project.
    pub fn connect(config: &Config) -> Result<Self> {
        let session = Arc::new(SessionTokenProvider::new(&config.remote)?);
        let client = Arc::new(RemoteClient::new(config, Arc::clone(&session))?);

        Ok(Self::new(
            config,
            client.clone(),
            session,
            client.clone(),
            client,
        ))
    }

    pub fn backfill(&self, kind: BackfillKind) -> &BackfillController {
        match kind {
            BackfillKind::Embeddings => &self.embeddings,
            BackfillKind::Entities => &self.entities,
            BackfillKind::DealHeat => &self.deal_heat,
        }
    }

    pub fn reindex(&self) -> &ReindexPoller {
        &self.reindex
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Request a cooperative stop of every running backfill.
    pub fn stop_all(&self) {
        for kind in BackfillKind::ALL {
            self.backfill(kind).stop();
        }
    }

    pub async fn summary(&self) -> StatusSummary {
        let backfills: Vec<_> = BackfillKind::ALL
            .iter()
            .map(|kind| (*kind, self.backfill(*kind).snapshot()))
            .collect();
        let status = self.status.current().await;
        StatusSummary::build(status.as_ref(), &backfills, &self.reindex.snapshot())
    }
}
