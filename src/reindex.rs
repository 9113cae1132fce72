// ABOUTME: Tracks the server-side full reindex job: start, resume, poll, cancel
// ABOUTME: Flags jobs whose heartbeat stops advancing and cancels ones that stay silent

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::config::ReindexConfig;
use crate::error::ReindexError;
use crate::events::{JobSource, Notifier};
use crate::remote::{BackgroundJob, JobStatus};

/// Consecutive failed status reads before `watch` gives up.
const MAX_POLL_FAILURES: u32 = 5;

/// Persistence of server-tracked background jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Most recent pending or running job of `job_type`.
    async fn fetch_active_job(&self, job_type: &str) -> Result<Option<BackgroundJob>>;
    async fn fetch_background_job(&self, id: &str) -> Result<BackgroundJob>;
    async fn cancel_background_job(&self, id: &str) -> Result<()>;
    /// Cancel only if the job is still active. Returns whether a row changed.
    async fn cancel_stalled_job(&self, id: &str) -> Result<bool>;
    /// Enqueue a full reindex. Rejects when one is already active.
    async fn start_full_reindex_job(&self, token: &str) -> Result<String, ReindexError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Finished,
    Healthy,
    /// No heartbeat for longer than the stall threshold
    Stalled(Duration),
    /// No heartbeat for longer than the auto-cancel threshold
    Abandoned(Duration),
}

/// Judge a job by how long ago the server last touched it.
pub fn assess(
    job: &BackgroundJob,
    now: DateTime<Utc>,
    stall_threshold: Duration,
    auto_cancel_after: Duration,
) -> Liveness {
    if job.status.is_terminal() {
        return Liveness::Finished;
    }
    // A clock running behind the server reads as zero age.
    let age = (now - job.updated_at).to_std().unwrap_or(Duration::ZERO);
    if age > auto_cancel_after {
        Liveness::Abandoned(age)
    } else if age > stall_threshold {
        Liveness::Stalled(age)
    } else {
        Liveness::Healthy
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReindexSnapshot {
    pub tracked_job_id: Option<String>,
    pub job: Option<BackgroundJob>,
    pub stalled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Nothing is being tracked.
    Idle,
    Running(BackgroundJob),
    Stalled(BackgroundJob),
    Finished(BackgroundJob),
    AutoCancelled { job_id: String, cancelled: bool },
}

impl PollOutcome {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            PollOutcome::Idle | PollOutcome::Finished(_) | PollOutcome::AutoCancelled { .. }
        )
    }
}

pub struct ReindexPoller {
    store: Arc<dyn JobStore>,
    tokens: Arc<dyn TokenProvider>,
    config: ReindexConfig,
    notifier: Notifier,
    tracked: Mutex<Option<String>>,
    snapshot: watch::Sender<ReindexSnapshot>,
}

impl ReindexPoller {
    pub fn new(
        store: Arc<dyn JobStore>,
        tokens: Arc<dyn TokenProvider>,
        config: ReindexConfig,
        notifier: Notifier,
    ) -> Self {
        let (snapshot, _) = watch::channel(ReindexSnapshot::default());
        Self {
            store,
            tokens,
            config,
            notifier,
            tracked: Mutex::new(None),
            snapshot,
        }
    }

    pub fn tracked_job_id(&self) -> Option<String> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn snapshot(&self) -> ReindexSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReindexSnapshot> {
        self.snapshot.subscribe()
    }

    fn track(&self, job_id: Option<String>) {
        *self.tracked.lock().unwrap_or_else(|e| e.into_inner()) = job_id.clone();
        self.snapshot.send_modify(|s| {
            s.tracked_job_id = job_id;
            if s.tracked_job_id.is_none() {
                s.stalled = false;
            }
        });
    }

    fn adopt(&self, job: BackgroundJob) {
        self.track(Some(job.id.clone()));
        self.snapshot.send_modify(|s| s.job = Some(job));
    }

    /// Pick up an active job left running by an earlier session.
    pub async fn resume(&self) -> Result<Option<String>> {
        if let Some(id) = self.tracked_job_id() {
            return Ok(Some(id));
        }

        match self.store.fetch_active_job(&self.config.job_type).await? {
            Some(job) => {
                info!(job_id = %job.id, status = %job.status, "Resuming tracking of active reindex job");
                self.notifier.info(
                    JobSource::Reindex,
                    "Full reindex in progress",
                    format!("Resumed tracking job {}", job.id),
                );
                let id = job.id.clone();
                self.adopt(job);
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Enqueue a full reindex. Fails fast, and tracks the existing job, when
    /// one is already active.
    pub async fn start(&self) -> Result<String, ReindexError> {
        if let Some(job) = self.store.fetch_active_job(&self.config.job_type).await? {
            warn!(job_id = %job.id, "Refusing to start a second full reindex");
            let job_id = job.id.clone();
            self.adopt(job);
            return Err(ReindexError::AlreadyInProgress { job_id });
        }

        let token = self
            .tokens
            .fresh_token()
            .await
            .ok_or(ReindexError::SessionExpired)?;

        let job_id = match self.store.start_full_reindex_job(&token).await {
            Ok(job_id) => job_id,
            Err(ReindexError::AlreadyInProgress { job_id }) => {
                // Lost a race with another client.
                if job_id != "unknown" {
                    self.track(Some(job_id.clone()));
                }
                return Err(ReindexError::AlreadyInProgress { job_id });
            }
            Err(e) => return Err(e),
        };

        info!(job_id = %job_id, "Full reindex started");
        self.track(Some(job_id.clone()));
        self.snapshot.send_modify(|s| s.job = None);
        self.notifier.info(
            JobSource::Reindex,
            "Full reindex started",
            format!("Job {} queued", job_id),
        );
        Ok(job_id)
    }

    pub async fn poll_once(&self) -> Result<PollOutcome> {
        self.poll_once_at(Utc::now()).await
    }

    /// Read the tracked job and act on its liveness as of `now`.
    pub async fn poll_once_at(&self, now: DateTime<Utc>) -> Result<PollOutcome> {
        let Some(job_id) = self.tracked_job_id() else {
            return Ok(PollOutcome::Idle);
        };

        let job = self.store.fetch_background_job(&job_id).await?;
        let liveness = assess(
            &job,
            now,
            self.config.stall_threshold(),
            self.config.auto_cancel_after(),
        );
        debug!(job_id = %job_id, status = %job.status, ?liveness, "Polled reindex job");

        match liveness {
            Liveness::Healthy => {
                self.publish(Some(job.clone()), false);
                Ok(PollOutcome::Running(job))
            }
            Liveness::Stalled(age) => {
                if !self.snapshot.borrow().stalled {
                    warn!(job_id = %job_id, age_secs = age.as_secs(), "Reindex job appears stalled");
                    self.notifier.warning(
                        JobSource::Reindex,
                        "Full reindex appears stalled",
                        format!("No progress reported for {}s", age.as_secs()),
                    );
                }
                self.publish(Some(job.clone()), true);
                Ok(PollOutcome::Stalled(job))
            }
            Liveness::Abandoned(age) => {
                let cancelled = self.store.cancel_stalled_job(&job_id).await?;
                warn!(job_id = %job_id, age_secs = age.as_secs(), cancelled, "Cancelled stalled reindex job");
                self.track(None);
                self.publish(Some(job), false);
                self.notifier.warning(
                    JobSource::Reindex,
                    "Stalled reindex cancelled",
                    format!(
                        "Job {} made no progress for {}s and was cancelled. Start a new reindex to retry",
                        job_id,
                        age.as_secs()
                    ),
                );
                Ok(PollOutcome::AutoCancelled { job_id, cancelled })
            }
            Liveness::Finished => {
                self.track(None);
                self.publish(Some(job.clone()), false);
                self.announce_finished(&job);
                Ok(PollOutcome::Finished(job))
            }
        }
    }

    /// Poll every interval until the tracked job ends.
    pub async fn watch(&self) -> Result<PollOutcome> {
        let mut failures = 0;
        loop {
            match self.poll_once().await {
                Ok(outcome) if outcome.is_final() => return Ok(outcome),
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_POLL_FAILURES {
                        return Err(e.context(format!(
                            "Gave up polling reindex job after {} failed reads",
                            failures
                        )));
                    }
                    warn!(failures, "Failed to poll reindex job: {:#}", e);
                }
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    /// Ask the server to cancel the tracked job and stop tracking it.
    pub async fn cancel(&self) -> Result<String, ReindexError> {
        let job_id = self.tracked_job_id().ok_or(ReindexError::NoActiveJob)?;
        self.store.cancel_background_job(&job_id).await?;
        info!(job_id = %job_id, "Reindex job cancelled");
        self.track(None);
        self.notifier
            .info(JobSource::Reindex, "Full reindex cancelled", format!("Job {}", job_id));
        Ok(job_id)
    }

    fn publish(&self, job: Option<BackgroundJob>, stalled: bool) {
        self.snapshot.send_modify(|s| {
            s.job = job;
            s.stalled = stalled;
        });
    }

    fn announce_finished(&self, job: &BackgroundJob) {
        match job.status {
            JobStatus::Completed => {
                info!(job_id = %job.id, "Full reindex completed");
                self.notifier
                    .success(JobSource::Reindex, "Full reindex complete", "All transcripts were reindexed");
            }
            JobStatus::Failed => {
                let reason = job.error.as_deref().unwrap_or("unknown error");
                warn!(job_id = %job.id, "Full reindex failed: {}", reason);
                self.notifier
                    .error(JobSource::Reindex, "Full reindex failed", reason.to_string());
            }
            JobStatus::Cancelled => {
                self.notifier
                    .info(JobSource::Reindex, "Full reindex cancelled", format!("Job {}", job.id));
            }
            JobStatus::Pending | JobStatus::Running => {}
        }
    }
}
