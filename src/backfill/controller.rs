// ABOUTME: Backfill loop controller: drives one job kind through sequential batches
// ABOUTME: Owns retry counters, proactive token refresh, cooperative stop and progress snapshots

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::invoker::{BatchInvoker, InvokeOptions};
use super::retry::{ConnectionRetryPolicy, LoopRetryPolicy, RetryDecision};
use super::BackfillKind;
use crate::auth::TokenProvider;
use crate::config::BackfillConfig;
use crate::error::InvokeError;
use crate::events::{JobSource, Notifier};
use crate::status::{Progress, StatusTracker};

/// Observable state of one backfill kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillSnapshot {
    pub is_running: bool,
    pub progress: Option<Progress>,
    pub last_update: Option<DateTime<Utc>>,
    /// Consecutive failures, reset by any successful batch
    pub retry_count: u32,
    /// Successful batches in the current run
    pub batch_count: u32,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Completed,
    Stopped,
    Exhausted { last_error: InvokeError },
    SessionExpired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub kind: BackfillKind,
    pub outcome: LoopOutcome,
    pub batches: u32,
    pub progress: Progress,
}

pub enum StartOutcome {
    Started(JoinHandle<BackfillReport>),
    AlreadyRunning,
}

/// Cooperative stop request, honored at the top of the next iteration.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Everything a run needs that does not change between runs.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub function: String,
    pub batch_size: u32,
    pub invoke: InvokeOptions,
    pub retry: LoopRetryPolicy,
    pub token_refresh_interval: u32,
    pub max_auth_refreshes: u32,
    pub politeness_delay: Duration,
}

impl LoopSettings {
    pub fn from_config(kind: BackfillKind, config: &BackfillConfig) -> Self {
        let settings = config.kind(kind);
        Self {
            function: settings.function.clone(),
            batch_size: settings.batch_size,
            invoke: InvokeOptions {
                timeout: settings.timeout(),
                retry: ConnectionRetryPolicy::with_retries(config.connection_retries),
            },
            retry: LoopRetryPolicy::from_config(config),
            token_refresh_interval: config.token_refresh_interval,
            max_auth_refreshes: config.max_auth_refreshes,
            politeness_delay: config.politeness_delay(),
        }
    }
}

struct Shared {
    running: AtomicBool,
    stop: StopHandle,
    snapshot: watch::Sender<BackfillSnapshot>,
}

/// Clears the running flag however the run task ends.
struct RunningGuard(Arc<Shared>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
        self.0.stop.reset();
    }
}

pub struct BackfillController {
    kind: BackfillKind,
    settings: LoopSettings,
    invoker: Arc<BatchInvoker>,
    tokens: Arc<dyn TokenProvider>,
    status: Arc<StatusTracker>,
    notifier: Notifier,
    shared: Arc<Shared>,
}

impl BackfillController {
    pub fn new(
        kind: BackfillKind,
        settings: LoopSettings,
        invoker: Arc<BatchInvoker>,
        tokens: Arc<dyn TokenProvider>,
        status: Arc<StatusTracker>,
        notifier: Notifier,
    ) -> Self {
        let (snapshot, _) = watch::channel(BackfillSnapshot::default());
        Self {
            kind,
            settings,
            invoker,
            tokens,
            status,
            notifier,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                stop: StopHandle::default(),
                snapshot,
            }),
        }
    }

    pub fn kind(&self) -> BackfillKind {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BackfillSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BackfillSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.shared.stop.clone()
    }

    /// Request a cooperative stop. A batch already in flight still completes
    /// and its result is applied before the loop exits.
    pub fn stop(&self) {
        if self.is_running() {
            info!(kind = %self.kind, "Stop requested");
            self.shared.stop.stop();
        }
    }

    /// Spawn the loop for this kind unless one is already running.
    pub fn start(&self) -> StartOutcome {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(kind = %self.kind, "Backfill already running, ignoring start");
            return StartOutcome::AlreadyRunning;
        }
        self.shared.stop.reset();

        let run = BackfillRun {
            kind: self.kind,
            settings: self.settings.clone(),
            body: self.kind.request_body(self.settings.batch_size),
            invoker: Arc::clone(&self.invoker),
            tokens: Arc::clone(&self.tokens),
            status: Arc::clone(&self.status),
            notifier: self.notifier.clone(),
            shared: Arc::clone(&self.shared),
            token: String::new(),
            progress: Progress::default(),
            last_update: None,
            retry_count: 0,
            batch_count: 0,
            refreshed_at_batch: 0,
            auth_refreshes: 0,
        };
        run.publish(true);

        StartOutcome::Started(tokio::spawn(run.execute()))
    }
}

/// State private to a single run of the loop.
struct BackfillRun {
    kind: BackfillKind,
    settings: LoopSettings,
    body: Value,
    invoker: Arc<BatchInvoker>,
    tokens: Arc<dyn TokenProvider>,
    status: Arc<StatusTracker>,
    notifier: Notifier,
    shared: Arc<Shared>,
    token: String,
    progress: Progress,
    last_update: Option<DateTime<Utc>>,
    retry_count: u32,
    batch_count: u32,
    refreshed_at_batch: u32,
    /// Back-to-back auth refreshes without a successful batch in between
    auth_refreshes: u32,
}

impl BackfillRun {
    fn source(&self) -> JobSource {
        JobSource::Backfill(self.kind)
    }

    fn publish(&self, is_running: bool) {
        self.shared.snapshot.send_replace(BackfillSnapshot {
            is_running,
            progress: Some(self.progress),
            last_update: self.last_update,
            retry_count: self.retry_count,
            batch_count: self.batch_count,
        });
    }

    async fn execute(mut self) -> BackfillReport {
        let guard = RunningGuard(Arc::clone(&self.shared));
        let outcome = self.run_loop().await;

        let report = BackfillReport {
            kind: self.kind,
            outcome,
            batches: self.batch_count,
            progress: self.progress,
        };

        // The next run's baseline must be current before the kind can restart.
        if let Err(e) = self.status.refresh().await {
            warn!(kind = %self.kind, "Failed to refresh index status after backfill: {:#}", e);
        }

        self.retry_count = 0;
        self.batch_count = 0;
        drop(guard);
        self.publish(false);
        self.announce(&report);
        report
    }

    async fn run_loop(&mut self) -> LoopOutcome {
        match self.tokens.fresh_token().await {
            Some(token) => self.token = token,
            None => return LoopOutcome::SessionExpired,
        }

        let total = match self.status.baseline(self.kind).await {
            Ok(total) => total,
            Err(e) => {
                warn!(kind = %self.kind, "Could not load baseline counts: {:#}", e);
                0
            }
        };
        self.progress = Progress::new(0, total);
        self.publish(true);

        info!(kind = %self.kind, total, batch_size = self.settings.batch_size, "Backfill started");
        self.notifier.info(
            self.source(),
            format!("Starting {} backfill", self.kind),
            format!(
                "{} records to process in batches of {}",
                total, self.settings.batch_size
            ),
        );

        loop {
            if self.shared.stop.is_requested() {
                return LoopOutcome::Stopped;
            }
            self.refresh_token_if_due().await;

            let result = self
                .invoker
                .invoke(
                    &self.settings.function,
                    &self.body,
                    &mut self.token,
                    &self.settings.invoke,
                )
                .await;

            match result {
                Ok(batch) => {
                    self.retry_count = 0;
                    self.auth_refreshes = 0;
                    self.batch_count += 1;
                    self.progress.advance(batch.success_count, batch.remaining);
                    self.last_update = Some(Utc::now());

                    if batch.is_finished() {
                        self.progress.finish();
                        self.publish(true);
                        return LoopOutcome::Completed;
                    }
                    self.publish(true);

                    debug!(
                        kind = %self.kind,
                        batch = self.batch_count,
                        processed = self.progress.processed,
                        remaining = ?batch.remaining,
                        "Batch complete"
                    );
                    sleep(self.settings.politeness_delay).await;
                }
                Err(err) => {
                    if !err.is_auth() {
                        self.retry_count += 1;
                        self.publish(true);
                    }

                    match self.settings.retry.decide(self.retry_count, &err) {
                        RetryDecision::RefreshToken => {
                            if !self.refresh_after_auth_error(&err).await {
                                return LoopOutcome::SessionExpired;
                            }
                        }
                        RetryDecision::Backoff(delay) => {
                            let max = self.settings.retry.effective_max(&err);
                            warn!(
                                kind = %self.kind,
                                retry_count = self.retry_count,
                                max_retries = max,
                                delay_ms = delay.as_millis() as u64,
                                "Batch failed: {}",
                                err
                            );
                            self.notifier.warning(
                                self.source(),
                                format!("Retrying {} batch ({}/{})", self.kind, self.retry_count, max),
                                format!("{}. Retrying in {}s", err, delay.as_secs()),
                            );
                            sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            error!(
                                kind = %self.kind,
                                retry_count = self.retry_count,
                                "Giving up after consecutive failures: {}",
                                err
                            );
                            return LoopOutcome::Exhausted { last_error: err };
                        }
                    }
                }
            }
        }
    }

    async fn refresh_token_if_due(&mut self) {
        let interval = self.settings.token_refresh_interval;
        if self.batch_count == 0
            || self.batch_count % interval != 0
            || self.refreshed_at_batch == self.batch_count
        {
            return;
        }
        self.refreshed_at_batch = self.batch_count;

        match self.tokens.fresh_token().await {
            Some(token) => {
                debug!(kind = %self.kind, batch = self.batch_count, "Token refreshed");
                self.token = token;
            }
            None => warn!(
                kind = %self.kind,
                "Scheduled token refresh failed, continuing with current token"
            ),
        }
    }

    /// Returns false when the session cannot be recovered.
    async fn refresh_after_auth_error(&mut self, err: &InvokeError) -> bool {
        self.auth_refreshes += 1;
        if self.auth_refreshes > self.settings.max_auth_refreshes {
            warn!(kind = %self.kind, "Still unauthorized after {} refreshes", self.settings.max_auth_refreshes);
            return false;
        }

        warn!(kind = %self.kind, "Authorization failed, refreshing token: {}", err);
        match self.tokens.fresh_token().await {
            Some(token) => {
                self.token = token;
                true
            }
            None => false,
        }
    }

    fn announce(&self, report: &BackfillReport) {
        let source = self.source();
        let progress = report.progress;
        match &report.outcome {
            LoopOutcome::Completed => {
                info!(kind = %self.kind, batches = report.batches, processed = progress.processed, "Backfill complete");
                self.notifier.success(
                    source,
                    format!("{} backfill complete", capitalize(&self.kind.to_string())),
                    format!(
                        "Processed {} records in {} batches",
                        progress.processed, report.batches
                    ),
                );
            }
            LoopOutcome::Stopped => {
                info!(kind = %self.kind, processed = progress.processed, "Backfill stopped");
                self.notifier.info(
                    source,
                    format!("{} backfill stopped", capitalize(&self.kind.to_string())),
                    format!(
                        "Processed {} of {}. Start again to resume",
                        progress.processed, progress.total
                    ),
                );
            }
            LoopOutcome::Exhausted { last_error } => {
                self.notifier.error(
                    source,
                    format!("{} backfill failed", capitalize(&self.kind.to_string())),
                    format!(
                        "{}. Progress is saved ({} of {}); start again to resume",
                        last_error, progress.processed, progress.total
                    ),
                );
            }
            LoopOutcome::SessionExpired => {
                error!(kind = %self.kind, "Session expired during backfill");
                self.notifier.error(
                    source,
                    "Session expired",
                    "Please sign in again to continue the backfill",
                );
            }
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Level;
    use crate::mock::{batch, MockEndpoint, MockStatus, MockTokens};
    use crate::remote::{BatchResult, IndexStatus};
    use std::sync::atomic::AtomicU32;

    struct Harness {
        controller: BackfillController,
        endpoint: Arc<MockEndpoint>,
        tokens: Arc<MockTokens>,
        status: Arc<MockStatus>,
        notifier: Notifier,
    }

    fn settings(kind: BackfillKind) -> LoopSettings {
        let mut config = BackfillConfig::default();
        config.connection_retries = 0;
        LoopSettings::from_config(kind, &config)
    }

    fn harness_with(
        kind: BackfillKind,
        settings: LoopSettings,
        endpoint: MockEndpoint,
        tokens: MockTokens,
        missing: u64,
    ) -> Harness {
        let endpoint = Arc::new(endpoint);
        let tokens = Arc::new(tokens);
        let status = Arc::new(MockStatus::new(IndexStatus {
            total_chunks: missing,
            ner_pending: missing,
            total_calls: missing,
            ..IndexStatus::default()
        }));
        let notifier = Notifier::new();
        let controller = BackfillController::new(
            kind,
            settings,
            Arc::new(BatchInvoker::new(endpoint.clone(), tokens.clone())),
            tokens.clone(),
            Arc::new(StatusTracker::new(status.clone())),
            notifier.clone(),
        );
        Harness {
            controller,
            endpoint,
            tokens,
            status,
            notifier,
        }
    }

    fn harness(kind: BackfillKind, endpoint: MockEndpoint, missing: u64) -> Harness {
        harness_with(kind, settings(kind), endpoint, MockTokens::new(), missing)
    }

    async fn run(controller: &BackfillController) -> BackfillReport {
        match controller.start() {
            StartOutcome::Started(handle) => handle.await.unwrap(),
            StartOutcome::AlreadyRunning => panic!("controller was already running"),
        }
    }

    fn server_error() -> InvokeError {
        InvokeError::Server {
            status: 500,
            message: "worker crashed".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_embeddings_backfill_runs_to_completion() {
        let h = harness(
            BackfillKind::Embeddings,
            MockEndpoint::scripted(vec![Ok(batch(10, 15)), Ok(batch(10, 5)), Ok(batch(5, 0))]),
            25,
        );
        let mut notifications = h.notifier.subscribe();

        let report = run(&h.controller).await;

        assert_eq!(report.outcome, LoopOutcome::Completed);
        assert_eq!(report.batches, 3);
        assert_eq!(report.progress, Progress::new(25, 25));
        assert_eq!(h.endpoint.calls(), 3);
        for body in h.endpoint.bodies() {
            assert_eq!(body["batch_size"], 10);
            assert_eq!(body["backfill_embeddings"], true);
        }
        // baseline fetch plus the refresh on exit
        assert_eq!(h.status.fetches(), 2);

        let mut levels = Vec::new();
        while let Ok(n) = notifications.try_recv() {
            levels.push(n.level);
        }
        assert_eq!(levels, vec![Level::Info, Level::Success]);

        let snapshot = h.controller.snapshot();
        assert!(!snapshot.is_running);
        assert_eq!(snapshot.batch_count, 0);
        assert_eq!(snapshot.progress, Some(Progress::new(25, 25)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_while_running_is_ignored() {
        let h = harness(
            BackfillKind::Embeddings,
            MockEndpoint::scripted(vec![Ok(batch(10, 15)), Ok(batch(10, 5)), Ok(batch(5, 0))]),
            25,
        );

        let handle = match h.controller.start() {
            StartOutcome::Started(handle) => handle,
            StartOutcome::AlreadyRunning => panic!("first start must spawn"),
        };
        assert!(h.controller.is_running());
        assert!(matches!(h.controller.start(), StartOutcome::AlreadyRunning));

        let report = handle.await.unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(h.endpoint.calls(), 3);
        assert_eq!(h.tokens.calls(), 1);
        assert!(!h.controller.is_running());

        // A finished controller can be started again.
        assert!(matches!(h.controller.start(), StartOutcome::Started(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_network_failures_stop_at_max_retries() {
        let h = harness(BackfillKind::Entities, MockEndpoint::failing(server_error()), 10);
        let mut notifications = h.notifier.subscribe();

        let report = run(&h.controller).await;

        assert_eq!(
            report.outcome,
            LoopOutcome::Exhausted {
                last_error: server_error()
            }
        );
        assert_eq!(h.endpoint.calls(), 3);

        let mut retries = 0;
        let mut last = None;
        while let Ok(n) = notifications.try_recv() {
            if n.level == Level::Warning {
                retries += 1;
            }
            last = Some(n);
        }
        assert_eq!(retries, 2);
        let last = last.unwrap();
        assert_eq!(last.level, Level::Error);
        assert!(last.message.contains("start again to resume"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_retries_nest_inside_loop_retries() {
        let mut config = BackfillConfig::default();
        config.connection_retries = 2;
        let kind = BackfillKind::Entities;
        let h = harness_with(
            kind,
            LoopSettings::from_config(kind, &config),
            MockEndpoint::failing(server_error()),
            MockTokens::new(),
            10,
        );

        let report = run(&h.controller).await;

        assert!(matches!(report.outcome, LoopOutcome::Exhausted { .. }));
        // three loop attempts, each made of three connection attempts
        assert_eq!(h.endpoint.calls(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failures_get_double_budget() {
        let h = harness(
            BackfillKind::Embeddings,
            MockEndpoint::failing(InvokeError::Network("Failed to fetch".to_string())),
            10,
        );

        let report = run(&h.controller).await;

        assert!(matches!(report.outcome, LoopOutcome::Exhausted { .. }));
        assert_eq!(h.endpoint.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_errors_refresh_without_spending_retries() {
        let auth = || Err(InvokeError::Auth("JWT expired".to_string()));
        let retry_seen = Arc::new(AtomicU32::new(u32::MAX));
        let h = harness(
            BackfillKind::DealHeat,
            MockEndpoint::scripted(vec![auth(), auth(), auth(), Ok(batch(3, 0))]),
            3,
        );
        let rx = h.controller.subscribe();
        let seen = Arc::clone(&retry_seen);
        h.endpoint.on_call(move |call| {
            if call == 4 {
                seen.store(rx.borrow().retry_count, Ordering::SeqCst);
            }
        });

        let report = run(&h.controller).await;

        assert_eq!(report.outcome, LoopOutcome::Completed);
        assert_eq!(retry_seen.load(Ordering::SeqCst), 0);
        // one initial token plus one refresh per auth error
        assert_eq!(h.tokens.calls(), 4);
        assert_eq!(
            h.endpoint.tokens_seen(),
            vec!["token-1", "token-2", "token-3", "token-4"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_after_auth_error_expires_session() {
        let kind = BackfillKind::Entities;
        let h = harness_with(
            kind,
            settings(kind),
            MockEndpoint::failing(InvokeError::Auth("401 Unauthorized".to_string())),
            MockTokens::failing_after(1),
            10,
        );

        let report = run(&h.controller).await;

        assert_eq!(report.outcome, LoopOutcome::SessionExpired);
        assert_eq!(h.endpoint.calls(), 1);
        assert!(!h.controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_auth_errors_are_bounded() {
        let h = harness(
            BackfillKind::Entities,
            MockEndpoint::failing(InvokeError::Auth("invalid jwt".to_string())),
            10,
        );

        let report = run(&h.controller).await;

        assert_eq!(report.outcome, LoopOutcome::SessionExpired);
        // max_auth_refreshes (5) refreshed retries after the first refusal
        assert_eq!(h.endpoint.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_initial_token_aborts_before_any_batch() {
        let kind = BackfillKind::Embeddings;
        let h = harness_with(
            kind,
            settings(kind),
            MockEndpoint::scripted(vec![]),
            MockTokens::failing_after(0),
            10,
        );
        let mut notifications = h.notifier.subscribe();

        let report = run(&h.controller).await;

        assert_eq!(report.outcome, LoopOutcome::SessionExpired);
        assert_eq!(h.endpoint.calls(), 0);
        let n = notifications.try_recv().unwrap();
        assert!(n.message.contains("sign in again"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_applies_in_flight_batch_then_exits() {
        let h = harness(
            BackfillKind::Embeddings,
            MockEndpoint::scripted(vec![Ok(batch(10, 15)), Ok(batch(10, 5))]),
            25,
        );
        let stop = h.controller.stop_handle();
        h.endpoint.on_call(move |call| {
            if call == 1 {
                stop.stop();
            }
        });

        let report = run(&h.controller).await;

        assert_eq!(report.outcome, LoopOutcome::Stopped);
        assert_eq!(h.endpoint.calls(), 1);
        assert_eq!(report.progress, Progress::new(10, 25));
        assert!(!h.controller.stop_handle().is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_batch() {
        let h = harness(BackfillKind::Entities, MockEndpoint::scripted(vec![]), 10);

        let handle = match h.controller.start() {
            StartOutcome::Started(handle) => handle,
            StartOutcome::AlreadyRunning => panic!("first start must spawn"),
        };
        h.controller.stop();
        let report = handle.await.unwrap();

        assert_eq!(report.outcome, LoopOutcome::Stopped);
        assert_eq!(h.endpoint.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_zero_completes_without_complete_flag() {
        let h = harness(
            BackfillKind::Entities,
            MockEndpoint::scripted(vec![Ok(batch(10, 20)), Ok(batch(4, 0))]),
            30,
        );

        let report = run(&h.controller).await;

        assert_eq!(report.outcome, LoopOutcome::Completed);
        assert_eq!(report.progress.processed, report.progress.total);
        assert_eq!(report.progress.total, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_refreshed_every_ten_batches() {
        let script = (1..=25u64).map(|n| Ok(batch(1, 25 - n))).collect();
        let h = harness(BackfillKind::Embeddings, MockEndpoint::scripted(script), 25);

        let report = run(&h.controller).await;

        assert_eq!(report.outcome, LoopOutcome::Completed);
        assert_eq!(h.endpoint.calls(), 25);
        // initial token plus refreshes before batches 11 and 21
        assert_eq!(h.tokens.calls(), 3);
        let seen = h.endpoint.tokens_seen();
        assert_eq!(seen[9], "token-1");
        assert_eq!(seen[10], "token-2");
        assert_eq!(seen[20], "token-3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_then_success_reset_retry_count() {
        let fetch_failed = || Err(InvokeError::Network("Failed to fetch".to_string()));
        let h = harness(
            BackfillKind::Entities,
            MockEndpoint::scripted(vec![
                fetch_failed(),
                fetch_failed(),
                fetch_failed(),
                Ok(batch(10, 5)),
                Ok(batch(5, 0)),
            ]),
            15,
        );
        let before_success = Arc::new(AtomicU32::new(0));
        let after_success = Arc::new(AtomicU32::new(u32::MAX));
        let rx = h.controller.subscribe();
        let (before, after) = (Arc::clone(&before_success), Arc::clone(&after_success));
        h.endpoint.on_call(move |call| match call {
            4 => before.store(rx.borrow().retry_count, Ordering::SeqCst),
            5 => after.store(rx.borrow().retry_count, Ordering::SeqCst),
            _ => {}
        });

        let report = run(&h.controller).await;

        assert_eq!(report.outcome, LoopOutcome::Completed);
        assert_eq!(before_success.load(Ordering::SeqCst), 3);
        assert_eq!(after_success.load(Ordering::SeqCst), 0);
        assert_eq!(report.progress, Progress::new(15, 15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_between_failures() {
        let h = harness(BackfillKind::Entities, MockEndpoint::failing(server_error()), 10);

        let started = tokio::time::Instant::now();
        run(&h.controller).await;

        // 2s after the first failure, 4s after the second, none after the last
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_politeness_delay_between_successful_batches() {
        let h = harness(
            BackfillKind::Embeddings,
            MockEndpoint::scripted(vec![Ok(batch(10, 15)), Ok(batch(10, 5)), Ok(batch(5, 0))]),
            25,
        );

        let started = tokio::time::Instant::now();
        let report = run(&h.controller).await;

        assert_eq!(report.outcome, LoopOutcome::Completed);
        // 500ms after each of the first two batches, none after the last
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_without_remaining_count_keeps_going() {
        let unknown = BatchResult {
            success_count: 10,
            ..BatchResult::default()
        };
        let h = harness(
            BackfillKind::Entities,
            MockEndpoint::scripted(vec![Ok(unknown), Ok(batch(5, 0))]),
            15,
        );

        let report = run(&h.controller).await;

        assert_eq!(report.outcome, LoopOutcome::Completed);
        assert_eq!(h.endpoint.calls(), 2);
        assert_eq!(report.progress, Progress::new(15, 15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_refreshed_before_run_reports_idle() {
        let h = harness(
            BackfillKind::Embeddings,
            MockEndpoint::scripted(vec![Ok(batch(5, 0))]),
            5,
        );
        let running_at_refresh = Arc::new(AtomicBool::new(false));
        let rx = h.controller.subscribe();
        let seen = Arc::clone(&running_at_refresh);
        h.status.on_fetch(move |fetch| {
            if fetch == 2 {
                seen.store(rx.borrow().is_running, Ordering::SeqCst);
            }
        });

        run(&h.controller).await;

        assert_eq!(h.status.fetches(), 2);
        assert!(running_at_refresh.load(Ordering::SeqCst));
        assert!(!h.controller.snapshot().is_running);
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("deal heat"), "Deal heat");
        assert_eq!(capitalize(""), "");
    }
}
