// ABOUTME: In-memory test doubles for the remote boundary traits
// ABOUTME: Scripted batch endpoint, counting token provider, status source and job store

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::auth::TokenProvider;
use crate::backfill::BatchEndpoint;
use crate::error::{InvokeError, ReindexError};
use crate::reindex::JobStore;
use crate::remote::{BackgroundJob, BatchResult, IndexStatus, JobStatus};
use crate::status::StatusSource;

pub fn batch(success_count: u64, remaining: u64) -> BatchResult {
    BatchResult {
        success_count,
        remaining: Some(remaining),
        complete: false,
        total: success_count + remaining,
        ..BatchResult::default()
    }
}

/// Job row last touched `age_secs` ago.
pub fn job(id: &str, status: JobStatus, age_secs: i64) -> BackgroundJob {
    BackgroundJob {
        id: id.to_string(),
        job_type: "full_reindex".to_string(),
        status,
        progress: None,
        updated_at: Utc::now() - ChronoDuration::seconds(age_secs),
        created_at: None,
        error: None,
    }
}

type CallHook = Box<dyn Fn(usize) + Send + Sync>;

pub struct MockEndpoint {
    script: Mutex<VecDeque<Result<BatchResult, InvokeError>>>,
    /// Returned forever once the script is empty
    fallback: Result<BatchResult, InvokeError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Value>>,
    hook: Mutex<Option<CallHook>>,
}

impl MockEndpoint {
    pub fn scripted(script: Vec<Result<BatchResult, InvokeError>>) -> Self {
        Self::new(script.into(), Ok(batch(0, 0)))
    }

    pub fn failing(err: InvokeError) -> Self {
        Self::new(VecDeque::new(), Err(err))
    }

    fn new(
        script: VecDeque<Result<BatchResult, InvokeError>>,
        fallback: Result<BatchResult, InvokeError>,
    ) -> Self {
        Self {
            script: Mutex::new(script),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
            bodies: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Run `hook` with the 1-based call number while each call is in flight.
    pub fn on_call(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchEndpoint for MockEndpoint {
    async fn invoke(
        &self,
        _function: &str,
        body: &Value,
        token: &str,
    ) -> Result<BatchResult, InvokeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.tokens.lock().unwrap().push(token.to_string());
        self.bodies.lock().unwrap().push(body.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(call);
        }

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Hands out `token-1`, `token-2`, ... and can be told to start failing.
#[derive(Default)]
pub struct MockTokens {
    calls: AtomicUsize,
    fail_after: Option<usize>,
}

impl MockTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` calls succeed, every later one returns `None`.
    pub fn failing_after(n: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_after: Some(n),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for MockTokens {
    async fn fresh_token(&self) -> Option<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.fail_after {
            Some(limit) if call > limit => None,
            _ => Some(format!("token-{}", call)),
        }
    }
}

pub struct MockStatus {
    status: Mutex<IndexStatus>,
    fetches: AtomicUsize,
    hook: Mutex<Option<CallHook>>,
}

impl MockStatus {
    pub fn new(status: IndexStatus) -> Self {
        Self {
            status: Mutex::new(status),
            fetches: AtomicUsize::new(0),
            hook: Mutex::new(None),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Run `hook` with the 1-based fetch number on each fetch.
    pub fn on_fetch(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

#[async_trait]
impl StatusSource for MockStatus {
    async fn fetch_index_status(&self) -> Result<IndexStatus> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(fetch);
        }
        Ok(self.status.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct MockJobStore {
    jobs: Mutex<HashMap<String, BackgroundJob>>,
    started: AtomicUsize,
    cancelled: Mutex<Vec<String>>,
    stalled_cancelled: Mutex<Vec<String>>,
}

impl MockJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: BackgroundJob) {
        self.jobs.lock().unwrap().insert(job.id.clone(), job);
    }

    pub fn set_status(&self, id: &str, status: JobStatus) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(id) {
            job.status = status;
            job.updated_at = Utc::now();
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn stalled_cancelled(&self) -> Vec<String> {
        self.stalled_cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobStore for MockJobStore {
    async fn fetch_active_job(&self, job_type: &str) -> Result<Option<BackgroundJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .find(|j| j.job_type == job_type && !j.status.is_terminal())
            .cloned())
    }

    async fn fetch_background_job(&self, id: &str) -> Result<BackgroundJob> {
        self.jobs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Background job {} not found", id))
    }

    async fn cancel_background_job(&self, id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(id.to_string());
        self.set_status(id, JobStatus::Cancelled);
        Ok(())
    }

    async fn cancel_stalled_job(&self, id: &str) -> Result<bool> {
        self.stalled_cancelled.lock().unwrap().push(id.to_string());
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = JobStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn start_full_reindex_job(&self, _token: &str) -> Result<String, ReindexError> {
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("reindex-{}", n);
        self.insert(job(&id, JobStatus::Pending, 0));
        Ok(id)
    }
}
