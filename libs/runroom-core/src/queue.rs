//! Job Queue - admission, durable storage and the worker pool
//!
//! **Admission rule:** a request is rejected when any non-terminal job
//! (queued, active, awaiting redelivery) carries the same session id. There
//! is no other admission control at this layer.
//!
//! **Lifecycle:** `submit` stores the job as Queued; a worker claims it
//! (Active), runs it, records the terminal state, then removes it in an
//! explicit step. Removal is idempotent so redelivery after a crash between
//! completion and removal is harmless.

use crate::error::{QueueError, RunError};
use crate::events::EventSink;
use crate::runner::{RunOutcome, Runner};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use runroom_common::config::Settings;
use runroom_common::redis as keys;
use runroom_common::types::{ExecutionRequest, FailureReason, Job, JobState};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Durable home of jobs between submission and removal
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store `job` unless its session already has a non-terminal job.
    /// Returns `false` when rejected.
    async fn try_enqueue(&self, job: &Job) -> Result<bool, QueueError>;

    /// Next queued job, marked Active. `None` after `timeout` with nothing queued.
    async fn claim(&self, timeout: Duration) -> Result<Option<Job>, QueueError>;

    /// Persist a state change
    async fn update(&self, job: &Job) -> Result<(), QueueError>;

    /// Remove the job and release its session. Removing twice is a no-op.
    async fn remove(&self, job: &Job) -> Result<(), QueueError>;

    /// Id of the session's non-terminal job, if any
    async fn in_flight(&self, session_id: &str) -> Result<Option<Uuid>, QueueError>;

    /// Requeue active jobs that started before `cutoff` (their worker is gone)
    async fn recover(&self, _cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        Ok(0)
    }
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    pending: VecDeque<Uuid>,
}

/// Single-instance store, used in tests and when running without Redis
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a job record
    pub fn get(&self, job_id: &Uuid) -> Option<Job> {
        self.lock().jobs.get(job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop_pending(&self) -> Option<Job> {
        let mut state = self.lock();
        while let Some(id) = state.pending.pop_front() {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.activate();
                return Some(job.clone());
            }
        }
        None
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn try_enqueue(&self, job: &Job) -> Result<bool, QueueError> {
        {
            let mut state = self.lock();
            let busy = state
                .jobs
                .values()
                .any(|j| j.session_id() == job.session_id() && !j.state.is_terminal());
            if busy {
                return Ok(false);
            }
            state.jobs.insert(job.id, job.clone());
            state.pending.push_back(job.id);
        }
        self.notify.notify_one();
        Ok(true)
    }

    async fn claim(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.pop_pending() {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn update(&self, job: &Job) -> Result<(), QueueError> {
        if let Some(stored) = self.lock().jobs.get_mut(&job.id) {
            *stored = job.clone();
        }
        Ok(())
    }

    async fn remove(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.jobs.remove(&job.id);
        state.pending.retain(|id| *id != job.id);
        Ok(())
    }

    async fn in_flight(&self, session_id: &str) -> Result<Option<Uuid>, QueueError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .find(|j| j.session_id() == session_id && !j.state.is_terminal())
            .map(|j| j.id))
    }
}

/// Cluster-wide store on Redis; see `runroom_common::redis` for the layout.
///
/// BLMOVE blocks its connection, so claims go through dedicated
/// connections and never stall intake traffic on the shared one.
pub struct RedisJobStore {
    conn: ConnectionManager,
    claimers: Vec<tokio::sync::Mutex<ConnectionManager>>,
}

impl RedisJobStore {
    pub async fn connect(client: &redis::Client, claim_connections: usize) -> Result<Self, QueueError> {
        let conn = ConnectionManager::new(client.clone()).await?;
        let mut claimers = Vec::with_capacity(claim_connections.max(1));
        for _ in 0..claim_connections.max(1) {
            claimers.push(tokio::sync::Mutex::new(
                ConnectionManager::new(client.clone()).await?,
            ));
        }
        Ok(Self { conn, claimers })
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn try_enqueue(&self, job: &Job) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        Ok(keys::try_enqueue(&mut conn, job).await?)
    }

    async fn claim(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = match self.claimers.iter().find_map(|c| c.try_lock().ok()) {
            Some(guard) => guard,
            None => self.claimers[0].lock().await,
        };
        Ok(keys::claim_job(&mut conn, timeout.as_secs_f64()).await?)
    }

    async fn update(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        Ok(keys::update_job(&mut conn, job).await?)
    }

    async fn remove(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        Ok(keys::remove_job(&mut conn, &job.id, job.session_id()).await?)
    }

    async fn in_flight(&self, session_id: &str) -> Result<Option<Uuid>, QueueError> {
        let mut conn = self.conn.clone();
        Ok(keys::in_flight(&mut conn, session_id).await?)
    }

    async fn recover(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        Ok(keys::requeue_stale(&mut conn, cutoff).await?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    DuplicateInFlight { session_id: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::DuplicateInFlight { .. } => write!(f, "already running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted { job_id: Uuid },
    Rejected(Rejection),
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent executions on this instance
    pub worker_count: usize,
    /// Hard limit on a job's Active time; `None` disables it
    pub max_active: Option<Duration>,
    /// How long one claim blocks before re-checking for shutdown
    pub claim_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            max_active: Some(Duration::from_secs(30)),
            claim_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Settings> for QueueConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            worker_count: settings.worker_count,
            max_active: (!settings.max_active.is_zero()).then_some(settings.max_active),
            claim_timeout: settings.claim_timeout,
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    runner: Arc<Runner>,
    sink: Arc<dyn EventSink>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<Runner>,
        sink: Arc<dyn EventSink>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            runner,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Admit a request or reject it as a duplicate. Never waits for execution.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<Admission, QueueError> {
        let session_id = request.session_id.clone();
        let job = Job::new(request);

        if self.store.try_enqueue(&job).await? {
            info!(
                job_id = %job.id,
                session_id = %session_id,
                language = %job.request.language,
                source_size = job.request.code.len(),
                "Job queued"
            );
            Ok(Admission::Accepted { job_id: job.id })
        } else {
            info!(session_id = %session_id, "Rejected duplicate submission");
            Ok(Admission::Rejected(Rejection::DuplicateInFlight { session_id }))
        }
    }

    /// Requeue jobs abandoned by dead workers.
    ///
    /// A job is considered abandoned once it has been Active for longer than
    /// `max_active` plus `grace`, which no live worker allows.
    pub async fn recover_abandoned(&self, grace: Duration) -> Result<usize, QueueError> {
        let limit = self.config.max_active.unwrap_or_default() + grace;
        let limit = chrono::Duration::from_std(limit).unwrap_or_else(|_| chrono::Duration::zero());
        let recovered = self.store.recover(Utc::now() - limit).await?;
        if recovered > 0 {
            warn!(recovered, "Requeued abandoned jobs");
        }
        Ok(recovered)
    }

    /// Start `worker_count` workers. They stop claiming once `shutdown` fires;
    /// jobs already running are cancelled and still finish their lifecycle.
    pub fn spawn_workers(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.worker_count)
            .map(|worker_id| {
                let queue = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { queue.worker_loop(worker_id, shutdown).await })
            })
            .collect()
    }

    #[instrument(skip(self, shutdown))]
    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        info!("Worker started");
        loop {
            let claimed = tokio::select! {
                _ = shutdown.cancelled() => break,
                claimed = self.store.claim(self.config.claim_timeout) => claimed,
            };

            match claimed {
                Ok(Some(job)) => self.process(job, &shutdown).await,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        info!("Worker stopped");
    }

    /// Run one claimed job to a terminal state and remove it
    pub async fn process(&self, mut job: Job, shutdown: &CancellationToken) {
        let job_id = job.id;
        let cancel = shutdown.child_token();

        info!(
            job_id = %job_id,
            session_id = %job.session_id(),
            language = %job.request.language,
            "Received job"
        );

        let start = std::time::Instant::now();
        let result = self
            .runner
            .run(
                job.request.clone(),
                self.sink.as_ref(),
                &cancel,
                self.config.max_active,
            )
            .await;

        job.state = terminal_state(&result);
        match &job.state {
            JobState::Failed(reason) => warn!(
                job_id = %job_id,
                reason = %reason,
                execution_ms = start.elapsed().as_millis() as u64,
                "Job failed"
            ),
            _ => info!(
                job_id = %job_id,
                outcome = ?result.as_ref().ok(),
                execution_ms = start.elapsed().as_millis() as u64,
                "Job completed"
            ),
        }

        if let Err(e) = self.store.update(&job).await {
            warn!(job_id = %job_id, error = %e, "Failed to record terminal state");
        }
        if let Err(e) = self.store.remove(&job).await {
            // The session stays blocked until recovery; nothing else to do here
            error!(job_id = %job_id, error = %e, "Failed to remove finished job");
        }
    }
}

fn terminal_state(result: &Result<RunOutcome, RunError>) -> JobState {
    match result {
        Ok(RunOutcome::Exited { .. }) => JobState::Completed,
        Ok(RunOutcome::TimedOut) => JobState::Failed(FailureReason::Timeout),
        Ok(RunOutcome::Cancelled) => JobState::Failed(FailureReason::Cancelled),
        Err(e) if e.is_user_error() => JobState::Completed,
        Err(e) => JobState::Failed(FailureReason::Error(e.to_string())),
    }
}
