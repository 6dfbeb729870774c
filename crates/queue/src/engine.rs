//! Worker pool and requeue loop over a [`JobStore`].
//!
//! Every replica runs the same engine against the shared table. Exclusivity
//! comes from the store's row-locked lease, not from anything in-process,
//! so replicas need no knowledge of each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::job::{JobId, JobRow, JobStatus};
use crate::store::{JobStore, StoreError};

/// Queue-level error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The engine was constructed with an unusable configuration.
    #[error("invalid queue configuration: {0}")]
    Config(String),

    /// Handlers must be registered before `start`.
    #[error("queue is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error returned by a failing job handler.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Callback executing one job.
///
/// Handlers must be idempotent: delivery is at-least-once, and a job whose
/// final status update was lost will run again on some replica.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job_name: &str, payload: &str) -> HandlerResult;
}

/// [`JobHandler`] built from an async closure.
pub struct FnJobHandler {
    inner: Box<dyn Fn(String, String) -> BoxFuture<'static, HandlerResult> + Send + Sync>,
}

/// Wrap an async closure as a [`JobHandler`].
pub fn job_handler_fn<F, Fut>(f: F) -> FnJobHandler
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    FnJobHandler {
        inner: Box::new(move |name, payload| Box::pin(f(name, payload))),
    }
}

#[async_trait]
impl JobHandler for FnJobHandler {
    async fn handle(&self, job_name: &str, payload: &str) -> HandlerResult {
        (self.inner)(job_name.to_owned(), payload.to_owned()).await
    }
}

/// Job submission, separated out so other engines (the scheduler) can fire
/// into any queue without knowing its store type.
#[async_trait]
pub trait Enqueue: Send + Sync {
    /// Enqueue a job eligible immediately.
    async fn enqueue(&self, job_name: &str, payload: &str) -> Result<JobId, QueueError>;

    /// Enqueue a job eligible `delay_secs` from now.
    async fn enqueue_delayed(
        &self,
        job_name: &str,
        payload: &str,
        delay_secs: u64,
    ) -> Result<JobId, QueueError>;
}

/// Queue engine tunables. Defaults are sized for production; tests shrink
/// them.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent workers on this replica.
    pub worker_count: usize,
    /// How often an in-flight job refreshes `last_visited`.
    pub heartbeat_interval: Duration,
    /// A `processing` row silent for longer than this is reclaimed.
    pub max_stall: Duration,
    /// Re-eligibility delay after a handler failure.
    pub retry_delay: Duration,
    /// Re-eligibility delay when no handler is registered for a job.
    pub unhandled_delay: Duration,
    /// Delay before each loop's first poll.
    pub initial_delay: Duration,
    /// Randomised pause after processing a job, de-synchronising workers.
    pub poll_jitter: Duration,
    /// Base pause when no job was found.
    pub idle_delay: Duration,
    /// Randomised extra pause on top of `idle_delay`.
    pub idle_jitter: Duration,
    /// Requeue loop pause after reclaiming a stalled row.
    pub requeue_busy_delay: Duration,
    /// Requeue loop pause when nothing was stalled.
    pub requeue_idle_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            heartbeat_interval: Duration::from_secs(10),
            max_stall: Duration::from_secs(15 * 60),
            retry_delay: Duration::from_secs(30),
            unhandled_delay: Duration::from_secs(60),
            initial_delay: Duration::from_secs(1),
            poll_jitter: Duration::from_secs(10),
            idle_delay: Duration::from_secs(10),
            idle_jitter: Duration::from_secs(30),
            requeue_busy_delay: Duration::from_secs(10),
            requeue_idle_delay: Duration::from_secs(10 * 60),
        }
    }
}

impl QueueConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_stall(mut self, max_stall: Duration) -> Self {
        self.max_stall = max_stall;
        self
    }
}

#[derive(Default)]
struct EngineState {
    running: bool,
    stops: Vec<mpsc::Sender<()>>,
    joins: Vec<JoinHandle<()>>,
}

type HandlerMap = HashMap<String, Arc<dyn JobHandler>>;

/// Durable job queue: `worker_count` workers plus one requeue loop.
pub struct QueueEngine<S> {
    store: Arc<S>,
    config: QueueConfig,
    handlers: Mutex<HandlerMap>,
    state: Mutex<EngineState>,
}

impl<S> QueueEngine<S>
where
    S: JobStore + 'static,
{
    /// Create an engine over `store`. `worker_count == 0` is fatal
    /// configuration.
    pub fn new(store: S, config: QueueConfig) -> Result<Self, QueueError> {
        if config.worker_count == 0 {
            return Err(QueueError::Config(
                "queue job worker count must not be 0".to_owned(),
            ));
        }
        Ok(Self {
            store: Arc::new(store),
            config,
            handlers: Mutex::new(HashMap::new()),
            state: Mutex::new(EngineState::default()),
        })
    }

    /// Register the handler for a job name. Must happen before [`start`];
    /// registration on a running engine is rejected.
    ///
    /// [`start`]: QueueEngine::start
    pub fn register_handler<H>(&self, job_name: &str, handler: H) -> Result<(), QueueError>
    where
        H: JobHandler + 'static,
    {
        if self.state.lock().unwrap().running {
            return Err(QueueError::AlreadyRunning);
        }
        self.handlers
            .lock()
            .unwrap()
            .insert(job_name.to_owned(), Arc::new(handler));
        Ok(())
    }

    /// Spawn the workers and the requeue loop. Idempotent.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return;
        }
        state.running = true;

        // Handlers are frozen at start; each worker gets the same snapshot.
        let handlers: Arc<HandlerMap> = Arc::new(self.handlers.lock().unwrap().clone());

        for worker in 0..self.config.worker_count {
            let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
            state.stops.push(stop_tx);
            state.joins.push(tokio::spawn(worker_loop(
                worker,
                self.store.clone(),
                handlers.clone(),
                self.config.clone(),
                stop_rx,
            )));
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        state.stops.push(stop_tx);
        state.joins.push(tokio::spawn(requeue_loop(
            self.store.clone(),
            self.config.clone(),
            stop_rx,
        )));

        info!(worker_count = self.config.worker_count, "queue workers and requeue loop running");
    }

    /// Signal all loops to stop and wait for in-flight handlers to finish.
    /// Idempotent.
    pub async fn close(&self) {
        let (stops, joins) = {
            let mut state = self.state.lock().unwrap();
            state.running = false;
            (
                std::mem::take(&mut state.stops),
                std::mem::take(&mut state.joins),
            )
        };

        for stop in &stops {
            let _ = stop.try_send(());
        }
        for join in joins {
            let _ = join.await;
        }
    }
}

#[async_trait]
impl<S> Enqueue for QueueEngine<S>
where
    S: JobStore + 'static,
{
    async fn enqueue(&self, job_name: &str, payload: &str) -> Result<JobId, QueueError> {
        self.enqueue_delayed(job_name, payload, 0).await
    }

    async fn enqueue_delayed(
        &self,
        job_name: &str,
        payload: &str,
        delay_secs: u64,
    ) -> Result<JobId, QueueError> {
        let run_at = Utc::now() + chrono::Duration::seconds(delay_secs as i64);
        let id = self.store.insert(job_name, payload, run_at).await?;
        debug!(job_id = %id, job_name, delay_secs, "job enqueued");
        Ok(id)
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max.as_millis() as u64))
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_default()
}

async fn worker_loop<S>(
    worker: usize,
    store: Arc<S>,
    handlers: Arc<HandlerMap>,
    config: QueueConfig,
    mut stop: mpsc::Receiver<()>,
) where
    S: JobStore + 'static,
{
    let mut delay = config.initial_delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.recv() => {
                info!(worker, "worker loop stopped");
                return;
            }
        }

        delay = match store.claim_next(Utc::now()).await {
            Ok(Some(job)) => {
                process_job(&store, &handlers, &config, job).await;
                jitter(config.poll_jitter)
            }
            Ok(None) => config.idle_delay + jitter(config.idle_jitter),
            Err(e) => {
                error!(worker, error = %e, "failed to lease next job");
                config.idle_delay
            }
        };
    }
}

async fn process_job<S>(store: &Arc<S>, handlers: &HandlerMap, config: &QueueConfig, job: JobRow)
where
    S: JobStore + 'static,
{
    let Some(handler) = handlers.get(&job.job_name) else {
        // No handler on this replica; give another replica (or a later
        // deploy) a chance instead of hot-looping on the row.
        warn!(job_id = %job.id, job_name = %job.job_name, "no handler registered, deferring job");
        let run_at = Utc::now() + chrono_duration(config.unhandled_delay);
        if let Err(e) = store.defer(job.id, run_at).await {
            error!(job_id = %job.id, error = %e, "failed to defer unhandled job");
        }
        return;
    };

    let (hb_stop, hb_stop_rx) = oneshot::channel::<()>();
    let heartbeat = tokio::spawn(heartbeat_loop(
        store.clone(),
        job.id,
        config.heartbeat_interval,
        hb_stop_rx,
    ));

    debug!(job_id = %job.id, job_name = %job.job_name, "job leased");
    let result = handler.handle(&job.job_name, &job.payload).await;

    let _ = hb_stop.send(());
    let _ = heartbeat.await;

    match result {
        Ok(()) => {
            if let Err(e) = store.mark_status(job.id, JobStatus::Complete).await {
                // The row stays `processing`; the requeue loop will
                // re-lease it after the stall limit (at-least-once).
                error!(job_id = %job.id, error = %e, "failed to mark job complete");
            } else {
                debug!(job_id = %job.id, "job complete");
            }
        }
        Err(handler_err) => {
            warn!(job_id = %job.id, job_name = %job.job_name, error = %handler_err, "job handler failed");
            let run_at = Utc::now() + chrono_duration(config.retry_delay);
            if let Err(e) = store.defer(job.id, run_at).await {
                error!(job_id = %job.id, error = %e, "failed to requeue failed job");
            }
        }
    }
}

async fn heartbeat_loop<S>(
    store: Arc<S>,
    id: JobId,
    every: Duration,
    mut stop: oneshot::Receiver<()>,
) where
    S: JobStore + 'static,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval fires immediately; the lease itself just stamped
    // last_visited, so skip the first tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.touch(id, Utc::now()).await {
                    warn!(job_id = %id, error = %e, "job heartbeat failed");
                }
            }
            _ = &mut stop => return,
        }
    }
}

async fn requeue_loop<S>(store: Arc<S>, config: QueueConfig, mut stop: mpsc::Receiver<()>)
where
    S: JobStore + 'static,
{
    let mut delay = config.initial_delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.recv() => {
                info!("requeue loop stopped");
                return;
            }
        }

        let now = Utc::now();
        let cutoff = now - chrono_duration(config.max_stall);
        delay = match store.reclaim_stalled(cutoff, now).await {
            Ok(Some(job)) => {
                debug!(job_id = %job.id, job_name = %job.job_name, "requeued stalled job");
                config.requeue_busy_delay
            }
            Ok(None) => config.requeue_idle_delay,
            Err(e) => {
                error!(error = %e, "requeue scan failed");
                config.requeue_busy_delay
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::InMemoryJobStore;

    fn fast_config() -> QueueConfig {
        QueueConfig {
            worker_count: 2,
            heartbeat_interval: Duration::from_millis(20),
            max_stall: Duration::from_millis(200),
            retry_delay: Duration::from_millis(50),
            unhandled_delay: Duration::from_secs(60),
            initial_delay: Duration::from_millis(10),
            poll_jitter: Duration::from_millis(5),
            idle_delay: Duration::from_millis(20),
            idle_jitter: Duration::from_millis(5),
            requeue_busy_delay: Duration::from_millis(20),
            requeue_idle_delay: Duration::from_millis(50),
        }
    }

    async fn wait_for_status<S: JobStore>(store: &S, id: JobId, status: JobStatus) -> JobRow {
        for _ in 0..200 {
            if let Some(row) = store.get(id).await.unwrap() {
                if row.status == status {
                    return row;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not reach status {status}");
    }

    #[test]
    fn zero_workers_is_fatal_config() {
        let err = QueueEngine::new(
            InMemoryJobStore::new(),
            QueueConfig::default().with_worker_count(0),
        )
        .err()
        .unwrap();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[tokio::test]
    async fn job_runs_to_completion_with_its_payload() {
        let engine = QueueEngine::new(InMemoryJobStore::new(), fast_config()).unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        engine
            .register_handler(
                "send_email",
                job_handler_fn(move |name, payload| {
                    let seen_tx = seen_tx.clone();
                    async move {
                        let _ = seen_tx.send((name, payload));
                        Ok(())
                    }
                }),
            )
            .unwrap();

        let id = engine.enqueue("send_email", "a@b").await.unwrap();
        engine.start();

        let (name, payload) = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "send_email");
        assert_eq!(payload, "a@b");

        wait_for_status(&*engine.store, id, JobStatus::Complete).await;
        engine.close().await;
    }

    #[tokio::test]
    async fn delayed_job_is_not_leased_before_its_run_at() {
        let engine = QueueEngine::new(InMemoryJobStore::new(), fast_config()).unwrap();

        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        engine
            .register_handler(
                "later",
                job_handler_fn(move |_, _| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        let id = engine.enqueue_delayed("later", "", 1).await.unwrap();
        engine.start();

        // Well before the delay elapses, the job must not have run.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        let row = engine.store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Waiting);

        wait_for_status(&*engine.store, id, JobStatus::Complete).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        engine.close().await;
    }

    #[tokio::test]
    async fn failed_handler_requeues_with_a_deferred_run_at() {
        let engine = QueueEngine::new(InMemoryJobStore::new(), fast_config()).unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        engine
            .register_handler(
                "flaky",
                job_handler_fn(move |_, _| {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(HandlerError::new("first attempt fails"))
                        } else {
                            Ok(())
                        }
                    }
                }),
            )
            .unwrap();

        let id = engine.enqueue("flaky", "").await.unwrap();
        engine.start();

        wait_for_status(&*engine.store, id, JobStatus::Complete).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        engine.close().await;
    }

    #[tokio::test]
    async fn stalled_job_is_reclaimed_and_rerun() {
        let store = InMemoryJobStore::arc();

        // Simulate a worker that leased a job and then died: the row sits
        // in `processing` with a heartbeat that will never refresh.
        let id = store.insert("recoverable", "", Utc::now()).await.unwrap();
        store.claim_next(Utc::now()).await.unwrap().unwrap();

        let engine = QueueEngine::new(store.clone(), fast_config()).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        engine
            .register_handler(
                "recoverable",
                job_handler_fn(move |_, _| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();
        engine.start();

        wait_for_status(&*store, id, JobStatus::Complete).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        engine.close().await;
    }

    #[tokio::test]
    async fn unhandled_job_is_deferred_not_hot_looped() {
        let engine = QueueEngine::new(InMemoryJobStore::new(), fast_config()).unwrap();
        let id = engine.enqueue("unknown", "").await.unwrap();
        engine.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let row = engine.store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Waiting);
        // The deferral pushed eligibility into the future.
        assert!(row.run_at.unwrap() > Utc::now());
        engine.close().await;
    }

    #[tokio::test]
    async fn registration_after_start_is_rejected() {
        let engine = QueueEngine::new(InMemoryJobStore::new(), fast_config()).unwrap();
        engine.start();

        let err = engine
            .register_handler("late", job_handler_fn(|_, _| async { Ok(()) }))
            .unwrap_err();
        assert!(matches!(err, QueueError::AlreadyRunning));
        engine.close().await;
    }

    #[tokio::test]
    async fn close_waits_for_the_in_flight_handler() {
        let engine = QueueEngine::new(InMemoryJobStore::new(), fast_config()).unwrap();

        let finished = Arc::new(AtomicUsize::new(0));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
        let flag = finished.clone();
        engine
            .register_handler(
                "slow",
                job_handler_fn(move |_, _| {
                    let flag = flag.clone();
                    let started_tx = started_tx.clone();
                    async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        flag.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        engine.enqueue("slow", "").await.unwrap();
        engine.start();

        tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
            .await
            .unwrap()
            .unwrap();
        engine.close().await;

        // close() returned only after the handler finished.
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        // A second close is a no-op.
        engine.close().await;
    }
}
