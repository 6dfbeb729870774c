//! Scheduler tick loop.
//!
//! One loop per replica. Each tick: refresh every entry's next fire
//! instant from the shared register, sleep until the earliest one, then
//! for each due entry take the fire mutex; the winner invokes the
//! handler and advances the register. Losing the mutex means another
//! replica is firing this instant; the loser's cached instant is corrected
//! by the next refresh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetlink_locks::{LockError, LockManager};
use fleetlink_queue::Enqueue;

use crate::entry::{coarse, mutex_key, parse_standard, InvalidCron, ScheduleEntry};
use crate::register::{RegisterError, ScheduleRegister};

// The fire lock covers the interval minus a slack so it has certainly
// expired by the time the next tick needs it.
const LOCK_SLACK: f64 = 0.1;
const LOCK_MAX_TRIES: u32 = 2;

/// Scheduler error.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    InvalidCron(#[from] InvalidCron),

    /// Jobs can only be added while the scheduler is stopped.
    #[error("cannot add new job while scheduler is running")]
    AlreadyRunning,

    #[error(transparent)]
    Register(#[from] RegisterError),
}

/// Callback invoked when this replica wins a fire instant.
#[async_trait]
pub trait ScheduleHandler: Send + Sync {
    async fn fire(&self, fired_at: DateTime<Utc>, job_name: &str, cron_spec: &str);
}

/// [`ScheduleHandler`] built from an async closure.
pub struct FnScheduleHandler {
    inner: Box<dyn Fn(DateTime<Utc>, String, String) -> BoxFuture<'static, ()> + Send + Sync>,
}

/// Wrap an async closure as a [`ScheduleHandler`].
pub fn schedule_handler_fn<F, Fut>(f: F) -> FnScheduleHandler
where
    F: Fn(DateTime<Utc>, String, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    FnScheduleHandler {
        inner: Box::new(move |fired_at, name, spec| Box::pin(f(fired_at, name, spec))),
    }
}

#[async_trait]
impl ScheduleHandler for FnScheduleHandler {
    async fn fire(&self, fired_at: DateTime<Utc>, job_name: &str, cron_spec: &str) {
        (self.inner)(fired_at, job_name.to_owned(), cron_spec.to_owned()).await
    }
}

#[derive(Default)]
struct RunState {
    running: bool,
    stop: Option<mpsc::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

struct SchedulerInner<R, L> {
    register: R,
    locks: L,
    entries: Mutex<Vec<ScheduleEntry>>,
    handlers: Mutex<HashMap<String, Arc<dyn ScheduleHandler>>>,
    state: Mutex<RunState>,
}

/// Replicated cron scheduler.
pub struct Scheduler<R, L> {
    inner: Arc<SchedulerInner<R, L>>,
}

impl<R, L> Clone for Scheduler<R, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R, L> Scheduler<R, L>
where
    R: ScheduleRegister + 'static,
    L: LockManager + 'static,
{
    pub fn new(register: R, locks: L) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                register,
                locks,
                entries: Mutex::new(Vec::new()),
                handlers: Mutex::new(HashMap::new()),
                state: Mutex::new(RunState::default()),
            }),
        }
    }

    /// Register a cron job. Only allowed while stopped.
    ///
    /// A replica joining mid-run adopts the fleet's next fire instant from
    /// the shared register; the first replica to see a job seeds it.
    pub async fn schedule<H>(
        &self,
        job_name: &str,
        cron_spec: &str,
        handler: H,
    ) -> Result<(), ScheduleError>
    where
        H: ScheduleHandler + 'static,
    {
        if self.inner.state.lock().unwrap().running {
            return Err(ScheduleError::AlreadyRunning);
        }

        let schedule = parse_standard(cron_spec)?;
        let now = coarse(Utc::now());
        let mut entry = ScheduleEntry {
            job_name: job_name.to_owned(),
            cron_spec: cron_spec.to_owned(),
            schedule,
            next_execution: now,
        };
        let seeded = entry.next_after(now).ok_or_else(|| InvalidCron {
            spec: cron_spec.to_owned(),
            reason: "schedule never fires".to_owned(),
        })?;
        entry.next_execution = seeded;

        match self.inner.register.load(job_name, cron_spec).await? {
            Some(ts) => {
                if let Some(agreed) = DateTime::from_timestamp(ts, 0) {
                    entry.next_execution = agreed;
                }
            }
            None => {
                let ttl = (seeded - now).to_std().unwrap_or(Duration::from_secs(1));
                self.inner
                    .register
                    .store(job_name, cron_spec, seeded.timestamp(), ttl)
                    .await?;
            }
        }

        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(job_name.to_owned(), Arc::new(handler));
        self.inner.entries.lock().unwrap().push(entry);
        Ok(())
    }

    /// Register a cron job that fires by enqueueing an empty-payload job.
    pub async fn schedule_to_queue(
        &self,
        job_name: &str,
        cron_spec: &str,
        queue: Arc<dyn Enqueue>,
    ) -> Result<(), ScheduleError> {
        let handler = schedule_handler_fn(move |_fired_at, name, _spec| {
            let queue = queue.clone();
            async move {
                if let Err(e) = queue.enqueue(&name, "").await {
                    warn!(job_name = %name, error = %e, "scheduled enqueue failed");
                }
            }
        });
        self.schedule(job_name, cron_spec, handler).await
    }

    /// Start the tick loop. Idempotent.
    pub fn start(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.running {
            return;
        }
        state.running = true;

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        state.stop = Some(stop_tx);
        state.join = Some(tokio::spawn(run_loop(self.inner.clone(), stop_rx)));
        info!("scheduler running");
    }

    /// Stop the tick loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let (stop, join) = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.running {
                return;
            }
            state.running = false;
            (state.stop.take(), state.join.take())
        };

        if let Some(stop) = stop {
            let _ = stop.try_send(());
        }
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

async fn run_loop<R, L>(inner: Arc<SchedulerInner<R, L>>, mut stop: mpsc::Receiver<()>)
where
    R: ScheduleRegister + 'static,
    L: LockManager + 'static,
{
    loop {
        if inner.entries.lock().unwrap().is_empty() {
            inner.state.lock().unwrap().running = false;
            return;
        }

        refresh_entries(&inner).await;

        let earliest = {
            let mut entries = inner.entries.lock().unwrap();
            entries.sort_by_key(|e| e.next_execution);
            entries[0].next_execution
        };
        let wait = (earliest - coarse(Utc::now()))
            .to_std()
            .unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                fire_due(&inner, coarse(Utc::now())).await;
            }
            _ = stop.recv() => {
                debug!("scheduler stopped intentionally");
                return;
            }
        }
    }
}

/// Pull every entry's canonical next fire instant from the register, so
/// replicas that started at different times converge on the same tick.
async fn refresh_entries<R, L>(inner: &Arc<SchedulerInner<R, L>>)
where
    R: ScheduleRegister + 'static,
    L: LockManager + 'static,
{
    let keys: Vec<(String, String)> = {
        let entries = inner.entries.lock().unwrap();
        entries
            .iter()
            .map(|e| (e.job_name.clone(), e.cron_spec.clone()))
            .collect()
    };

    for (job_name, cron_spec) in keys {
        match inner.register.load(&job_name, &cron_spec).await {
            Ok(Some(ts)) => {
                if let Some(agreed) = DateTime::from_timestamp(ts, 0) {
                    let mut entries = inner.entries.lock().unwrap();
                    if let Some(entry) = entries
                        .iter_mut()
                        .find(|e| e.job_name == job_name && e.cron_spec == cron_spec)
                    {
                        entry.next_execution = agreed;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(job_name = %job_name, error = %e, "schedule refresh failed"),
        }
    }
}

async fn fire_due<R, L>(inner: &Arc<SchedulerInner<R, L>>, now: DateTime<Utc>)
where
    R: ScheduleRegister + 'static,
    L: LockManager + 'static,
{
    let due: Vec<ScheduleEntry> = {
        let entries = inner.entries.lock().unwrap();
        entries
            .iter()
            .filter(|e| e.next_execution <= now)
            .cloned()
            .collect()
    };

    for entry in due {
        let handler = inner.handlers.lock().unwrap().get(&entry.job_name).cloned();
        let Some(handler) = handler else { continue };

        match try_fire_lock(inner, &entry, now).await {
            Ok(_lease) => {
                // The lease is deliberately never released: its expiry is
                // the exclusion window for this fire instant.
                let fired_at = now;
                let job_name = entry.job_name.clone();
                let cron_spec = entry.cron_spec.clone();
                tokio::spawn(async move {
                    handler.fire(fired_at, &job_name, &cron_spec).await;
                });

                advance_entry(inner, &entry, now).await;
            }
            Err(LockError::Busy(_)) => {
                debug!(job_name = %entry.job_name, "another replica is firing this tick");
            }
            Err(e) => {
                warn!(job_name = %entry.job_name, error = %e, "fire lock failed");
            }
        }
    }
}

async fn try_fire_lock<R, L>(
    inner: &Arc<SchedulerInner<R, L>>,
    entry: &ScheduleEntry,
    now: DateTime<Utc>,
) -> Result<fleetlink_locks::LockLease, LockError>
where
    R: ScheduleRegister + 'static,
    L: LockManager + 'static,
{
    let interval = entry
        .next_after(now)
        .and_then(|next| (next - now).to_std().ok())
        .unwrap_or(Duration::from_secs(1));
    let lease = interval.mul_f64(1.0 - LOCK_SLACK);

    inner
        .locks
        .acquire(
            &mutex_key(&entry.job_name, &entry.cron_spec),
            lease,
            LOCK_MAX_TRIES,
        )
        .await
}

/// Advance the entry past `now` and publish the new instant so lagging
/// replicas converge on the same future tick.
async fn advance_entry<R, L>(
    inner: &Arc<SchedulerInner<R, L>>,
    entry: &ScheduleEntry,
    now: DateTime<Utc>,
) where
    R: ScheduleRegister + 'static,
    L: LockManager + 'static,
{
    let Some(next) = entry.next_after(now) else {
        warn!(job_name = %entry.job_name, "schedule has no future fire instant");
        return;
    };

    {
        let mut entries = inner.entries.lock().unwrap();
        if let Some(e) = entries
            .iter_mut()
            .find(|e| e.job_name == entry.job_name && e.cron_spec == entry.cron_spec)
        {
            e.next_execution = next;
        }
    }

    let ttl = (next - now).to_std().unwrap_or(Duration::from_secs(1));
    if let Err(e) = inner
        .register
        .store(&entry.job_name, &entry.cron_spec, next.timestamp(), ttl)
        .await
    {
        warn!(job_name = %entry.job_name, error = %e, "failed to publish next fire instant");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fleetlink_locks::InMemoryLockManager;

    use super::*;
    use crate::register::InMemoryScheduleRegister;

    type TestScheduler = Scheduler<Arc<InMemoryScheduleRegister>, Arc<InMemoryLockManager>>;

    fn fleet(
        size: usize,
    ) -> (
        Vec<TestScheduler>,
        Arc<InMemoryScheduleRegister>,
        Arc<InMemoryLockManager>,
    ) {
        let register = Arc::new(InMemoryScheduleRegister::new());
        let locks = Arc::new(InMemoryLockManager::new());
        let schedulers = (0..size)
            .map(|_| Scheduler::new(register.clone(), locks.clone()))
            .collect();
        (schedulers, register, locks)
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected() {
        let (fleet, _, _) = fleet(1);
        let err = fleet[0]
            .schedule("bad", "not a cron", schedule_handler_fn(|_, _, _| async {}))
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCron(_)));
    }

    #[tokio::test]
    async fn scheduling_while_running_is_rejected() {
        let (fleet, _, _) = fleet(1);
        let scheduler = &fleet[0];

        scheduler
            .schedule("tick", "* * * * * *", schedule_handler_fn(|_, _, _| async {}))
            .await
            .unwrap();
        scheduler.start();

        let err = scheduler
            .schedule("more", "* * * * * *", schedule_handler_fn(|_, _, _| async {}))
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::AlreadyRunning));

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_start_restarts() {
        let (fleet, _, _) = fleet(1);
        let scheduler = &fleet[0];

        scheduler
            .schedule("tick", "* * * * * *", schedule_handler_fn(|_, _, _| async {}))
            .await
            .unwrap();

        scheduler.start();
        scheduler.start();
        scheduler.stop().await;
        scheduler.stop().await;
        scheduler.start();
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn each_fire_instant_is_won_by_exactly_one_replica() {
        let (fleet, _, _) = fleet(2);

        let fired: Arc<Mutex<Vec<(usize, i64)>>> = Arc::new(Mutex::new(Vec::new()));
        for (replica, scheduler) in fleet.iter().enumerate() {
            let fired = fired.clone();
            scheduler
                .schedule(
                    "tick",
                    "* * * * * *",
                    schedule_handler_fn(move |fired_at, _, _| {
                        let fired = fired.clone();
                        async move {
                            fired.lock().unwrap().push((replica, fired_at.timestamp()));
                        }
                    }),
                )
                .await
                .unwrap();
        }

        for scheduler in &fleet {
            scheduler.start();
        }
        tokio::time::sleep(Duration::from_millis(2500)).await;
        for scheduler in &fleet {
            scheduler.stop().await;
        }

        let fired = fired.lock().unwrap();
        assert!(!fired.is_empty(), "no tick fired in 2.5s");

        // No fire instant is claimed twice, by the same or another replica.
        let mut instants: Vec<i64> = fired.iter().map(|(_, ts)| *ts).collect();
        instants.sort_unstable();
        instants.dedup();
        assert_eq!(
            instants.len(),
            fired.len(),
            "a fire instant was executed more than once: {fired:?}"
        );
    }

    #[tokio::test]
    async fn late_joiner_adopts_the_fleets_next_fire_instant() {
        let (fleet, register, _) = fleet(1);
        let scheduler = &fleet[0];

        // The rest of the fleet already agreed on a fire instant two
        // seconds out, later than this replica's natural next second.
        let agreed = coarse(Utc::now()) + chrono::Duration::seconds(2);
        register
            .store("tick", "* * * * * *", agreed.timestamp(), Duration::from_secs(60))
            .await
            .unwrap();

        let fired: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        scheduler
            .schedule(
                "tick",
                "* * * * * *",
                schedule_handler_fn(move |fired_at, _, _| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(fired_at.timestamp());
                    }
                }),
            )
            .await
            .unwrap();

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(2600)).await;
        scheduler.stop().await;

        let fired = fired.lock().unwrap();
        assert!(!fired.is_empty(), "adopted instant never fired");
        assert!(
            fired[0] >= agreed.timestamp(),
            "fired at {} before the agreed instant {}",
            fired[0],
            agreed.timestamp()
        );
    }

    #[tokio::test]
    async fn scheduler_with_no_entries_stops_itself() {
        let (fleet, _, _) = fleet(1);
        let scheduler = &fleet[0];

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The loop exited and cleared the running flag, so scheduling is
        // allowed again.
        scheduler
            .schedule("tick", "* * * * * *", schedule_handler_fn(|_, _, _| async {}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn schedule_to_queue_fires_an_empty_payload_job() {
        use fleetlink_queue::{JobId, QueueError};

        struct RecordingQueue {
            jobs: Mutex<Vec<(String, String)>>,
            count: AtomicUsize,
        }

        #[async_trait]
        impl Enqueue for RecordingQueue {
            async fn enqueue(&self, job_name: &str, payload: &str) -> Result<JobId, QueueError> {
                self.jobs
                    .lock()
                    .unwrap()
                    .push((job_name.to_owned(), payload.to_owned()));
                Ok(JobId(self.count.fetch_add(1, Ordering::SeqCst) as i64))
            }

            async fn enqueue_delayed(
                &self,
                job_name: &str,
                payload: &str,
                _delay_secs: u64,
            ) -> Result<JobId, QueueError> {
                self.enqueue(job_name, payload).await
            }
        }

        let (fleet, _, _) = fleet(1);
        let scheduler = &fleet[0];
        let queue = Arc::new(RecordingQueue {
            jobs: Mutex::new(Vec::new()),
            count: AtomicUsize::new(1),
        });

        scheduler
            .schedule_to_queue("nightly_report", "* * * * * *", queue.clone())
            .await
            .unwrap();
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.stop().await;

        let jobs = queue.jobs.lock().unwrap();
        assert!(!jobs.is_empty(), "scheduled job never reached the queue");
        assert_eq!(jobs[0].0, "nightly_report");
        assert_eq!(jobs[0].1, "");
    }
}
