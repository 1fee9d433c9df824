/// Worker side of the work queue
///
/// # Architecture
///
/// ```text
/// QueueProcessor::start()
///   ├─> claim loop: acquire a slot, BLMOVE wait -> active (isolated connection)
///   │     └─> one task per job
///   │           ├─> activate.lua (lock with worker token)
///   │           ├─> lock renewal every lock_duration / 2
///   │           ├─> handler under the job's ExecutionContext
///   │           └─> complete.lua | fail.lua
///   └─> maintenance loop
///         ├─> promote_delayed.lua every delayed_poll_interval
///         └─> recover_stalled.lua every stalled_interval
/// ```
///
/// # Execution context
///
/// The context stored with a job is collapsed to its root origin before the
/// handler runs, so a job enqueued from inside another job still points at the
/// request or schedule that started the chain.
///
/// # Shutdown
///
/// `WorkerHandle::close` stops claiming and waits for in-flight jobs. A claim
/// already blocking in BLMOVE finishes first, so closing can take up to
/// `claim_timeout`.
///
/// # Example
///
/// ```no_run
/// use switchyard_worker::handler::handler_fn;
/// use switchyard_worker::job::JobInfo;
/// use switchyard_worker::options::QueueOptions;
/// use switchyard_worker::queue::QueueClient;
///
/// # async fn example(client: QueueClient) -> anyhow::Result<()> {
/// let queue = client.queue::<String>(QueueOptions::new("emails")).await?;
///
/// let worker = queue
///     .process(handler_fn(|address: String, job: JobInfo| async move {
///         tracing::info!(job_id = %job.id, %address, "Sending welcome email");
///         Ok::<(), anyhow::Error>(())
///     }))
///     .start();
///
/// // ... on shutdown
/// worker.close().await;
/// # Ok(())
/// # }
/// ```

use crate::handler::{JobError, JobHandler};
use crate::job::{ActiveJob, JobData, JobInfo};
use crate::queue::{QueueInner, WorkQueue};
use crate::scripts::FailOutcome;
use chrono::Utc;
use futures::FutureExt;
use redis::aio::MultiplexedConnection;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use switchyard_shared::context::{with_context, ExecutionContext};
use switchyard_shared::retry::{compute_retry_backoff_ms, sleep_or_shutdown, RECONNECT_BACKOFF_MS};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// How long a processor may stay unstarted after a sibling started
const START_WATCHDOG: Duration = Duration::from_secs(10);

/// Pause before a requested retry is recorded
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Delayed jobs promoted per poll
const PROMOTE_BATCH: usize = 1000;

impl<T> WorkQueue<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Binds `handler` to this queue
    ///
    /// Nothing is claimed until `start` is called. If another queue of the
    /// same client starts and this processor is still not started ten seconds
    /// later, a warning is logged.
    pub fn process<H: JobHandler<T>>(&self, handler: H) -> QueueProcessor<T, H> {
        let started = CancellationToken::new();
        spawn_start_watchdog(
            self.inner.client_state.started.subscribe(),
            self.inner.name().to_string(),
            started.clone(),
        );

        QueueProcessor {
            inner: Arc::clone(&self.inner),
            handler: Arc::new(handler),
            started: started.drop_guard(),
            _payload: PhantomData,
        }
    }
}

/// Warns when a sibling starts and `started` does not follow in time
///
/// Ends as soon as `started` is cancelled (the processor started or was
/// dropped) or the client that owns `sibling_started` goes away.
fn spawn_start_watchdog(
    mut sibling_started: watch::Receiver<bool>,
    queue: String,
    started: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let overdue = async {
            if sibling_started.wait_for(|s| *s).await.is_err() {
                return false;
            }
            tokio::time::sleep(START_WATCHDOG).await;
            true
        };

        tokio::select! {
            _ = started.cancelled() => {}
            overdue = overdue => {
                if overdue {
                    tracing::warn!(
                        queue = %queue,
                        "Queue has a processor that was not started; its jobs will not be processed"
                    );
                }
            }
        }
    })
}

/// Handler bound to a queue, not yet running
pub struct QueueProcessor<T, H> {
    inner: Arc<QueueInner>,
    handler: Arc<H>,
    /// Cancels the start watchdog when the processor starts or is dropped
    started: DropGuard,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> QueueProcessor<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: JobHandler<T>,
{
    /// Starts claiming and processing jobs
    pub fn start(self) -> WorkerHandle {
        self.started.disarm().cancel();
        self.inner.client_state.started.send_replace(true);

        let worker_id = format!("worker-{}", Uuid::new_v4());
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let worker = Arc::new(Worker {
            slots: Arc::new(Semaphore::new(self.inner.options.worker.concurrency)),
            inner: self.inner,
            handler: self.handler,
            worker_id: worker_id.clone(),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
            _payload: PhantomData,
        });

        tracing::info!(
            queue = %worker.inner.name(),
            worker_id = %worker_id,
            concurrency = worker.inner.options.worker.concurrency,
            "Worker started"
        );

        tracker.spawn(Arc::clone(&worker).claim_loop());
        tracker.spawn(worker.maintenance_loop());

        WorkerHandle {
            worker_id,
            shutdown,
            tracker,
        }
    }
}

/// Running worker
pub struct WorkerHandle {
    worker_id: String,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerHandle {
    /// Worker id; lock tokens start with it
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Whether `close` has been requested
    pub fn is_closing(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stops claiming and waits for in-flight jobs to finish
    pub async fn close(self) {
        tracing::info!(worker_id = %self.worker_id, "Worker closing");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(worker_id = %self.worker_id, "Worker closed");
    }
}

struct Worker<T, H> {
    inner: Arc<QueueInner>,
    handler: Arc<H>,
    worker_id: String,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> Worker<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: JobHandler<T>,
{
    async fn claim_loop(self: Arc<Self>) {
        let queue = self.inner.name().to_string();
        let keys = &self.inner.keys;
        let claim_timeout = self.inner.options.worker.claim_timeout;
        let mut reader: Option<MultiplexedConnection> = None;
        let mut failure_streak: u32 = 0;

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if reader.is_none() {
                match self.inner.redis.isolated_connection().await {
                    Ok(conn) => reader = Some(conn),
                    Err(e) => {
                        failure_streak = failure_streak.saturating_add(1);
                        let backoff = compute_retry_backoff_ms(RECONNECT_BACKOFF_MS, failure_streak);
                        tracing::warn!(queue = %queue, retry_backoff_ms = backoff, error = %e, "Failed to open claim connection");
                        drop(permit);
                        sleep_or_shutdown(&self.shutdown, backoff).await;
                        continue;
                    }
                }
            }
            let Some(conn) = reader.as_mut() else {
                continue;
            };

            let claimed: redis::RedisResult<Option<String>> = redis::cmd("BLMOVE")
                .arg(keys.wait())
                .arg(keys.active())
                .arg("RIGHT")
                .arg("LEFT")
                .arg(claim_timeout.as_secs_f64())
                .query_async(conn)
                .await;

            match claimed {
                Ok(Some(job_id)) => {
                    failure_streak = 0;
                    let worker = Arc::clone(&self);
                    self.tracker.spawn(async move {
                        worker.run_job(job_id).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    failure_streak = 0;
                }
                Err(e) => {
                    failure_streak = failure_streak.saturating_add(1);
                    let backoff = compute_retry_backoff_ms(RECONNECT_BACKOFF_MS, failure_streak);
                    tracing::warn!(
                        queue = %queue,
                        failure_streak,
                        retry_backoff_ms = backoff,
                        error = %e,
                        "Claim failed, reconnecting"
                    );
                    reader = None;
                    drop(permit);
                    sleep_or_shutdown(&self.shutdown, backoff).await;
                }
            }
        }

        tracing::debug!(queue = %queue, worker_id = %self.worker_id, "Claim loop stopped");
    }

    async fn run_job(&self, job_id: String) {
        let inner = &self.inner;
        let queue = inner.name();
        let token = format!("{}:{}", self.worker_id, Uuid::new_v4());
        let lock_ms = inner.options.worker.lock_duration.as_millis() as u64;
        let mut conn = inner.redis.get_connection();

        let activated = inner
            .scripts
            .activate(
                &mut conn,
                &inner.keys,
                &job_id,
                &token,
                lock_ms,
                Utc::now().timestamp_millis(),
                inner.events_max_len(),
            )
            .await;

        let job = match activated {
            Ok(Some(fields)) => ActiveJob::from_fields(job_id, fields),
            Ok(None) => {
                tracing::debug!(queue = %queue, job_id = %job_id, "Claimed job no longer exists");
                return;
            }
            Err(e) => {
                // The job stays in the active list without a lock; stalled recovery returns it
                inner.reporter.report(&anyhow::Error::new(e), "activate queue job");
                return;
            }
        };

        let (payload, captured) = match JobData::decode::<T>(&job.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                let error = anyhow::Error::new(e).context(format!("decoding job {}", job.id));
                inner.reporter.report(&error, "queue job");
                self.record_failure(&job, &token, &format!("{:#}", error), true).await;
                return;
            }
        };

        let info = JobInfo {
            id: job.id.clone(),
            queue: queue.to_string(),
            attempt: job.attempt(),
            max_attempts: job.attempts,
            enqueued_at: job.enqueued_at,
            context: ExecutionContext::job(job.id.as_str(), queue, captured.as_ref()),
        };

        tracing::debug!(queue = %queue, job_id = %job.id, attempt = info.attempt, "Job started");

        let outcome = {
            // Held until the failure is recorded, retry pause included
            let _renewal = self.spawn_lock_renewal(&job.id, &token);
            let handling = AssertUnwindSafe(self.handler.handle(payload, &info)).catch_unwind();
            let outcome = with_context(info.context.clone(), handling).await;
            if let Ok(Err(JobError::Retry(reason))) = &outcome {
                tracing::debug!(queue = %queue, job_id = %job.id, reason = %reason, "Job asked to be retried");
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            outcome
        };

        match outcome {
            Ok(Ok(())) => self.record_success(&job, &token).await,
            Ok(Err(JobError::Retry(reason))) => {
                self.record_failure(&job, &token, &reason, false).await;
            }
            Ok(Err(JobError::Failed(e))) => {
                inner.reporter.report(&e, "queue job");
                self.record_failure(&job, &token, &format!("{:#}", e), false).await;
            }
            Err(panic) => {
                let reason = format!("handler panicked: {}", panic_message(panic.as_ref()));
                inner.reporter.report(&anyhow::anyhow!(reason.clone()), "queue job");
                self.record_failure(&job, &token, &reason, false).await;
            }
        }
    }

    async fn record_success(&self, job: &ActiveJob, token: &str) {
        let inner = &self.inner;
        let mut conn = inner.redis.get_connection();

        match inner
            .scripts
            .complete(
                &mut conn,
                &inner.keys,
                &job.id,
                token,
                Utc::now().timestamp_millis(),
                inner.events_max_len(),
            )
            .await
        {
            Ok(true) => tracing::info!(queue = %inner.name(), job_id = %job.id, "Job completed"),
            Ok(false) => tracing::warn!(
                queue = %inner.name(),
                job_id = %job.id,
                "Job finished after its lock was lost; result not recorded"
            ),
            Err(e) => inner
                .reporter
                .report(&anyhow::Error::new(e), "complete queue job"),
        }
    }

    async fn record_failure(&self, job: &ActiveJob, token: &str, reason: &str, unrecoverable: bool) {
        let inner = &self.inner;
        let retry_delay_ms = job
            .backoff
            .map(|b| b.delay_for(job.attempt()).as_millis() as u64)
            .unwrap_or(0);
        let mut conn = inner.redis.get_connection();

        let outcome = inner
            .scripts
            .fail(
                &mut conn,
                &inner.keys,
                &job.id,
                token,
                Utc::now().timestamp_millis(),
                reason,
                retry_delay_ms,
                unrecoverable,
                inner.events_max_len(),
            )
            .await;

        match outcome {
            Ok(FailOutcome::Retrying) => tracing::info!(
                queue = %inner.name(),
                job_id = %job.id,
                attempt = job.attempt(),
                max_attempts = job.attempts,
                retry_delay_ms,
                "Job failed, retrying"
            ),
            Ok(FailOutcome::Failed) => tracing::warn!(
                queue = %inner.name(),
                job_id = %job.id,
                attempt = job.attempt(),
                reason = %reason,
                "Job failed"
            ),
            Ok(FailOutcome::LockLost) => tracing::warn!(
                queue = %inner.name(),
                job_id = %job.id,
                "Job failed after its lock was lost; failure not recorded"
            ),
            Ok(FailOutcome::Missing) => {
                tracing::debug!(queue = %inner.name(), job_id = %job.id, "Failed job no longer exists")
            }
            Err(e) => inner
                .reporter
                .report(&anyhow::Error::new(e), "fail queue job"),
        }
    }

    /// Keeps the job lock alive until the returned guard is dropped
    fn spawn_lock_renewal(&self, job_id: &str, token: &str) -> DropGuard {
        let stop = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let job_id = job_id.to_string();
        let token = token.to_string();
        let lock_duration = inner.options.worker.lock_duration;
        let guard = stop.clone().drop_guard();

        tokio::spawn(async move {
            let mut conn = inner.redis.get_connection();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(lock_duration / 2) => {}
                }

                match inner
                    .scripts
                    .extend_lock(&mut conn, &inner.keys, &job_id, &token, lock_duration.as_millis() as u64)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(queue = %inner.name(), job_id = %job_id, "Job lock lost");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(queue = %inner.name(), job_id = %job_id, error = %e, "Failed to extend job lock");
                    }
                }
            }
        });

        guard
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let inner = &self.inner;
        let options = &inner.options.worker;

        let mut promote = tokio::time::interval(options.delayed_poll_interval);
        promote.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stalled = tokio::time::interval(options.stalled_interval);
        stalled.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = promote.tick() => {
                    let mut conn = inner.redis.get_connection();
                    match inner
                        .scripts
                        .promote_delayed(&mut conn, &inner.keys, Utc::now().timestamp_millis(), PROMOTE_BATCH, inner.events_max_len())
                        .await
                    {
                        Ok(0) => {}
                        Ok(moved) => tracing::debug!(queue = %inner.name(), moved, "Promoted delayed jobs"),
                        Err(e) => tracing::warn!(queue = %inner.name(), error = %e, "Failed to promote delayed jobs"),
                    }
                }
                _ = stalled.tick() => {
                    let mut conn = inner.redis.get_connection();
                    match inner
                        .scripts
                        .recover_stalled(
                            &mut conn,
                            &inner.keys,
                            options.max_stalled_count,
                            Utc::now().timestamp_millis(),
                            inner.events_max_len(),
                        )
                        .await
                    {
                        Ok((recovered, failed)) => {
                            for job_id in &recovered {
                                tracing::warn!(queue = %inner.name(), job_id = %job_id, "Stalled job returned to wait list");
                            }
                            for job_id in &failed {
                                tracing::warn!(queue = %inner.name(), job_id = %job_id, "Stalled job failed");
                            }
                        }
                        Err(e) => inner.reporter.report(&anyhow::Error::new(e), "recover stalled jobs"),
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
