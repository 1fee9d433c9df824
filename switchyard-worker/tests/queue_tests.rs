/// Integration tests for the work queue
///
/// These tests require a running Redis instance (6.2 or later for BLMOVE).
/// Run with: cargo test --test queue_tests -- --ignored

mod common;

use chrono::{DateTime, TimeZone, Utc};
use common::TestContext;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard_shared::context::{with_context, ContextKind, ExecutionContext};
use switchyard_worker::handler::{handler_fn, JobError};
use switchyard_worker::job::{JobInfo, JobState};
use switchyard_worker::options::{AddOptions, Backoff};
use switchyard_worker::queue::QueueError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reminder {
    user_id: u64,
    due: DateTime<Utc>,
}

fn reminder(user_id: u64) -> Reminder {
    Reminder {
        user_id,
        due: Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
    }
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_job_round_trip_preserves_payload() {
    let ctx = TestContext::new().await.unwrap();
    let queue = ctx.queue::<Reminder>(ctx.options("round-trip")).await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    let worker = queue
        .process(handler_fn(move |payload: Reminder, job: JobInfo| {
            let sink = sink.clone();
            async move {
                assert_eq!(job.attempt, 1);
                sink.lock().unwrap().push(payload);
                Ok::<(), anyhow::Error>(())
            }
        }))
        .start();

    let job = queue.add(&reminder(7), AddOptions::default()).await.unwrap();
    assert!(job.is_new());
    job.wait_until_finished(Some(Duration::from_secs(10))).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![reminder(7)]);
    // removed on completion by default
    assert_eq!(job.state().await.unwrap(), None);

    worker.close().await;
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_context_is_flattened_to_root_origin() {
    let ctx = TestContext::new().await.unwrap();
    let queue = ctx.queue::<u32>(ctx.options("context")).await.unwrap();
    let captured = Arc::new(Mutex::new(None));

    let request = ExecutionContext::request(Some("10.1.2.3".to_string()), None);
    let outer_job = ExecutionContext::job("outer", "other", Some(&request));

    let sink = captured.clone();
    let worker = queue
        .process(handler_fn(move |_: u32, job: JobInfo| {
            let sink = sink.clone();
            async move {
                *sink.lock().unwrap() = switchyard_shared::context::current_context();
                assert!(job.context.is_job());
                Ok::<(), anyhow::Error>(())
            }
        }))
        .start();

    let job = with_context(outer_job, queue.add(&1, AddOptions::default()))
        .await
        .unwrap();
    job.wait_until_finished(Some(Duration::from_secs(10))).await.unwrap();

    let seen = captured.lock().unwrap().clone().expect("handler saw no context");
    assert_eq!(seen.context_id, job.id());
    assert!(matches!(seen.kind, ContextKind::Job { .. }));
    assert_eq!(seen.parent.as_deref(), Some(&request));

    worker.close().await;
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_failures_retry_until_attempts_run_out() {
    let ctx = TestContext::new().await.unwrap();
    let mut options = ctx.options("retries");
    options.job.attempts = 3;
    let queue = ctx.queue::<u32>(options).await.unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let worker = queue
        .process(handler_fn(move |_: u32, _: JobInfo| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("mailbox full"))
            }
        }))
        .start();

    let job = queue.add(&1, AddOptions::default()).await.unwrap();
    let result = job.wait_until_finished(Some(Duration::from_secs(10))).await;

    match result {
        Err(QueueError::JobFailed { reason, .. }) => assert_eq!(reason, "mailbox full"),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(ctx.report_count(), 3);

    worker.close().await;
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_failed_job_is_kept_with_logs() {
    let ctx = TestContext::new().await.unwrap();
    let mut options = ctx.options("keep-failed");
    options.job.attempts = 2;
    options.job.remove_on_fail = false;
    options.job.backoff = Some(Backoff::Fixed(50));
    let queue = ctx.queue::<u32>(options).await.unwrap();

    let worker = queue
        .process(handler_fn(|n: u32, job: JobInfo| async move {
            Err::<(), _>(anyhow::anyhow!("attempt {} of {}", job.attempt, n))
        }))
        .start();

    let job = queue.add(&2, AddOptions::default()).await.unwrap();
    assert!(job.wait_until_finished(Some(Duration::from_secs(10))).await.is_err());

    assert_eq!(job.state().await.unwrap(), Some(JobState::Failed));
    assert_eq!(
        queue.logs(job.id()).await.unwrap(),
        vec!["attempt 1 of 2".to_string(), "attempt 2 of 2".to_string()]
    );

    worker.close().await;
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_retry_request_is_not_reported() {
    let ctx = TestContext::new().await.unwrap();
    let queue = ctx.queue::<u32>(ctx.options("retry-request")).await.unwrap();

    let worker = queue
        .process(handler_fn(|_: u32, job: JobInfo| async move {
            if job.attempt == 1 {
                Err(JobError::retry("upstream busy"))
            } else {
                Ok(())
            }
        }))
        .start();

    let job = queue.add(&1, AddOptions::default()).await.unwrap();
    job.wait_until_finished(Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(ctx.report_count(), 0);

    worker.close().await;
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_retry_pause_keeps_the_lock() {
    let ctx = TestContext::new().await.unwrap();
    let mut options = ctx.options("retry-lock");
    // Shorter than the pause before a retry is recorded
    options.worker.lock_duration = Duration::from_millis(300);
    options.worker.stalled_interval = Duration::from_millis(100);
    let queue = ctx.queue::<u32>(options).await.unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let sink = attempts.clone();
    let worker = queue
        .process(handler_fn(move |_: u32, job: JobInfo| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(job.attempt);
                if job.attempt == 1 {
                    Err(JobError::retry("upstream busy"))
                } else {
                    Ok(())
                }
            }
        }))
        .start();

    let job = queue.add(&1, AddOptions::default()).await.unwrap();
    job.wait_until_finished(Some(Duration::from_secs(10))).await.unwrap();

    // A lock lost during the pause would hand attempt 1 out a second time
    assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);
    assert_eq!(ctx.report_count(), 0);

    worker.close().await;
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_panicking_handler_counts_as_failure() {
    let ctx = TestContext::new().await.unwrap();
    let mut options = ctx.options("panic");
    options.job.attempts = 1;
    let queue = ctx.queue::<u32>(options).await.unwrap();

    let worker = queue
        .process(handler_fn(|_: u32, _: JobInfo| async move {
            if true {
                panic!("template missing");
            }
            Ok::<(), anyhow::Error>(())
        }))
        .start();

    let job = queue.add(&1, AddOptions::default()).await.unwrap();
    match job.wait_until_finished(Some(Duration::from_secs(10))).await {
        Err(QueueError::JobFailed { reason, .. }) => assert!(reason.contains("template missing")),
        other => panic!("unexpected result: {:?}", other),
    }

    worker.close().await;
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_delayed_job_waits() {
    let ctx = TestContext::new().await.unwrap();
    let queue = ctx.queue::<u32>(ctx.options("delayed")).await.unwrap();

    let job = queue
        .add(&1, AddOptions::delayed(Duration::from_millis(500)))
        .await
        .unwrap();
    assert_eq!(job.state().await.unwrap(), Some(JobState::Delayed));
    assert_eq!(queue.counts().await.unwrap().delayed, 1);

    let worker = queue
        .process(handler_fn(|_: u32, _: JobInfo| async { Ok::<(), anyhow::Error>(()) }))
        .start();

    let started = tokio::time::Instant::now();
    job.wait_until_finished(Some(Duration::from_secs(10))).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));

    worker.close().await;
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_explicit_id_and_deduplication() {
    let ctx = TestContext::new().await.unwrap();
    let queue = ctx.queue::<u32>(ctx.options("dedup")).await.unwrap();

    let first = queue.add(&1, AddOptions::with_id("invoice-9")).await.unwrap();
    let again = queue.add(&2, AddOptions::with_id("invoice-9")).await.unwrap();
    assert!(first.is_new());
    assert!(!again.is_new());
    assert_eq!(again.id(), "invoice-9");

    let a = queue
        .add(&3, AddOptions::deduplicated("digest:42", Some(Duration::from_secs(60))))
        .await
        .unwrap();
    let b = queue
        .add(&4, AddOptions::deduplicated("digest:42", Some(Duration::from_secs(60))))
        .await
        .unwrap();
    assert!(a.is_new());
    assert!(!b.is_new());
    assert_eq!(a.id(), b.id());

    assert_eq!(queue.counts().await.unwrap().waiting, 2);
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_add_many_is_processed() {
    let ctx = TestContext::new().await.unwrap();
    let queue = ctx.queue::<u64>(ctx.options("many")).await.unwrap();
    let total = Arc::new(AtomicU32::new(0));

    let sum = total.clone();
    let worker = queue
        .process(handler_fn(move |n: u64, _: JobInfo| {
            let sum = sum.clone();
            async move {
                sum.fetch_add(n as u32, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        }))
        .start();

    let jobs = queue.add_many(&[1, 2, 3, 4], AddOptions::default()).await.unwrap();
    assert_eq!(jobs.len(), 4);
    for job in &jobs {
        job.wait_until_finished(Some(Duration::from_secs(10))).await.unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 10);

    let rejected = queue.add_many(&[5], AddOptions::with_id("x")).await;
    assert!(matches!(rejected, Err(QueueError::InvalidOptions(_))));

    worker.close().await;
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_wait_times_out_without_worker() {
    let ctx = TestContext::new().await.unwrap();
    let queue = ctx.queue::<u32>(ctx.options("timeout")).await.unwrap();

    let job = queue.add(&1, AddOptions::default()).await.unwrap();
    let result = job.wait_until_finished(Some(Duration::from_millis(300))).await;

    assert!(matches!(result, Err(QueueError::WaitTimeout { .. })));
    assert_eq!(job.state().await.unwrap(), Some(JobState::Waiting));
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_stalled_job_is_recovered() {
    let ctx = TestContext::new().await.unwrap();
    let mut options = ctx.options("stalled");
    options.worker.stalled_interval = Duration::from_millis(200);
    let queue = ctx.queue::<u32>(options.clone()).await.unwrap();

    let job = queue.add(&1, AddOptions::default()).await.unwrap();

    // Simulate a worker that claimed the job and died before locking it
    let prefix = format!("{}:{}:", options.queue.prefix, options.name);
    let mut conn = ctx.redis.get_connection();
    let moved: Option<String> = redis::cmd("LMOVE")
        .arg(format!("{}wait", prefix))
        .arg(format!("{}active", prefix))
        .arg("RIGHT")
        .arg("LEFT")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(moved.as_deref(), Some(job.id()));

    let worker = queue
        .process(handler_fn(|_: u32, _: JobInfo| async { Ok::<(), anyhow::Error>(()) }))
        .start();

    job.wait_until_finished(Some(Duration::from_secs(10))).await.unwrap();
    worker.close().await;
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_close_waits_for_running_job() {
    let ctx = TestContext::new().await.unwrap();
    let queue = ctx.queue::<u32>(ctx.options("close")).await.unwrap();
    let finished = Arc::new(AtomicU32::new(0));

    let done = finished.clone();
    let worker = queue
        .process(handler_fn(move |_: u32, _: JobInfo| {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        }))
        .start();

    queue.add(&1, AddOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    worker.close().await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}
