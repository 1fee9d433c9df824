/// Error-tracking sink and best-effort background work
///
/// Paths that must never fail their caller (tag cleanup, stream trimming,
/// invalidation broadcasts) hand their errors to an `ErrorReporter` instead of
/// returning them. `BackgroundTask::spawn` is the only way such work is started,
/// which keeps fire-and-forget confined to operations documented as best effort.
///
/// # Example
///
/// ```no_run
/// use switchyard_shared::report::{default_reporter, BackgroundTask};
///
/// # async fn example() {
/// let reporter = default_reporter();
/// BackgroundTask::spawn(reporter, "cleanup", async {
///     Err::<(), std::io::Error>(std::io::Error::other("disk gone"))
/// });
/// # }
/// ```

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Destination for errors that are reported rather than propagated
pub trait ErrorReporter: Send + Sync + 'static {
    /// Records `error` that happened while doing `context`
    fn report(&self, error: &anyhow::Error, context: &str);
}

/// Shared reporter handle
pub type SharedReporter = Arc<dyn ErrorReporter>;

/// Reporter that writes to the tracing pipeline at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &anyhow::Error, context: &str) {
        tracing::error!(context, error = %format!("{:#}", error), "Reported error");
    }
}

/// Returns the reporter used when none is configured
pub fn default_reporter() -> SharedReporter {
    Arc::new(TracingReporter)
}

/// Spawner for best-effort futures
pub struct BackgroundTask;

impl BackgroundTask {
    /// Runs `future` on the runtime; an `Err` goes to `reporter`
    pub fn spawn<F, E>(reporter: SharedReporter, context: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = future.await {
                reporter.report(&e.into(), context);
            }
        })
    }
}
