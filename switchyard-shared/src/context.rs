/// Execution context propagation
///
/// An `ExecutionContext` names the causal origin of a piece of work: the HTTP
/// request, scheduled trigger, or queue job that led to it. Contexts form a
/// parent-pointer chain so a job can be traced back to whatever enqueued it.
///
/// The current context is scoped to a task with `tokio::task_local!`: code
/// inside `with_context(ctx, fut)` sees `ctx` from `current_context()`, code
/// outside sees `None`. Nothing is stored globally.
///
/// # Chain flattening
///
/// When a job enqueues another job, the worker does not grow the chain without
/// bound. It walks up to the first frame that is not a job (`root_origin`) and
/// hangs the new job frame directly under it:
///
/// ```text
/// request ─┐
///          └─ job A ──enqueue──> job B   becomes   request ─┬─ job A
///                                                           └─ job B
/// ```
///
/// # Example
///
/// ```
/// use switchyard_shared::context::{current_context, with_context, ExecutionContext};
///
/// # async fn example() {
/// let ctx = ExecutionContext::request(Some("10.0.0.1".into()), None);
/// let seen = with_context(ctx.clone(), async { current_context() }).await;
/// assert_eq!(seen, Some(ctx));
/// assert_eq!(current_context(), None);
/// # }
/// ```

use serde::{Deserialize, Serialize};
use std::future::Future;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: ExecutionContext;
}

/// What kind of work a context frame describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextKind {
    /// An inbound request
    Request {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
    },

    /// A queue job attempt
    Job { queue: String },

    /// A timer or cron trigger
    Scheduled { schedule: String },

    /// Origin unknown
    Unknown,
}

/// One frame of causal metadata, optionally pointing at its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Identity of the work this frame stands for
    pub context_id: String,

    /// Frame kind
    pub kind: ContextKind,

    /// The frame that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<ExecutionContext>>,
}

impl ExecutionContext {
    /// Creates a root frame with a fresh id
    pub fn new(kind: ContextKind) -> Self {
        Self {
            context_id: Uuid::new_v4().to_string(),
            kind,
            parent: None,
        }
    }

    /// Creates a request frame
    pub fn request(ip: Option<String>, user_agent: Option<String>) -> Self {
        Self::new(ContextKind::Request { ip, user_agent })
    }

    /// Creates a scheduled-trigger frame
    pub fn scheduled(schedule: impl Into<String>) -> Self {
        Self::new(ContextKind::Scheduled {
            schedule: schedule.into(),
        })
    }

    /// Creates the frame a worker runs a job under
    ///
    /// `captured` is the context stored with the job at enqueue time. It is
    /// collapsed to its root origin first so job chains stay flat.
    pub fn job(job_id: impl Into<String>, queue: impl Into<String>, captured: Option<&ExecutionContext>) -> Self {
        Self {
            context_id: job_id.into(),
            kind: ContextKind::Job {
                queue: queue.into(),
            },
            parent: captured.map(|ctx| Box::new(ctx.root_origin().clone())),
        }
    }

    /// Attaches `parent` above this frame
    pub fn with_parent(mut self, parent: ExecutionContext) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Whether this frame is a job frame
    pub fn is_job(&self) -> bool {
        matches!(self.kind, ContextKind::Job { .. })
    }

    /// Walks job frames upward to the first non-job frame
    ///
    /// A job frame without a parent is its own origin.
    pub fn root_origin(&self) -> &ExecutionContext {
        let mut current = self;
        while current.is_job() {
            match current.parent.as_deref() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Iterates from this frame up to the outermost ancestor
    pub fn lineage(&self) -> impl Iterator<Item = &ExecutionContext> {
        std::iter::successors(Some(self), |ctx| ctx.parent.as_deref())
    }
}

/// Returns the context of the running task, if one was established
pub fn current_context() -> Option<ExecutionContext> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
}

/// Runs `future` with `context` as the current context
pub async fn with_context<F>(context: ExecutionContext, future: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(context, future).await
}
