//! Task handlers and the per-attempt execution context.
//!
//! A task registers a [`WorkerHandler`]: one main handler plus any number of
//! ordered post-handlers. Each handler receives a cloned [`JobContext`] giving
//! it the job metadata, a cancellation token, and channels for reporting
//! results and progress without touching storage directly.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineResult, JobError};
use crate::types::{Job, JobId};

/// Boxed async handler invoked for each execution attempt
pub type HandlerFn =
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

/// Handler chain for one registered task.
///
/// Handlers run in registration order; the first error short-circuits the
/// chain and determines the retry decision for the whole attempt.
#[derive(Clone)]
pub struct WorkerHandler {
    handlers: Vec<HandlerFn>,
}

impl WorkerHandler {
    /// Create a chain from the main handler
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Self {
            handlers: vec![box_handler(handler)],
        }
    }

    /// Append a post-handler, run after the previous ones succeed
    pub fn then<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.handlers.push(box_handler(handler));
        self
    }

    /// Number of handlers in the chain
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the whole chain for one attempt
    pub(crate) async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        for handler in &self.handlers {
            (handler)(ctx.clone()).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for WorkerHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandler")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

fn box_handler<F, Fut>(handler: F) -> HandlerFn
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(handler(ctx)))
}

/// Progress report emitted by a running handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current: u64,
    pub max: u64,
}

/// Per-attempt execution context handed to every handler in the chain.
///
/// Cheap to clone; all clones share the same result cell and progress
/// channel.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    job_id: JobId,
    task_name: String,
    retries: u32,
    max_retry: u32,
    arguments: String,
    trace_id: String,
    cancellation: CancellationToken,
    result: Mutex<Option<String>>,
    progress_tx: Option<mpsc::UnboundedSender<Progress>>,
}

impl JobContext {
    pub(crate) fn new(
        job: &Job,
        trace_id: String,
        cancellation: CancellationToken,
        progress_tx: Option<mpsc::UnboundedSender<Progress>>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                job_id: job.id.clone(),
                task_name: job.task_name.clone(),
                retries: job.retries,
                max_retry: job.max_retry,
                arguments: job.arguments.clone(),
                trace_id,
                cancellation,
                result: Mutex::new(None),
                progress_tx,
            }),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.inner.job_id
    }

    pub fn task_name(&self) -> &str {
        &self.inner.task_name
    }

    /// Attempt number, counting from 1
    pub fn retries(&self) -> u32 {
        self.inner.retries
    }

    pub fn max_retry(&self) -> u32 {
        self.inner.max_retry
    }

    /// Whether this is the final attempt before the job fails for good
    pub fn is_last_retry(&self) -> bool {
        self.inner.retries >= self.inner.max_retry
    }

    /// Raw argument payload
    pub fn arguments(&self) -> &str {
        &self.inner.arguments
    }

    /// Typed view over the argument payload
    pub fn parse_arguments<T: serde::de::DeserializeOwned>(&self) -> EngineResult<T> {
        Ok(serde_json::from_str(&self.inner.arguments)?)
    }

    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    /// Token cancelled by `stop_job` and by engine shutdown.
    /// Long-running handlers should check it at convenient points.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Record a result string persisted with the job on success
    pub fn set_result(&self, result: impl Into<String>) {
        *self.inner.result.lock() = Some(result.into());
    }

    pub(crate) fn take_result(&self) -> Option<String> {
        self.inner.result.lock().take()
    }

    /// Report live progress; delivery is best-effort and never blocks
    pub fn report_progress(&self, current: u64, max: u64) {
        if let Some(tx) = &self.inner.progress_tx {
            let _ = tx.send(Progress { current, max });
        }
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.inner.job_id)
            .field("task_name", &self.inner.task_name)
            .field("retries", &self.inner.retries)
            .field("max_retry", &self.inner.max_retry)
            .field("trace_id", &self.inner.trace_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Job;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_ctx(progress_tx: Option<mpsc::UnboundedSender<Progress>>) -> JobContext {
        let mut job = Job::new("notify", r#"{"user":"bob"}"#, 3, Duration::from_secs(1));
        job.retries = 1;
        JobContext::new(&job, "trace-1".into(), CancellationToken::new(), progress_tx)
    }

    #[tokio::test]
    async fn chain_runs_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (order.clone(), order.clone(), order.clone());

        let handler = WorkerHandler::new(move |_ctx| {
            let a = a.clone();
            async move {
                a.lock().push("main");
                Ok(())
            }
        })
        .then(move |_ctx| {
            let b = b.clone();
            async move {
                b.lock().push("post-1");
                Ok(())
            }
        })
        .then(move |_ctx| {
            let c = c.clone();
            async move {
                c.lock().push("post-2");
                Ok(())
            }
        });

        assert_eq!(handler.len(), 3);
        handler.run(test_ctx(None)).await.unwrap();
        assert_eq!(*order.lock(), vec!["main", "post-1", "post-2"]);
    }

    #[tokio::test]
    async fn first_error_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let later = calls.clone();

        let handler = WorkerHandler::new(|_ctx| async {
            Err(JobError::retryable("boom"))
        })
        .then(move |_ctx| {
            let later = later.clone();
            async move {
                later.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let err = handler.run(test_ctx(None)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn result_cell_is_shared_across_clones() {
        let ctx = test_ctx(None);
        let clone = ctx.clone();
        clone.set_result("42 rows");
        assert_eq!(ctx.take_result().as_deref(), Some("42 rows"));
        assert!(ctx.take_result().is_none());
    }

    #[tokio::test]
    async fn progress_reports_are_delivered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = test_ctx(Some(tx));
        ctx.report_progress(1, 10);
        ctx.report_progress(5, 10);
        assert_eq!(rx.recv().await, Some(Progress { current: 1, max: 10 }));
        assert_eq!(rx.recv().await, Some(Progress { current: 5, max: 10 }));
    }

    #[tokio::test]
    async fn context_metadata_accessors() {
        let ctx = test_ctx(None);
        assert_eq!(ctx.task_name(), "notify");
        assert_eq!(ctx.retries(), 1);
        assert_eq!(ctx.max_retry(), 3);
        assert!(!ctx.is_last_retry());
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.trace_id(), "trace-1");

        #[derive(serde::Deserialize)]
        struct Args {
            user: String,
        }
        let args: Args = ctx.parse_arguments().unwrap();
        assert_eq!(args.user, "bob");
    }
}
