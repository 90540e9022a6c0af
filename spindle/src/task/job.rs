use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::scope::Scope;
use crate::task::{Id, Join, State, TaskNode};

/// A handle to a launched task.
///
/// Dropping a `Job` does not detach or cancel the task: it stays owned by its
/// parent, which joins it before completing.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
///
/// # fn doc(dispatcher: spindle::Dispatcher) -> spindle::Result<()> {
/// spindle::run_blocking(&dispatcher, |scope| async move {
///     let job = scope.launch(|scope| async move {
///         scope.delay(Duration::from_secs(1)).await?;
///         println!("world");
///         Ok(())
///     })?;
///
///     println!("hello");
///     job.join(&scope).await
/// })
/// # }
/// ```
#[derive(Clone)]
pub struct Job {
    pub(crate) node: Arc<TaskNode>,
}

impl Job {
    pub(crate) fn new(node: Arc<TaskNode>) -> Self {
        Self { node }
    }

    pub fn id(&self) -> Id {
        self.node.id
    }

    pub fn state(&self) -> State {
        self.node.state()
    }

    /// True while the body runs (or children are being awaited after it
    /// returned successfully) and cancellation was not requested.
    pub fn is_active(&self) -> bool {
        self.node.is_active()
    }

    /// True once cancellation was requested, or if the task ended `Cancelled`
    /// (which includes tasks whose body failed).
    pub fn is_cancelled(&self) -> bool {
        self.node.is_cancelled() || self.state() == State::Cancelled
    }

    /// True once the task is terminal, whatever the reason.
    pub fn is_completed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Starts a lazily launched task. Returns true if this call started it.
    pub fn start(&self) -> bool {
        self.node.start()
    }

    /// Requests cancellation of the task and all of its descendants.
    ///
    /// Returns immediately: it does not wait for the task to observe the
    /// request. Use [`Job::join`] (or [`Job::cancel_and_join`]) for that.
    /// Cancelling a terminal task does nothing.
    pub fn cancel(&self) {
        self.node.cancel();
    }

    /// Suspends the caller until the task is terminal. Starts the task if it
    /// was launched lazily.
    ///
    /// The task's own outcome is never reported: this is a pure wait. The only
    /// error is [`Error::Cancelled`], when the *caller* is cancelled.
    ///
    /// [`Error::Cancelled`]: crate::Error::Cancelled
    pub async fn join(&self, scope: &Scope) -> Result<()> {
        self.start();
        scope.suspend(Join::new(Arc::clone(&self.node))).await
    }

    /// Blocks the current thread until the task is terminal.
    ///
    /// Meant for callers outside of any task. Calling it from a worker thread
    /// blocks that worker.
    pub fn join_blocking(&self) {
        self.start();
        futures::executor::block_on(Join::new(Arc::clone(&self.node)));
    }

    pub async fn cancel_and_join(&self, scope: &Scope) -> Result<()> {
        self.cancel();
        self.join(scope).await
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.node.id)
            .field("state", &self.node.state())
            .field("cancelled", &self.node.is_cancelled())
            .finish()
    }
}
