//! The handle every task body receives.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::runtime::Dispatcher;
use crate::task::harness::{self, Spawned};
use crate::task::{Deferred, Id, Job, StartMode, Suspend, TaskNode, TaskOpts, YieldNow};
use crate::time::{Delay, timeout};

/// The execution context of a running task.
///
/// A `Scope` names the task it was given to: children launched through it are
/// owned by that task, and its suspension points observe that task's
/// cancellation. It is cheap to clone and can be moved into nested futures.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use spindle::Scope;
///
/// #[spindle::main]
/// async fn main(scope: Scope) -> spindle::Result<()> {
///     let job = scope.launch(|scope| async move {
///         scope.delay(Duration::from_secs(1)).await?;
///         println!("World!");
///         Ok(())
///     })?;
///
///     println!("Hello,");
///     job.join(&scope).await
/// }
/// ```
#[derive(Clone)]
pub struct Scope {
    node: Arc<TaskNode>,

    // Produced by `non_cancellable`: suspension points ignore cancellation.
    shielded: bool,
}

impl Scope {
    pub(crate) fn new(node: Arc<TaskNode>) -> Self {
        Self {
            node,
            shielded: false,
        }
    }

    pub(crate) fn node(&self) -> &Arc<TaskNode> {
        &self.node
    }

    pub fn id(&self) -> Id {
        self.node.id
    }

    /// A handle to the task owning this scope.
    pub fn job(&self) -> Job {
        Job::new(Arc::clone(&self.node))
    }

    /// The dispatcher this task runs on, inherited by the children it launches.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.node.dispatcher
    }

    /// False once cancellation of this task was requested. Always true inside
    /// [`Scope::non_cancellable`].
    pub fn is_active(&self) -> bool {
        self.shielded || self.node.is_active()
    }

    /// Explicit cancellation check point.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    /// Launches a child task on this task's dispatcher.
    ///
    /// Fails with [`Error::ScopeClosed`] if this task already joined its
    /// children, and with [`Error::DispatcherClosed`] if the dispatcher was
    /// shut down.
    pub fn launch<F, Fut>(&self, body: F) -> Result<Job>
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.builder().launch(body)
    }

    /// Launches a child task on another dispatcher.
    pub fn launch_on<F, Fut>(&self, dispatcher: &Dispatcher, body: F) -> Result<Job>
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.builder().on(dispatcher).launch(body)
    }

    /// Launches a child task producing a value, see [`Deferred::await_on`].
    pub fn deferred<T, F, Fut>(&self, body: F) -> Result<Deferred<T>>
    where
        T: Send + 'static,
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.builder().deferred(body)
    }

    /// Configures the next child before launching it.
    pub fn builder(&self) -> LaunchBuilder<'_> {
        LaunchBuilder {
            scope: self,
            dispatcher: None,
            opts: TaskOpts::default(),
            mode: StartMode::default(),
        }
    }

    /// Suspends the task for at least `duration` without holding a worker.
    ///
    /// Fails fast with [`Error::Cancelled`] if the task is cancelled on entry
    /// or while waiting. Cancellation wakes the task early.
    pub async fn delay(&self, duration: Duration) -> Result<()> {
        self.suspend(Delay::new(duration)).await
    }

    /// Reschedules the task behind other ready work. A cancellation check
    /// point.
    pub async fn yield_now(&self) -> Result<()> {
        self.suspend(YieldNow::default()).await
    }

    /// Runs `body` in a child scope, cancelling it if it is still running
    /// after `duration`. The body runs inline, in this task's continuation.
    ///
    /// Returns the body's outcome, or [`Error::Timeout`] if the deadline
    /// elapsed first. In that case the body and its children are cancelled and
    /// driven to completion before this returns. A failure of the body is
    /// returned here rather than failing this task.
    pub async fn with_timeout<T, F, Fut>(&self, duration: Duration, body: F) -> Result<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        timeout::with_timeout(self, duration, body).await
    }

    /// Runs `body` with a scope whose suspension points ignore cancellation.
    /// Meant for cleanup code that has to suspend after the task was
    /// cancelled.
    ///
    /// Children launched and timeouts started through the shielded scope do
    /// not inherit the cancellation of this task.
    pub async fn non_cancellable<T, F, Fut>(&self, body: F) -> T
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = T>,
    {
        let shielded = Scope {
            node: Arc::clone(&self.node),
            shielded: true,
        };

        body(shielded).await
    }

    pub(crate) fn is_shielded(&self) -> bool {
        self.shielded
    }

    pub(crate) fn suspend<F: Future>(&self, inner: F) -> Suspend<F> {
        Suspend::new(Arc::clone(&self.node), self.shielded, inner)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("task", &self.node)
            .field("shielded", &self.shielded)
            .finish()
    }
}

/// Configures a child task before launching it.
///
/// ```no_run
/// # use spindle::{Scope, StartMode, TaskOpts};
/// # async fn doc(scope: Scope) -> spindle::Result<()> {
/// let lazy = scope
///     .builder()
///     .with_opts(TaskOpts::JOIN_CHILDREN_ON_EXIT)
///     .start(StartMode::Lazy)
///     .deferred(|_| async { Ok(42) })?;
///
/// assert_eq!(lazy.await_on(&scope).await?, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
#[must_use = "a LaunchBuilder does nothing until `launch` or `deferred` is called"]
pub struct LaunchBuilder<'a> {
    scope: &'a Scope,
    dispatcher: Option<Dispatcher>,
    opts: TaskOpts,
    mode: StartMode,
}

impl LaunchBuilder<'_> {
    pub fn with_opts(mut self, opts: TaskOpts) -> Self {
        self.opts = opts;
        self
    }

    /// Runs the child on `dispatcher` instead of the parent's.
    pub fn on(mut self, dispatcher: &Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher.clone());
        self
    }

    pub fn start(mut self, mode: StartMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn launch<F, Fut>(self, body: F) -> Result<Job>
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let Spawned { node, .. } = self.spawn(body)?;
        Ok(Job::new(node))
    }

    pub fn deferred<T, F, Fut>(self, body: F) -> Result<Deferred<T>>
    where
        T: Send + 'static,
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let Spawned { node, output } = self.spawn(body)?;
        Ok(Deferred::new(Job::new(node), output))
    }

    fn spawn<T, F, Fut>(self, body: F) -> Result<Spawned<T>>
    where
        T: Send + 'static,
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| self.scope.dispatcher().clone());

        harness::spawn(Some(self.scope), dispatcher, self.opts, self.mode, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as spindle;
    use crate::State;
    use crate::test_utils::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Scope: Send, Sync, Clone);

    #[spindle::test(pool_size = 2)]
    async fn test_launch_after_children_joined_fails(scope: Scope) -> Result<()> {
        let leaked = Recorder::default();

        let child = {
            let leaked = leaked.clone();
            scope.launch(move |scope| async move {
                leaked.record(scope);
                Ok(())
            })?
        };
        child.join(&scope).await?;

        let child_scope = leaked.events().pop().expect("child recorded its scope");
        let res = child_scope.launch(|_| async { Ok(()) });

        assert_eq!(res.unwrap_err(), Error::ScopeClosed(child.id()));
        Ok(())
    }

    #[spindle::test(pool_size = 2)]
    async fn test_launch_from_cancelled_scope_creates_cancelled_child(scope: Scope) -> Result<()> {
        let ran = Recorder::default();

        let parent = {
            let ran = ran.clone();
            scope.deferred(move |scope| async move {
                scope.job().cancel();

                let child = scope.launch(move |_| async move {
                    ran.record("child ran");
                    Ok(())
                })?;
                Ok(child)
            })?
        };

        parent.join(&scope).await?;
        assert_eq!(parent.state(), State::Cancelled);
        assert!(ran.events().is_empty());
        Ok(())
    }

    #[spindle::test(pool_size = 2)]
    async fn test_first_failure_wins(scope: Scope) -> Result<()> {
        let res = scope
            .with_timeout(Duration::from_secs(5), |scope| async move {
                scope.launch(|scope| async move {
                    scope
                        .non_cancellable(|scope| async move {
                            scope.delay(Duration::from_millis(20)).await
                        })
                        .await?;
                    Err(Error::failure(anyhow::anyhow!("second")))
                })?;
                scope.launch(|_| async { Err(Error::failure(anyhow::anyhow!("first"))) })?;

                scope.delay(Duration::from_secs(10)).await
            })
            .await;

        let err = res.unwrap_err();
        assert!(err.to_string().contains("first"), "{err}");
        Ok(())
    }

    #[spindle::test(pool_size = 2)]
    async fn test_failure_cancels_siblings(scope: Scope) -> Result<()> {
        let events = Recorder::default();

        let res = scope
            .with_timeout(Duration::from_secs(5), {
                let events = events.clone();
                move |scope| async move {
                    let sibling = scope.launch(|scope| async move {
                        scope.delay(Duration::from_secs(10)).await
                    })?;
                    events.record(sibling.clone());

                    scope.launch(|scope| async move {
                        scope.delay(Duration::from_millis(10)).await?;
                        Err(Error::failure(anyhow::anyhow!("boom")))
                    })?;

                    sibling.join(&scope).await
                }
            })
            .await;

        assert!(res.unwrap_err().is_failure());
        assert!(events.events().iter().all(|job| job.state() == State::Cancelled));
        Ok(())
    }

    #[spindle::test(pool_size = 2)]
    async fn test_cancelling_child_does_not_cancel_parent(scope: Scope) -> Result<()> {
        let child = scope.launch(|scope| async move {
            scope.delay(Duration::from_secs(10)).await
        })?;

        child.cancel_and_join(&scope).await?;

        assert!(scope.is_active());
        assert!(scope.job().is_active());
        assert_eq!(child.state(), State::Cancelled);
        Ok(())
    }

    #[spindle::test(pool_size = 2)]
    async fn test_non_cancellable_covers_timeouts_and_children(scope: Scope) -> Result<()> {
        let events = Recorder::default();

        let task = {
            let events = events.clone();
            scope.launch(move |scope| async move {
                let res = scope.delay(Duration::from_secs(10)).await;
                events.record(res.map(|()| "slept"));

                scope
                    .non_cancellable(|scope| async move {
                        let bounded = scope
                            .with_timeout(Duration::from_secs(1), |scope| async move {
                                scope.delay(Duration::from_millis(10)).await?;
                                Ok("cleanup done")
                            })
                            .await;
                        events.record(bounded);

                        let helper = scope.deferred(|scope| async move {
                            scope.delay(Duration::from_millis(10)).await?;
                            Ok("helper done")
                        })?;
                        events.record(helper.await_on(&scope).await);
                        Ok(())
                    })
                    .await
            })?
        };

        scope.delay(Duration::from_millis(20)).await?;
        task.cancel_and_join(&scope).await?;

        assert_eq!(
            events.events(),
            vec![Err(Error::Cancelled), Ok("cleanup done"), Ok("helper done")]
        );
        assert_eq!(task.state(), State::Cancelled);
        Ok(())
    }

    #[spindle::test(pool_size = 2)]
    async fn test_children_inherit_dispatcher(scope: Scope) -> Result<()> {
        let parent_dispatcher = scope.dispatcher().name().to_string();

        let name = scope
            .deferred(|scope| async move { Ok(scope.dispatcher().name().to_string()) })?
            .await_on(&scope)
            .await?;

        assert_eq!(name, parent_dispatcher);
        Ok(())
    }
}
