//! Drives a task from its body to a terminal state.
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::runtime::Dispatcher;
use crate::scope::Scope;
use crate::task::{Join, Runnable, StartMode, State, TaskNode, TaskOpts};

/// Where a task stores its outcome, exactly once, right before it becomes
/// terminal.
pub(crate) struct TaskOutput<T>(Mutex<Option<Result<T>>>);

impl<T> TaskOutput<T> {
    fn new() -> Self {
        Self(Mutex::new(None))
    }

    fn set(&self, outcome: Result<T>) {
        let prev = self.0.lock().replace(outcome);
        debug_assert!(prev.is_none(), "task output set twice");
    }

    pub(crate) fn get(&self) -> Option<Result<T>>
    where
        T: Clone,
    {
        self.0.lock().clone()
    }

    pub(crate) fn take(&self) -> Option<Result<T>> {
        self.0.lock().take()
    }
}

impl<T> fmt::Debug for TaskOutput<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = self.0.lock().is_some();
        f.debug_tuple("TaskOutput").field(&set).finish()
    }
}

pub(crate) struct Spawned<T> {
    pub(crate) node: Arc<TaskNode>,
    pub(crate) output: Arc<TaskOutput<T>>,
}

/// Creates a task running `body` on `dispatcher`, as a child of the task
/// owning `parent` or as a root when there is none.
pub(crate) fn spawn<T, F, Fut>(
    parent: Option<&Scope>,
    dispatcher: Dispatcher,
    opts: TaskOpts,
    mode: StartMode,
    body: F,
) -> Result<Spawned<T>>
where
    T: Send + 'static,
    F: FnOnce(Scope) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let node = match parent {
        Some(parent) => {
            TaskNode::new_child(parent.node(), opts, dispatcher, parent.is_shielded())?
        }
        None => TaskNode::new_root(opts, dispatcher)?,
    };

    let output = Arc::new(TaskOutput::new());
    let driver = drive(Arc::clone(&node), Arc::clone(&output), body);
    let runnable = Runnable::new(Arc::clone(&node), Box::pin(driver));

    tracing::debug!(
        task.id = %node.id,
        parent.id = ?parent.map(Scope::id),
        dispatcher = node.dispatcher.name(),
        ?mode,
        "task launched"
    );

    match mode {
        StartMode::Eager => {
            node.activate();
            runnable.schedule();
        }
        StartMode::Lazy => node.set_pending(runnable),
    }

    Ok(Spawned { node, output })
}

async fn drive<T, F, Fut>(node: Arc<TaskNode>, output: Arc<TaskOutput<T>>, body: F)
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    // A task cancelled before its first poll never runs its body.
    let outcome = if node.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        catch_body(Scope::new(Arc::clone(&node)), body).await
    };

    let outcome = complete(&node, outcome).await;
    let err = outcome.as_ref().err().cloned();

    output.set(outcome);
    node.finish(err.as_ref());
}

/// Runs the body, turning panics into task failures.
pub(crate) async fn catch_body<T, F, Fut>(scope: Scope, body: F) -> Result<T>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| body(scope))) {
        Ok(fut) => AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(Error::from_panic(payload))),
        Err(payload) => Err(Error::from_panic(payload)),
    }
}

/// Completion protocol: cancel (or wait for) the children, join all of them,
/// seal the task and resolve its final outcome.
pub(crate) async fn complete<T>(node: &Arc<TaskNode>, outcome: Result<T>) -> Result<T> {
    let body_ok = outcome.is_ok();
    let join_children = body_ok && node.opts.join_children_on_exit();

    node.begin_completion(body_ok);
    node.cancel_children(join_children);

    // Children may still be launched through a cloned scope while we drain, so
    // loop until the task is sealed.
    while let Some(child) = node.next_child_or_seal() {
        if !join_children || child.state() == State::New {
            child.cancel();
        }

        Join::new(Arc::clone(&child)).await;
        node.forget_child(&child.id);
    }

    resolve(node, outcome)
}

fn resolve<T>(node: &TaskNode, outcome: Result<T>) -> Result<T> {
    match outcome {
        // The body's own error wins over anything its children did.
        Err(err) if !err.is_cancelled() => Err(err),
        outcome => match node.first_failure() {
            Some(err) => Err(err),
            None if node.is_cancelled() => Err(Error::Cancelled),
            None => outcome,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as spindle;
    use crate::runtime::Builder;
    use crate::test_utils::*;
    use std::time::Duration;

    #[test]
    fn test_panic_before_first_poll_is_failure() {
        let res: Result<()> = spindle::run_blocking(&Dispatcher::unconfined(), |_scope| {
            if true {
                panic!("in closure");
            }
            async { Ok(()) }
        });

        let err = res.unwrap_err();
        assert!(err.is_failure());
        assert!(err.to_string().contains("in closure"));
    }

    #[test]
    fn test_panic_in_child_fails_root() -> anyhow::Result<()> {
        let dispatcher = Builder::new_pooled().pool_size(2).try_build()?;

        let res: Result<()> = dispatcher.run_blocking(|scope| async move {
            scope.launch(|_| async { panic!("child exploded") })?;
            scope.delay(Duration::from_secs(10)).await?;
            Ok(())
        });
        dispatcher.shutdown();

        let err = res.unwrap_err();
        assert!(err.is_failure());
        assert!(err.to_string().contains("child exploded"));
        Ok(())
    }

    #[spindle::test(pool_size = 2)]
    async fn test_body_error_wins_over_child_failure(scope: Scope) -> Result<()> {
        let res = scope
            .with_timeout(Duration::from_secs(5), |scope| async move {
                scope.launch(|_| async { Err(Error::failure(anyhow::anyhow!("child"))) })?;
                scope.delay(Duration::from_millis(50)).await.ok();
                Err::<(), _>(Error::failure(anyhow::anyhow!("body")))
            })
            .await;

        let err = res.unwrap_err();
        assert!(err.to_string().contains("body"), "{err}");
        Ok(())
    }

    #[spindle::test(pool_size = 1)]
    async fn test_children_cancelled_when_body_returns(scope: Scope) -> Result<()> {
        let events = Recorder::default();

        let parent = {
            let events = events.clone();
            scope.launch(move |scope| async move {
                let events = events.clone();
                scope.launch(move |scope| async move {
                    match scope.delay(Duration::from_secs(10)).await {
                        Err(Error::Cancelled) => events.record("child cancelled"),
                        _ => events.record("child finished"),
                    }
                    Ok(())
                })?;

                scope.yield_now().await?;
                Ok(())
            })?
        };

        let start = std::time::Instant::now();
        parent.join(&scope).await?;

        assert_eq!(events.events(), vec!["child cancelled"]);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(parent.state(), State::Completed);
        Ok(())
    }

    #[spindle::test(pool_size = 2)]
    async fn test_join_children_on_exit(scope: Scope) -> Result<()> {
        let events = Recorder::default();

        let parent = {
            let events = events.clone();
            scope
                .builder()
                .with_opts(TaskOpts::JOIN_CHILDREN_ON_EXIT)
                .launch(move |scope| async move {
                    let child_events = events.clone();
                    scope.launch(move |scope| async move {
                        scope.delay(Duration::from_millis(50)).await?;
                        child_events.record("child finished");
                        Ok(())
                    })?;

                    // A lazy child nobody starts is still cancelled on exit.
                    let lazy_events = events.clone();
                    scope
                        .builder()
                        .start(StartMode::Lazy)
                        .launch(move |_| async move {
                            lazy_events.record("lazy ran");
                            Ok(())
                        })?;

                    events.record("body returned");
                    Ok(())
                })?
        };

        parent.join(&scope).await?;

        assert_eq!(events.events(), vec!["body returned", "child finished"]);
        assert_eq!(parent.state(), State::Completed);
        Ok(())
    }
}
