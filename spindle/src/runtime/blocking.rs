use crate::error::{Error, Result};
use crate::runtime::Dispatcher;
use crate::scope::Scope;
use crate::task::harness::{self, Spawned};
use crate::task::{Join, StartMode, TaskOpts};

/// Runs `body` as the root task of a structured scope on `dispatcher` and
/// blocks the calling thread until the root and every descendant is terminal.
///
/// Returns the body's value, or the first failure of any task in the tree. A
/// cancelled descendant is not an error; a root that is itself cancelled
/// yields [`Error::Cancelled`].
///
/// Meant for the outermost caller, typically `main` or a test. Calling it from
/// a thread of `dispatcher` blocks that thread, which can deadlock a small
/// pool.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
///
/// let res = spindle::run_blocking(&spindle::Dispatcher::common(), |scope| async move {
///     let answer = scope.deferred(|scope| async move {
///         scope.delay(Duration::from_millis(100)).await?;
///         Ok(42)
///     })?;
///
///     answer.await_on(&scope).await
/// });
///
/// assert_eq!(res, Ok(42));
/// ```
pub fn run_blocking<T, F, Fut>(dispatcher: &Dispatcher, body: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(Scope) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let Spawned { node, output } = harness::spawn(
        None,
        dispatcher.clone(),
        TaskOpts::default(),
        StartMode::Eager,
        body,
    )?;

    futures::executor::block_on(Join::new(node));

    output.take().unwrap_or(Err(Error::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use crate::test_utils::*;
    use rstest::rstest;
    use std::time::{Duration, Instant};

    #[rstest]
    #[case::pooled(Builder::new_pooled().pool_size(2))]
    #[case::pinned(Builder::new_pinned("blocking"))]
    #[case::unconfined(Builder::new_unconfined())]
    fn test_run_blocking_waits_for_whole_tree(#[case] builder: Builder) -> anyhow::Result<()> {
        let dispatcher = builder.try_build()?;
        let events = Recorder::default();
        let start = Instant::now();

        let res = dispatcher.run_blocking({
            let events = events.clone();
            move |scope| async move {
                let grandchild_events = events.clone();
                let child = scope
                    .builder()
                    .with_opts(TaskOpts::JOIN_CHILDREN_ON_EXIT)
                    .launch(move |scope| async move {
                        scope.launch(move |scope| async move {
                            scope.delay(Duration::from_millis(50)).await?;
                            grandchild_events.record("grandchild");
                            Ok(())
                        })?;
                        Ok(())
                    })?;

                child.join(&scope).await?;
                events.record("root");
                Ok("done")
            }
        });

        dispatcher.shutdown();

        assert_eq!(res?, "done");
        assert_elapsed_between(start, Duration::from_millis(50), Duration::from_secs(2));
        assert_eq!(events.events(), vec!["grandchild", "root"]);
        Ok(())
    }

    #[test]
    fn test_root_cancelling_itself_yields_cancelled() {
        let res: Result<u32> = run_blocking(&Dispatcher::unconfined(), |scope| async move {
            scope.job().cancel();
            scope.yield_now().await?;
            Ok(1)
        });

        assert_eq!(res, Err(Error::Cancelled));
    }

    #[test]
    fn test_cancelled_child_is_not_an_error() -> anyhow::Result<()> {
        let dispatcher = Builder::new_pooled().pool_size(2).try_build()?;

        let res = dispatcher.run_blocking(|scope| async move {
            let child = scope.launch(|scope| async move {
                scope.delay(Duration::from_secs(10)).await
            })?;

            child.cancel_and_join(&scope).await?;
            Ok(child.state())
        });
        dispatcher.shutdown();

        assert_eq!(res, Ok(crate::State::Cancelled));
        Ok(())
    }
}
