use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::task::Job;
use crate::task::harness::TaskOutput;

/// A [`Job`] that produces a value.
///
/// Derefs to its [`Job`], so it can be cancelled, joined and inspected the
/// same way.
pub struct Deferred<T> {
    job: Job,
    output: Arc<TaskOutput<T>>,
}

impl<T> Deferred<T> {
    pub(crate) fn new(job: Job, output: Arc<TaskOutput<T>>) -> Self {
        Self { job, output }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }
}

impl<T: Clone> Deferred<T> {
    /// Suspends until the task is terminal, then returns its outcome: the
    /// value, the failure that ended it, or [`Error::Cancelled`].
    ///
    /// Starts the task if it was launched lazily. If the caller is cancelled
    /// while waiting, returns [`Error::Cancelled`] without waiting further.
    pub async fn await_on(&self, scope: &Scope) -> Result<T> {
        self.job.join(scope).await?;
        self.outcome()
    }

    /// Blocking version of [`Deferred::await_on`], for callers outside of any
    /// task.
    pub fn await_blocking(&self) -> Result<T> {
        self.job.join_blocking();
        self.outcome()
    }

    /// The outcome if the task is already terminal.
    pub fn try_result(&self) -> Option<Result<T>> {
        self.job.is_completed().then(|| self.outcome())
    }

    fn outcome(&self) -> Result<T> {
        self.output.get().unwrap_or(Err(Error::Cancelled))
    }
}

impl<T> Deref for Deferred<T> {
    type Target = Job;

    fn deref(&self) -> &Self::Target {
        &self.job
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            job: self.job.clone(),
            output: Arc::clone(&self.output),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("job", &self.job)
            .field("output", &self.output)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as spindle;
    use crate::StartMode;
    use crate::test_utils::*;
    use static_assertions::assert_impl_all;
    use std::time::{Duration, Instant};

    assert_impl_all!(Deferred<u32>: Send, Sync, Clone);

    async fn do_something_useful_one(scope: Scope) -> Result<u32> {
        scope.delay(Duration::from_millis(200)).await?;
        Ok(13)
    }

    async fn do_something_useful_two(scope: Scope) -> Result<u32> {
        scope.delay(Duration::from_millis(200)).await?;
        Ok(29)
    }

    #[spindle::test(pool_size = 2)]
    async fn test_sequential_by_default(scope: Scope) -> Result<()> {
        let start = Instant::now();

        let one = do_something_useful_one(scope.clone()).await?;
        let two = do_something_useful_two(scope.clone()).await?;

        assert_eq!(one + two, 42);
        assert_elapsed_between(start, Duration::from_millis(400), Duration::from_millis(1_000));
        Ok(())
    }

    #[spindle::test(pool_size = 2)]
    async fn test_concurrent_deferreds(scope: Scope) -> Result<()> {
        let start = Instant::now();

        let one = scope.deferred(do_something_useful_one)?;
        let two = scope.deferred(do_something_useful_two)?;

        let sum = one.await_on(&scope).await? + two.await_on(&scope).await?;

        assert_eq!(sum, 42);
        assert_elapsed_between(start, Duration::from_millis(200), Duration::from_millis(390));
        Ok(())
    }

    #[spindle::test(pool_size = 2)]
    async fn test_lazy_deferred_runs_at_most_once(scope: Scope) -> Result<()> {
        let runs = Recorder::default();

        let lazy = {
            let runs = runs.clone();
            scope
                .builder()
                .start(StartMode::Lazy)
                .deferred(move |scope| async move {
                    runs.record(());
                    do_something_useful_one(scope).await
                })?
        };

        scope.delay(Duration::from_millis(50)).await?;
        assert!(runs.events().is_empty());
        assert!(lazy.try_result().is_none());

        // Awaiting twice starts the body once.
        assert_eq!(lazy.await_on(&scope).await?, 13);
        assert_eq!(lazy.await_on(&scope).await?, 13);
        assert!(!lazy.start());
        assert_eq!(runs.events().len(), 1);
        Ok(())
    }

    #[spindle::test(pool_size = 2)]
    async fn test_failed_deferred_reports_failure(scope: Scope) -> Result<()> {
        let res = scope
            .with_timeout(Duration::from_secs(5), |scope| async move {
                let failing = scope.deferred(|_| async {
                    Err::<u32, _>(Error::failure(anyhow::anyhow!("no answer")))
                })?;

                // The failure also cancels us, so the await may observe either.
                let awaited = failing.await_on(&scope).await;
                assert!(matches!(&awaited, Err(e) if e.is_failure() || e.is_cancelled()));

                if let Some(outcome) = failing.try_result() {
                    assert!(outcome.unwrap_err().is_failure());
                }
                Ok(())
            })
            .await;

        assert!(res.unwrap_err().to_string().contains("no answer"));
        Ok(())
    }

    #[test]
    fn test_await_blocking() -> anyhow::Result<()> {
        let dispatcher = crate::runtime::Builder::new_pooled().pool_size(1).try_build()?;

        let deferred = dispatcher.run_blocking(|scope| async move {
            let deferred = scope.deferred(|_| async { Ok("done") })?;
            deferred.join(&scope).await?;
            Ok(deferred)
        })?;

        assert_eq!(deferred.await_blocking()?, "done");
        assert_eq!(deferred.try_result(), Some(Ok("done")));

        dispatcher.shutdown();
        Ok(())
    }
}
