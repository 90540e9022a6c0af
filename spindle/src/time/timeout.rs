use futures::future::{self, Either};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::task::harness::{catch_body, complete};
use crate::task::{Runnable, TaskNode, TaskOptsInternal};
use crate::time::Delay;
use crate::utils::ScopeGuard;

/// Runs `body` as a child scope of `scope`, inline in the caller's
/// continuation, racing it against a delay of `duration`.
pub(crate) async fn with_timeout<T, F, Fut>(scope: &Scope, duration: Duration, body: F) -> Result<T>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    scope.ensure_active()?;

    let node = TaskNode::new_child(
        scope.node(),
        TaskOptsInternal::SCOPED.into(),
        scope.dispatcher().clone(),
        scope.is_shielded(),
    )?;
    node.activate();

    // The caller may drop us mid-way (its own body panicked). The node still has
    // to terminate, or its parent would wait on it forever.
    let mut guard = ScopeGuard::new(|| abandon(&node));

    let mut body = pin!(catch_body(Scope::new(Arc::clone(&node)), body));

    let outcome = match future::select(body.as_mut(), Delay::new(duration)).await {
        Either::Left((outcome, _)) => outcome,
        Either::Right(((), body)) => {
            tracing::debug!(task.id = %node.id, ?duration, "timed out, cancelling scope");
            node.cancel();

            // Cooperative: the body observes the flag at its next check point.
            let _ = body.await;
            Err(Error::Timeout(duration))
        }
    };

    let outcome = complete(&node, outcome).await;
    node.finish(outcome.as_ref().err());
    guard.disarm();

    outcome
}

fn abandon(node: &Arc<TaskNode>) {
    if node.state().is_terminal() {
        return;
    }

    node.cancel();

    let driver = {
        let node = Arc::clone(node);
        async move {
            let outcome = complete(&node, Err::<(), _>(Error::Cancelled)).await;
            node.finish(outcome.err().as_ref());
        }
    };

    Runnable::new(Arc::clone(node), Box::pin(driver)).schedule();
}
