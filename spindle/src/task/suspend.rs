use pin_project::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::{Error, Result};
use crate::task::TaskNode;

/// A cooperative suspension point.
///
/// Fails fast with [`Error::Cancelled`] if the task is cancelled on entry or
/// when it resumes. While pending, cancellation wakes the task so it observes
/// the flag promptly. A shielded suspension point ignores cancellation.
#[pin_project]
pub(crate) struct Suspend<F> {
    node: Arc<TaskNode>,

    shielded: bool,

    #[pin]
    inner: F,
}

impl<F> Suspend<F> {
    pub(crate) fn new(node: Arc<TaskNode>, shielded: bool, inner: F) -> Self {
        Self {
            node,
            shielded,
            inner,
        }
    }
}

impl<F: Future> Future for Suspend<F> {
    type Output = Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if *this.shielded {
            return this.inner.poll(cx).map(Ok);
        }

        if this.node.is_cancelled() {
            return Poll::Ready(Err(Error::Cancelled));
        }

        match this.inner.poll(cx) {
            Poll::Ready(out) => Poll::Ready(Ok(out)),
            Poll::Pending => {
                this.node.register_cancel_waker(cx.waker());

                // Cancelled between the check and the registration.
                if this.node.is_cancelled() {
                    return Poll::Ready(Err(Error::Cancelled));
                }

                Poll::Pending
            }
        }
    }
}

/// Yields once back to the dispatcher: the task goes behind other ready work.
#[derive(Debug, Default)]
pub(crate) struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Only yield on first poll. Next time the task is scheduled we return.
        if self.yielded {
            return Poll::Ready(());
        }

        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
