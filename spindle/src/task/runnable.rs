use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, Wake, Waker};

use crate::runtime::unconfined;
use crate::task::TaskNode;

// Scheduling bits. A runnable is in at most one dispatcher queue at a time and
// is polled by at most one thread at a time.
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 1 << 1;
const NOTIFIED: u8 = 1 << 2;
const COMPLETE: u8 = 1 << 3;

/// The schedulable unit: a task's driver future plus the bits that make sure it
/// runs on exactly one worker at a time. The runnable is its own waker.
pub(crate) struct Runnable {
    pub(crate) node: Arc<TaskNode>,

    future: Mutex<Option<BoxFuture<'static, ()>>>,

    state: AtomicU8,
}

impl Runnable {
    pub(crate) fn new(node: Arc<TaskNode>, future: BoxFuture<'static, ()>) -> Arc<Self> {
        Arc::new(Self {
            node,
            future: Mutex::new(Some(future)),
            state: AtomicU8::new(0),
        })
    }

    /// Hands the runnable to its dispatcher, unless it is already queued or
    /// complete. If it is being polled right now, it is re-queued once the
    /// current poll returns.
    pub(crate) fn schedule(self: &Arc<Self>) {
        let prev = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                if s & (COMPLETE | SCHEDULED | NOTIFIED) != 0 {
                    None
                } else if s & RUNNING != 0 {
                    Some(s | NOTIFIED)
                } else {
                    Some(s | SCHEDULED)
                }
            });

        if let Ok(prev) = prev
            && prev & RUNNING == 0
        {
            self.submit();
        }
    }

    fn submit(self: &Arc<Self>) {
        let Err(runnable) = self.node.dispatcher.submit(Arc::clone(self)) else {
            return;
        };

        // The dispatcher is gone: cancel the task and drive it inline so that
        // whoever waits on it is released.
        tracing::warn!(
            task.id = %self.node.id,
            dispatcher = self.node.dispatcher.name(),
            "dispatcher closed, cancelling task and completing it inline"
        );
        runnable.node.cancel();
        unconfined::dispatch(runnable);
    }

    /// Polls the driver future once. Called by dispatchers only.
    pub(crate) fn run(self: Arc<Self>) {
        let prev = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            (s & COMPLETE == 0).then_some((s & !SCHEDULED) | RUNNING)
        });

        if prev.is_err() {
            return;
        }

        let waker = Waker::from(Arc::clone(&self));
        let mut cx = Context::from_waker(&waker);

        let poll = {
            let mut future = self.future.lock();
            match future.as_mut() {
                Some(fut) => {
                    let poll = fut.as_mut().poll(&mut cx);
                    if poll.is_ready() {
                        future.take();
                    }
                    poll
                }
                None => Poll::Ready(()),
            }
        };

        if poll.is_ready() {
            self.state.store(COMPLETE, Ordering::Release);
            return;
        }

        let prev = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            if s & NOTIFIED != 0 {
                Some((s & !(RUNNING | NOTIFIED)) | SCHEDULED)
            } else {
                Some(s & !RUNNING)
            }
        });

        // Woken while being polled: go to the back of the queue.
        if let Ok(prev) = prev
            && prev & NOTIFIED != 0
        {
            self.submit();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) & COMPLETE != 0
    }
}

impl Wake for Runnable {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runnable")
            .field("task", &self.node.id)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Dispatcher;
    use crate::task::TaskOpts;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;

    assert_impl_all!(Runnable: Send, Sync);

    #[test]
    fn test_wake_while_running_requeues_once() {
        let node = TaskNode::new_root(TaskOpts::default(), Dispatcher::unconfined()).unwrap();
        let polls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&polls);
        let fut = futures::future::poll_fn(move |cx| {
            // Wake ourselves twice on the first two polls, complete on the third.
            if counter.fetch_add(1, Ordering::Relaxed) < 2 {
                cx.waker().wake_by_ref();
                cx.waker().wake_by_ref();
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        });

        let runnable = Runnable::new(node, Box::pin(fut));
        runnable.schedule();

        assert!(runnable.is_complete());
        assert_eq!(polls.load(Ordering::Relaxed), 3);

        // Waking a complete runnable does nothing.
        Waker::from(Arc::clone(&runnable)).wake();
        assert_eq!(polls.load(Ordering::Relaxed), 3);
    }
}
