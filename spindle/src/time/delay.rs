use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::time::timer::{self, TimerSlot};

/// Resolves once `deadline` passed. Registers with the timer thread on first
/// pending poll, so a delay that is never polled costs nothing.
#[derive(Debug)]
pub(crate) struct Delay {
    deadline: Instant,

    slot: Option<Arc<TimerSlot>>,
}

impl Delay {
    pub(crate) fn new(duration: Duration) -> Self {
        Self::until(Instant::now() + duration)
    }

    pub(crate) fn until(deadline: Instant) -> Self {
        Self {
            deadline,
            slot: None,
        }
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.deadline {
            return Poll::Ready(());
        }

        let deadline = self.deadline;
        let slot = self.slot.get_or_insert_with(|| timer::register(deadline));

        if slot.set_waker(cx.waker()) {
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            timer::cancel(&slot);
        }
    }
}
