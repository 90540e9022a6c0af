use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::task::Runnable;
use crate::utils::ScopeGuard;

// Runnables resumed while this thread is already draining. The outermost call
// drains them, so a chain of inline resumptions never grows the stack.
thread_local! {
    static DRAIN_QUEUE: RefCell<Option<VecDeque<Arc<Runnable>>>> = const { RefCell::new(None) };
}

/// Runs the runnable on the current thread.
pub(crate) fn dispatch(runnable: Arc<Runnable>) {
    let runnable = DRAIN_QUEUE.with_borrow_mut(|queue| match queue {
        Some(queue) => {
            queue.push_back(runnable);
            None
        }
        None => {
            *queue = Some(VecDeque::new());
            Some(runnable)
        }
    });

    // Nested call, the outermost `dispatch` on this thread will run it.
    let Some(runnable) = runnable else {
        return;
    };

    let _guard = ScopeGuard::new(|| DRAIN_QUEUE.with_borrow_mut(|queue| *queue = None));

    runnable.run();

    while let Some(next) =
        DRAIN_QUEUE.with_borrow_mut(|queue| queue.as_mut().and_then(VecDeque::pop_front))
    {
        next.run();
    }
}
