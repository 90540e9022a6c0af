use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};
use crate::runtime::{Dispatcher, SPILL_TO_HEAP_THRESHOLD};
use crate::task::{Id, Runnable, State, TaskOpts};

// We implement Structured Concurrency and track the parent<->children relationship
// of tasks. Cancellation flows down the tree, failures and completion flow up.
pub(crate) struct TaskNode {
    pub(crate) id: Id,

    pub(crate) opts: TaskOpts,

    /// Where the continuations of this task run.
    pub(crate) dispatcher: Dispatcher,

    // A weak reference to the parent. This MUST be Weak to prevent reference cycles.
    parent: Option<Weak<TaskNode>>,

    // Monotonic: once set it is never cleared. Kept outside of the lock so that
    // check points are a single atomic load.
    cancel_requested: AtomicBool,

    inner: Mutex<Inner>,
}

struct Inner {
    state: State,

    // Cleared once the task has joined all of its children.
    accepting: bool,

    // Ids are monotonic, so iterating the map yields children in launch order.
    children: BTreeMap<Id, Arc<TaskNode>>,

    // First-failure-wins: later failures are drained but discarded.
    first_failure: Option<Error>,

    join_waiters: VecDeque<Waker>,

    // Wakers of the suspension points this task is parked on. Woken by `cancel`
    // so that the task observes the flag promptly.
    cancel_wakers: SmallVec<[Waker; 2]>,

    // The runnable of a lazy task that was not started yet.
    pending: Option<Arc<Runnable>>,
}

impl TaskNode {
    fn new(
        opts: TaskOpts,
        dispatcher: Dispatcher,
        parent: Option<Weak<TaskNode>>,
        cancelled: bool,
    ) -> Self {
        Self {
            id: Id::next(),
            opts,
            dispatcher,
            parent,
            cancel_requested: AtomicBool::new(cancelled),
            inner: Mutex::new(Inner {
                state: State::New,
                accepting: true,
                children: BTreeMap::new(),
                first_failure: None,
                join_waiters: VecDeque::new(),
                cancel_wakers: SmallVec::new(),
                pending: None,
            }),
        }
    }

    /// Creates a task without a parent, the root of a structured scope.
    pub(crate) fn new_root(opts: TaskOpts, dispatcher: Dispatcher) -> Result<Arc<Self>> {
        dispatcher.ensure_open()?;
        Ok(Arc::new(Self::new(opts, dispatcher, None, false)))
    }

    /// Creates a task and registers it as the last child of `parent`.
    ///
    /// A child of a cancelled parent starts out cancelled, unless it is
    /// launched from a shielded scope: cleanup code may still need helpers.
    pub(crate) fn new_child(
        parent: &Arc<TaskNode>,
        opts: TaskOpts,
        dispatcher: Dispatcher,
        shielded: bool,
    ) -> Result<Arc<Self>> {
        dispatcher.ensure_open()?;

        let mut inner = parent.inner.lock();
        if !inner.accepting {
            return Err(Error::ScopeClosed(parent.id));
        }

        let child = Arc::new(Self::new(
            opts,
            dispatcher,
            Some(Arc::downgrade(parent)),
            !shielded && parent.is_cancelled(),
        ));

        let old = inner.children.insert(child.id, Arc::clone(&child));
        debug_assert!(old.is_none());

        Ok(child)
    }

    pub(crate) fn parent(&self) -> Option<Arc<TaskNode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn state(&self) -> State {
        self.inner.lock().state
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.is_cancelled() && self.state().is_running()
    }

    #[cfg(test)]
    pub(crate) fn num_children(&self) -> usize {
        self.inner.lock().children.len()
    }

    /// Moves an eagerly launched task to `Active`. The caller schedules it.
    pub(crate) fn activate(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::New {
            inner.state = State::Active;
        }
    }

    /// Parks the runnable of a lazily launched task until `start` or `cancel`.
    pub(crate) fn set_pending(&self, runnable: Arc<Runnable>) {
        let runnable = {
            let mut inner = self.inner.lock();
            debug_assert_eq!(inner.state, State::New);

            // Inherited cancellation: drive it right away so it can terminate.
            if !self.is_cancelled() {
                inner.pending = Some(runnable);
                return;
            }

            inner.state = State::Cancelling;
            runnable
        };

        runnable.schedule();
    }

    /// Starts a lazy task. Returns false if the task was already started or
    /// cancelled.
    pub(crate) fn start(&self) -> bool {
        let runnable = {
            let mut inner = self.inner.lock();
            if inner.state != State::New || self.is_cancelled() {
                return false;
            }

            inner.state = State::Active;
            inner.pending.take()
        };

        match runnable {
            Some(runnable) => {
                tracing::trace!(task.id = %self.id, "lazy task started");
                runnable.schedule();
                true
            }
            None => false,
        }
    }

    /// Requests cancellation of this task and, transitively, of all of its
    /// descendants. Never blocks and never runs task code.
    pub(crate) fn cancel(self: &Arc<Self>) -> CancellationStats {
        let mut stats = CancellationStats::default();
        let mut to_visit: SmallVec<[Arc<TaskNode>; SPILL_TO_HEAP_THRESHOLD]> =
            SmallVec::new();
        to_visit.push(Arc::clone(self));

        while let Some(node) = to_visit.pop() {
            stats.visited += 1;

            if let Some(children) = node.cancel_one() {
                stats.cancelled += 1;
                to_visit.extend(children);
            }
        }

        if stats.cancelled > 0 {
            tracing::debug!(
                task.id = %self.id,
                visited = stats.visited,
                cancelled = stats.cancelled,
                "cancellation requested"
            );
        }

        stats
    }

    // Returns the children to visit next, or None if the node was terminal or
    // already cancelled, in which case its subtree is cancelled too.
    fn cancel_one(&self) -> Option<SmallVec<[Arc<TaskNode>; SPILL_TO_HEAP_THRESHOLD]>> {
        let (wakers, pending, children) = {
            let mut inner = self.inner.lock();

            if inner.state.is_terminal() || self.cancel_requested.swap(true, Ordering::AcqRel) {
                return None;
            }

            inner.state = State::Cancelling;

            (
                mem::take(&mut inner.cancel_wakers),
                inner.pending.take(),
                inner.children.values().cloned().collect(),
            )
        };

        wakers.into_iter().for_each(Waker::wake);

        // A never-started lazy task still needs its driver to run so that it
        // reaches a terminal state. The driver sees the flag and skips the body.
        if let Some(runnable) = pending {
            runnable.schedule();
        }

        Some(children)
    }

    /// Records a failure coming from a child and cancels this task, which in
    /// turn cancels every sibling of the failed child.
    pub(crate) fn child_failed(self: &Arc<Self>, err: Error) {
        {
            let mut inner = self.inner.lock();
            match inner.first_failure {
                None => inner.first_failure = Some(err),
                Some(_) => {
                    tracing::debug!(task.id = %self.id, error = %err, "discarding subsequent child failure");
                }
            }
        }

        self.cancel();
    }

    pub(crate) fn first_failure(&self) -> Option<Error> {
        self.inner.lock().first_failure.clone()
    }

    pub(crate) fn forget_child(&self, id: &Id) {
        self.inner.lock().children.remove(id);
    }

    /// Cancels the current children. When `only_unstarted` is set, only the
    /// lazy children that never started are cancelled.
    pub(crate) fn cancel_children(&self, only_unstarted: bool) {
        let children: SmallVec<[Arc<TaskNode>; SPILL_TO_HEAP_THRESHOLD]> =
            self.inner.lock().children.values().cloned().collect();

        for child in children {
            if !only_unstarted || child.state() == State::New {
                child.cancel();
            }
        }
    }

    /// Returns the oldest remaining child, or seals the task against new
    /// children if there are none left.
    pub(crate) fn next_child_or_seal(&self) -> Option<Arc<TaskNode>> {
        let mut inner = self.inner.lock();

        match inner.children.first_key_value() {
            Some((_, child)) => Some(Arc::clone(child)),
            None => {
                inner.accepting = false;
                None
            }
        }
    }

    /// The body returned, move to `Completing` or `Cancelling`.
    pub(crate) fn begin_completion(&self, body_ok: bool) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.state.is_terminal());

        inner.state = if body_ok && !self.is_cancelled() {
            State::Completing
        } else {
            State::Cancelling
        };
    }

    /// Makes the task terminal. Must be called after the result was stored and
    /// every child is terminal.
    pub(crate) fn finish(&self, outcome: Option<&Error>) {
        let parent = self.parent();

        // Propagate before becoming terminal, so the parent observes the failure
        // before its join on this task resolves.
        if let Some(err) = outcome.filter(|err| !err.is_cancelled())
            && let Some(parent) = parent.as_ref()
            && !self.opts.is_scoped()
        {
            parent.child_failed(err.clone());
        }

        let (state, waiters) = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.children.is_empty(), "task finished before its children");

            inner.state = match outcome {
                None => State::Completed,
                Some(_) => State::Cancelled,
            };
            inner.accepting = false;
            inner.cancel_wakers.clear();

            (inner.state, mem::take(&mut inner.join_waiters))
        };

        tracing::debug!(
            task.id = %self.id,
            dispatcher = self.dispatcher.name(),
            %state,
            waiters = waiters.len(),
            "task terminated"
        );

        // Waiters are woken in registration order.
        waiters.into_iter().for_each(Waker::wake);

        if let Some(parent) = parent {
            parent.forget_child(&self.id);
        }
    }

    /// Resolves once the task is terminal. Waiters are registered FIFO.
    pub(crate) fn poll_terminal(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.inner.lock();

        if inner.state.is_terminal() {
            return Poll::Ready(());
        }

        if !inner.join_waiters.iter().any(|w| w.will_wake(cx.waker())) {
            inner.join_waiters.push_back(cx.waker().clone());
        }

        Poll::Pending
    }

    pub(crate) fn register_cancel_waker(&self, waker: &Waker) {
        let mut inner = self.inner.lock();

        if !inner.cancel_wakers.iter().any(|w| w.will_wake(waker)) {
            inner.cancel_wakers.push(waker.clone());
        }
    }
}

// Skip both parent and children to avoid printing the whole tree.
impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("opts", &self.opts)
            .field("dispatcher", &self.dispatcher.name())
            .field("cancel_requested", &self.cancel_requested)
            .finish()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CancellationStats {
    /// Total number of task nodes visited during the traversal.
    pub(crate) visited: usize,
    /// Number of tasks whose flag was set by this traversal.
    pub(crate) cancelled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Recorder, finish_leaf};
    use rstest::rstest;

    fn root() -> Arc<TaskNode> {
        TaskNode::new_root(TaskOpts::default(), Dispatcher::unconfined()).unwrap()
    }

    fn child_of(parent: &Arc<TaskNode>) -> Arc<TaskNode> {
        let child =
            TaskNode::new_child(parent, TaskOpts::default(), Dispatcher::unconfined(), false)
                .unwrap();
        child.activate();
        child
    }

    #[rstest]
    #[case::linear(4, 1)]
    #[case::binary(3, 2)]
    #[case::wide(1, 8)]
    fn test_cancel_is_transitive(#[case] depth: usize, #[case] branching: usize) {
        let root = root();
        root.activate();

        let mut level = vec![Arc::clone(&root)];
        let mut all = vec![Arc::clone(&root)];
        for _ in 0..depth {
            level = level
                .iter()
                .flat_map(|p| (0..branching).map(|_| child_of(p)).collect::<Vec<_>>())
                .collect();
            all.extend(level.iter().cloned());
        }

        let stats = root.cancel();
        assert_eq!(stats.cancelled, all.len());
        assert_eq!(stats.visited, all.len());

        for node in &all {
            assert!(node.is_cancelled());
            assert!(!node.is_active());
            assert_eq!(node.state(), State::Cancelling);
        }

        // Idempotent: nothing left to cancel.
        let stats = root.cancel();
        assert_eq!(stats.cancelled, 0);
        assert_eq!(stats.visited, 1);
    }

    #[test]
    fn test_children_in_launch_order() {
        let root = root();
        let ids = (0..5).map(|_| child_of(&root).id).collect::<Vec<_>>();

        let mut seen = vec![];
        while let Some(child) = root.next_child_or_seal() {
            seen.push(child.id);
            finish_leaf(&child, None);
        }

        assert_eq!(seen, ids);
        assert_eq!(root.num_children(), 0);
    }

    #[test]
    fn test_sealed_scope_rejects_children() {
        let root = root();
        assert!(root.next_child_or_seal().is_none());

        let err = TaskNode::new_child(&root, TaskOpts::default(), Dispatcher::unconfined(), false)
            .unwrap_err();
        assert_eq!(err, Error::ScopeClosed(root.id));
    }

    #[test]
    fn test_cancelled_parent_creates_cancelled_child() {
        let root = root();
        root.activate();
        root.cancel();

        let child = child_of(&root);
        assert!(child.is_cancelled());
        assert!(!child.is_active());
    }

    #[test]
    fn test_cancel_terminal_is_noop() {
        let root = root();
        let child = child_of(&root);
        finish_leaf(&child, None);

        assert_eq!(child.cancel().cancelled, 0);
        assert!(!child.is_cancelled());
        assert_eq!(child.state(), State::Completed);
    }

    #[test]
    fn test_first_failure_wins_and_cancels_siblings() {
        let root = root();
        root.activate();
        let (a, b, c) = (child_of(&root), child_of(&root), child_of(&root));

        let first = Error::failure(anyhow::anyhow!("first"));
        let second = Error::failure(anyhow::anyhow!("second"));

        finish_leaf(&a, Some(&first));
        assert!(root.is_cancelled());
        assert!(b.is_cancelled() && c.is_cancelled());

        finish_leaf(&b, Some(&second));
        finish_leaf(&c, Some(&Error::Cancelled));

        assert_eq!(root.first_failure(), Some(first));
        assert_eq!(root.num_children(), 0);
    }

    #[test]
    fn test_cancellation_never_propagates_up() {
        let root = root();
        root.activate();
        let child = child_of(&root);

        child.cancel();
        finish_leaf(&child, Some(&Error::Cancelled));

        assert!(!root.is_cancelled());
        assert!(root.first_failure().is_none());
        assert_eq!(child.state(), State::Cancelled);
    }

    #[test]
    fn test_join_waiters_woken_fifo() {
        let root = root();
        let child = child_of(&root);
        let recorder = Recorder::default();

        for i in 0..4 {
            let waker = recorder.waker(i);
            let mut cx = Context::from_waker(&waker);
            assert!(child.poll_terminal(&mut cx).is_pending());
            // Re-registering the same waker is a no-op.
            assert!(child.poll_terminal(&mut cx).is_pending());
        }

        finish_leaf(&child, None);
        assert_eq!(recorder.events(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_cancel_wakes_suspension_points() {
        let root = root();
        let child = child_of(&root);
        let recorder = Recorder::default();

        let waker = recorder.waker(7);
        child.register_cancel_waker(&waker);
        child.register_cancel_waker(&waker);
        assert!(recorder.events().is_empty());

        root.cancel();
        assert_eq!(recorder.events(), vec![7]);
    }
}
