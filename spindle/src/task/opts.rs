use bitflags::bitflags;

bitflags! {
    /// Configuration options for a new task.
    ///
    /// Passed to the runtime via [`LaunchBuilder::with_opts`].
    ///
    /// [`LaunchBuilder::with_opts`]: crate::LaunchBuilder::with_opts
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct TaskOpts: u16 {
        /// When the body returns successfully, wait for the remaining children
        /// to finish on their own instead of cancelling them.
        ///
        /// Children that were launched lazily and never started are still
        /// cancelled, otherwise the task would wait on them forever. If the body
        /// fails or the task is cancelled, children are cancelled as usual.
        const JOIN_CHILDREN_ON_EXIT = 1;
    }

    // == Not available publicly ==
    //
    // The bitspace is *shared* between TaskOpts and TaskOptsInternal as we
    // treat TaskOptsInternal as TaskOpts within the codebase.
    // - `TaskOpts` => defines flags starting from right-most bit.
    // - `TaskOptsInternal` => defines flags starting from left-most bit.
    #[doc(hidden)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub(crate) struct TaskOptsInternal: u16 {
        /// Task driven inline by its caller (`with_timeout`). Its failure is
        /// returned to the caller instead of being propagated to the parent.
        const SCOPED = 1 << 15;
    }
}

/// When a launched task starts running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StartMode {
    /// Scheduled immediately.
    #[default]
    Eager,

    /// Stays `New` until [`Job::start`], `join` or `await_on` is called. A lazy
    /// task that is never started is cancelled, without running, when its
    /// parent completes.
    ///
    /// [`Job::start`]: crate::task::Job::start
    Lazy,
}

impl From<TaskOptsInternal> for TaskOpts {
    fn from(val: TaskOptsInternal) -> Self {
        TaskOpts::from_bits_retain(val.bits())
    }
}

impl TaskOpts {
    pub(crate) fn join_children_on_exit(&self) -> bool {
        self.contains(TaskOpts::JOIN_CHILDREN_ON_EXIT)
    }

    pub(crate) fn is_scoped(&self) -> bool {
        self.contains_internal(TaskOptsInternal::SCOPED)
    }

    fn contains_internal(&self, other: TaskOptsInternal) -> bool {
        self.contains(other.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_opts_share_bitspace() {
        let opts = TaskOpts::JOIN_CHILDREN_ON_EXIT | TaskOptsInternal::SCOPED.into();

        assert!(opts.join_children_on_exit());
        assert!(opts.is_scoped());

        // Public constructors never produce internal flags.
        assert!(!TaskOpts::all().is_scoped());
        assert!(!TaskOpts::default().join_children_on_exit());
    }
}
