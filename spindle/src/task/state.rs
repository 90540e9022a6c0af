use std::fmt;

/// Lifecycle of a task.
///
/// ```text
/// New ──▶ Active ──▶ Completing ──▶ Completed
///  │        │            │
///  └────────┴────────────┴──▶ Cancelling ──▶ Cancelled
/// ```
///
/// `Completed` and `Cancelled` are terminal. A task whose body failed also ends
/// in `Cancelled`; the failure itself is kept as the task's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Created but not scheduled yet. Only lazily started tasks linger here.
    New,
    /// The body is running (or scheduled to run).
    Active,
    /// The body returned successfully, waiting for children to finish.
    Completing,
    /// Cancellation was requested or the body failed, children are being
    /// cancelled and joined.
    Cancelling,
    Completed,
    Cancelled,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::Cancelled)
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(self, State::Active | State::Completing)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::New => "new",
            State::Active => "active",
            State::Completing => "completing",
            State::Cancelling => "cancelling",
            State::Completed => "completed",
            State::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
