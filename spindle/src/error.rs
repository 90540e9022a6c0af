use crate::task::Id;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of any task, suspension point or scope operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A centralized error type for task outcomes and runtime operations.
///
/// The type is `Clone` because a single failure is observed by every awaiter of a
/// [`Deferred`] and by the parent scope that the failure propagates to.
///
/// [`Deferred`]: crate::task::Deferred
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Cooperative unwind signal raised at a check point once cancellation was
    /// requested. It is not a failure: a task ending with it is simply cancelled,
    /// and it never propagates to the parent on its own.
    #[error("task was cancelled")]
    Cancelled,

    /// An unhandled error (or panic) escaped a task body.
    #[error("task failed: {0:#}")]
    Failure(Arc<anyhow::Error>),

    /// Raised by `with_timeout` when the deadline elapsed before the body completed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Work was submitted to a dispatcher that was shut down.
    #[error("dispatcher `{0}` is closed")]
    DispatcherClosed(String),

    /// The parent scope sealed its children and no longer accepts new ones.
    #[error("scope of task {0} no longer accepts children")]
    ScopeClosed(Id),
}

impl Error {
    /// Wraps any error as a task failure.
    pub fn failure(err: impl Into<anyhow::Error>) -> Self {
        Error::Failure(Arc::new(err.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Error::Failure(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// The underlying cause of a task failure.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            Error::Failure(cause) => Some(cause),
            _ => None,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "Box<dyn Any>".to_string());

        Error::failure(anyhow::anyhow!("task panicked: {}", msg))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Failure(Arc::new(err))
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cancelled, Self::Cancelled) => true,
            (Self::Failure(a), Self::Failure(b)) => Arc::ptr_eq(a, b),
            (Self::Timeout(a), Self::Timeout(b)) => a == b,
            (Self::DispatcherClosed(a), Self::DispatcherClosed(b)) => a == b,
            (Self::ScopeClosed(a), Self::ScopeClosed(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: Send, Sync, Clone, std::error::Error);

    #[test]
    fn test_failure_keeps_cause() {
        let err = Error::failure(std::io::Error::other("disk on fire"));
        assert!(err.is_failure());
        assert!(!err.is_cancelled());

        let cause = err.cause().expect("failure has a cause");
        assert!(cause.to_string().contains("disk on fire"));

        // Clones share the same cause.
        assert_eq!(err.clone(), err);
    }

    #[test]
    fn test_panic_payloads() {
        let err = Error::from_panic(Box::new("boom"));
        assert!(err.to_string().contains("task panicked: boom"));

        let err = Error::from_panic(Box::new(String::from("kaboom")));
        assert!(err.to_string().contains("task panicked: kaboom"));

        let err = Error::from_panic(Box::new(42_u8));
        assert!(err.to_string().contains("Box<dyn Any>"));
    }
}
