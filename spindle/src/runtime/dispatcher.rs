use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::runtime::builder::{Builder, DispatcherConfig};
use crate::runtime::{blocking, pinned, pooled, unconfined};
use crate::scope::Scope;
use crate::task::Runnable;

static COMMON: OnceLock<Dispatcher> = OnceLock::new();

/// A handle to an execution context for task continuations.
///
/// Cheap to clone: every clone refers to the same threads and queues.
#[derive(Clone)]
pub struct Dispatcher {
    kind: Kind,
}

#[derive(Clone)]
enum Kind {
    Pooled(Arc<pooled::Pool>),
    Pinned(Arc<pinned::Pinned>),
    Unconfined,
}

impl Dispatcher {
    /// The process-wide pool, sized to the available parallelism and created
    /// on first use. It lives until the process exits: `shutdown` on it does
    /// nothing.
    pub fn common() -> Dispatcher {
        COMMON
            .get_or_init(|| {
                Builder::new_pooled()
                    .name("common")
                    .try_build()
                    .expect("Failed building the common Dispatcher")
            })
            .clone()
    }

    /// A dispatcher owning one thread named `name`. Shut it down once done.
    pub fn pinned(name: impl Into<String>) -> anyhow::Result<Dispatcher> {
        Builder::new_pinned(name).try_build()
    }

    /// Runs continuations on whichever thread resumes them: the thread that
    /// launched the task, the timer thread, or the thread that woke it.
    pub fn unconfined() -> Dispatcher {
        Dispatcher {
            kind: Kind::Unconfined,
        }
    }

    pub(crate) fn try_new_pooled(cfg: DispatcherConfig) -> anyhow::Result<Dispatcher> {
        Ok(Dispatcher {
            kind: Kind::Pooled(pooled::Pool::try_new(cfg)?),
        })
    }

    pub(crate) fn try_new_pinned(cfg: DispatcherConfig) -> anyhow::Result<Dispatcher> {
        Ok(Dispatcher {
            kind: Kind::Pinned(pinned::Pinned::try_new(cfg)?),
        })
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            Kind::Pooled(pool) => pool.name(),
            Kind::Pinned(pinned) => pinned.name(),
            Kind::Unconfined => "unconfined",
        }
    }

    /// Runs `body` as the root of a structured scope and blocks the calling
    /// thread until the root and all of its descendants are terminal.
    ///
    /// See [`run_blocking`](crate::run_blocking).
    pub fn run_blocking<T, F, Fut>(&self, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        blocking::run_blocking(self, body)
    }

    /// Stops the dispatcher and joins its threads.
    ///
    /// New launches fail with [`Error::DispatcherClosed`]. Tasks that are still
    /// queued, or that wake up later, are cancelled and driven to completion
    /// inline so that nobody waits on them forever.
    ///
    /// Idempotent. Does nothing for the unconfined and common dispatchers.
    pub fn shutdown(&self) {
        match &self.kind {
            Kind::Pooled(pool) => {
                if !self.is_common() {
                    pool.shutdown();
                }
            }
            Kind::Pinned(pinned) => pinned.shutdown(),
            Kind::Unconfined => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.kind {
            Kind::Pooled(pool) => pool.is_closed(),
            Kind::Pinned(pinned) => pinned.is_closed(),
            Kind::Unconfined => false,
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::DispatcherClosed(self.name().to_string()))
        } else {
            Ok(())
        }
    }

    /// Queues a runnable. Hands it back if the dispatcher is closed.
    pub(crate) fn submit(&self, runnable: Arc<Runnable>) -> Result<(), Arc<Runnable>> {
        match &self.kind {
            Kind::Pooled(pool) => pool.submit(runnable),
            Kind::Pinned(pinned) => pinned.submit(runnable),
            Kind::Unconfined => {
                unconfined::dispatch(runnable);
                Ok(())
            }
        }
    }

    fn is_common(&self) -> bool {
        match (&self.kind, COMMON.get().map(|common| &common.kind)) {
            (Kind::Pooled(pool), Some(Kind::Pooled(common))) => Arc::ptr_eq(pool, common),
            _ => false,
        }
    }
}

// Test-only helpers
#[cfg(test)]
impl Dispatcher {
    pub(crate) fn expect_pooled(&self) -> &Arc<pooled::Pool> {
        match &self.kind {
            Kind::Pooled(pool) => pool,
            _ => panic!("Dispatcher is not pooled"),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flavor = match &self.kind {
            Kind::Pooled(_) => "pooled",
            Kind::Pinned(_) => "pinned",
            Kind::Unconfined => "unconfined",
        };

        f.debug_struct("Dispatcher")
            .field("flavor", &flavor)
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}
