//! A dispatcher owning a single named thread.
use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::runtime::DispatcherConfig;
use crate::task::Runnable;

#[derive(Debug)]
pub(crate) struct Pinned {
    name: String,

    shared: Arc<Shared>,

    thread_id: ThreadId,

    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<Queue>,

    cond: Condvar,
}

#[derive(Debug, Default)]
struct Queue {
    runnables: VecDeque<Arc<Runnable>>,

    // Set under the lock, so a submit either lands before the thread drains
    // the queue for the last time or is rejected.
    closed: bool,
}

impl Pinned {
    pub(crate) fn try_new(cfg: DispatcherConfig) -> Result<Arc<Pinned>> {
        let shared = Arc::new(Shared::default());

        let handle = {
            let shared = Arc::clone(&shared);
            cfg.thread_builder()
                .spawn(move || run(&shared))
                .with_context(|| format!("failed to spawn pinned thread {:?}", cfg.name))?
        };

        tracing::debug!(dispatcher = %cfg.name, "pinned dispatcher started");

        Ok(Arc::new(Pinned {
            name: cfg.name,
            shared,
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    pub(crate) fn submit(&self, runnable: Arc<Runnable>) -> Result<(), Arc<Runnable>> {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            return Err(runnable);
        }

        queue.runnables.push_back(runnable);
        drop(queue);

        self.shared.cond.notify_one();
        Ok(())
    }

    /// Closes the queue and joins the thread, unless called from the pinned
    /// thread itself.
    pub(crate) fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return;
            }
            queue.closed = true;
        }

        tracing::debug!(dispatcher = %self.name, "shutting down pinned dispatcher");
        self.shared.cond.notify_all();

        if thread::current().id() == self.thread_id {
            return;
        }

        if let Some(handle) = self.handle.lock().take()
            && handle.join().is_err()
        {
            tracing::error!(dispatcher = %self.name, "pinned thread panicked");
        }
    }
}

impl Drop for Pinned {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared) {
    loop {
        let (runnable, closed) = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(runnable) = queue.runnables.pop_front() {
                    break (runnable, queue.closed);
                }

                if queue.closed {
                    return;
                }

                shared.cond.wait(&mut queue);
            }
        };

        // Leftovers after shutdown are cancelled, then driven to completion.
        if closed {
            runnable.node.cancel();
        }

        runnable.run();
    }
}
