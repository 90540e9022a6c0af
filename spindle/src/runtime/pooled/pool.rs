use anyhow::{Context, Result};
use crossbeam_deque::{Injector, Steal, Worker as CbWorker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

use crate::runtime::DispatcherConfig;
use crate::runtime::pooled::worker::{self, Worker};
use crate::runtime::unconfined;
use crate::task::Runnable;

/// State shared by every worker of a pool and by the threads submitting to it.
#[derive(Debug)]
pub(super) struct Shared {
    pub(super) cfg: DispatcherConfig,

    /// Global FIFO queue, fed by threads that are not workers of this pool.
    pub(super) injector: Injector<Arc<Runnable>>,

    pub(super) shutdown: AtomicBool,

    /// LIFO collection of parked threads. We unpark threads in LIFO order as
    /// the latest parked thread is the one where CPU cache will be the hotest.
    parked_threads: Mutex<VecDeque<(Thread, Arc<AtomicBool>)>>,
}

impl Shared {
    fn new(cfg: DispatcherConfig) -> Self {
        let pool_size = cfg.pool_size;

        Self {
            cfg,
            injector: Injector::new(),
            shutdown: AtomicBool::new(false),
            parked_threads: Mutex::new(VecDeque::with_capacity(pool_size)),
        }
    }

    pub(super) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Parks the current thread until the pool judges there is work for it.
    pub(super) fn park_current_thread(&self, should_unpark: &Arc<AtomicBool>) {
        {
            let mut parked_threads = self.parked_threads.lock();

            // We need to check these signals *while holding the lock* to avoid race
            // conditions. These are used right before we call unpark.
            if !self.injector.is_empty() || self.is_shutdown() {
                return;
            }

            should_unpark.store(false, Ordering::Release);
            parked_threads.push_back((thread::current(), Arc::clone(should_unpark)));
        }

        tracing::trace!(dispatcher = %self.cfg.name, "worker parked");

        // Account for spurious wakeups as per docs.
        while !should_unpark.load(Ordering::Acquire) {
            thread::park();
        }

        tracing::trace!(dispatcher = %self.cfg.name, "worker unparked");
    }

    pub(super) fn unpark_one_thread(&self) -> bool {
        match self.parked_threads.lock().pop_back() {
            Some((thread, should_unpark)) => {
                should_unpark.store(true, Ordering::Release);
                thread.unpark();
                true
            }
            None => false,
        }
    }

    fn unpark_all_threads(&self) -> usize {
        let mut num_unparked = 0;
        let mut parked_threads = self.parked_threads.lock();

        while let Some((thread, should_unpark)) = parked_threads.pop_back() {
            num_unparked += 1;
            should_unpark.store(true, Ordering::Release);
            thread.unpark();
        }

        num_unparked
    }

    #[cfg(test)]
    pub(super) fn num_parked(&self) -> usize {
        self.parked_threads.lock().len()
    }

    /// Cancels and runs inline whatever is left in the injector after
    /// shutdown.
    pub(super) fn drain_injector(&self) {
        loop {
            match self.injector.steal() {
                Steal::Success(runnable) => cancel_and_run_inline(runnable),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }
}

pub(super) fn cancel_and_run_inline(runnable: Arc<Runnable>) {
    runnable.node.cancel();
    unconfined::dispatch(runnable);
}

#[derive(Debug)]
pub(crate) struct Pool {
    pub(super) shared: Arc<Shared>,

    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Pool {
    pub(crate) fn try_new(cfg: DispatcherConfig) -> Result<Arc<Pool>> {
        let num_workers = cfg.pool_size;
        let shared = Arc::new(Shared::new(cfg));

        // Local queues are FIFO: a task woken on a worker goes behind the
        // work that was already ready there.
        let local_queues = (0..num_workers)
            .map(|_| CbWorker::new_fifo())
            .collect::<Vec<_>>();
        let stealers = local_queues.iter().map(CbWorker::stealer).collect::<Vec<_>>();

        let pool = Arc::new(Pool {
            shared: Arc::clone(&shared),
            handles: Mutex::new(Vec::with_capacity(num_workers)),
        });

        for (i, local_queue) in local_queues.into_iter().enumerate() {
            // Give each worker a list of all *other* workers' stealers
            let other_stealers = stealers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, s)| s.clone())
                .collect::<Vec<_>>();

            let shared = Arc::clone(&shared);
            let spawned = shared
                .cfg
                .thread_builder()
                .spawn(move || worker::run(Worker::new(shared, local_queue, other_stealers)));

            match spawned.context("failed to spawn pool worker thread") {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            dispatcher = %shared.cfg.name,
            pool_size = num_workers,
            "pooled dispatcher started"
        );

        Ok(pool)
    }

    pub(crate) fn name(&self) -> &str {
        &self.shared.cfg.name
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.is_shutdown()
    }

    pub(crate) fn submit(&self, runnable: Arc<Runnable>) -> Result<(), Arc<Runnable>> {
        if self.shared.is_shutdown() {
            return Err(runnable);
        }

        // # Fast path
        //
        // Submitted from one of our own workers: keep it local, other workers
        // steal it if they are idle.
        let runnable = match worker::try_push_local(&self.shared, runnable) {
            Ok(()) => {
                self.shared.unpark_one_thread();
                return Ok(());
            }
            Err(runnable) => runnable,
        };

        self.shared.injector.push(runnable);
        self.shared.unpark_one_thread();

        // Raced with shutdown, the workers may be gone already.
        if self.shared.is_shutdown() {
            self.shared.drain_injector();
        }

        Ok(())
    }

    /// Stops the workers and joins them, except for the calling thread if it is
    /// one of them. It leaves its loop once the current task yields.
    pub(crate) fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let num_unparked = self.shared.unpark_all_threads();
        tracing::debug!(
            dispatcher = %self.shared.cfg.name,
            num_unparked,
            "shutting down pooled dispatcher"
        );

        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.handles.lock());

        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }

            let name = handle.thread().name().map(String::from);
            if handle.join().is_err() {
                tracing::error!(dispatcher = %self.shared.cfg.name, thread = ?name, "worker thread panicked");
            }
        }

        self.shared.drain_injector();
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
