use crossbeam_deque::{Stealer, Worker as CbWorker};
use std::cell::{Cell, RefCell};
use std::iter;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::runtime::pooled::pool::{Shared, cancel_and_run_inline};
use crate::runtime::{Ticker, TickerData, TickerEvents};
use crate::task::Runnable;

thread_local! {
    static CURRENT: RefCell<Option<Rc<Worker>>> = const { RefCell::new(None) };
}

#[derive(Debug)]
pub(super) struct Worker {
    shared: Arc<Shared>,

    /// Determines how we run the worker loop.
    cfg: RefCell<WorkerLoopConfig>,

    /// Worker loop ticker.
    ticker: RefCell<Ticker>,

    /// Whether we should try to find our next task in the global queue.
    pop_global_queue: Cell<bool>,

    /// Local FIFO queue, other workers steal from its front.
    local: CbWorker<Arc<Runnable>>,

    /// Handle to all of the other worker's local queues. If there are N
    /// workers we will have N-1 queues to steal from.
    stealers: Vec<Stealer<Arc<Runnable>>>,

    /// Flipped by the pool when it unparks this worker.
    should_unpark: Arc<AtomicBool>,
}

impl Worker {
    pub(super) fn new(
        shared: Arc<Shared>,
        local: CbWorker<Arc<Runnable>>,
        mut stealers: Vec<Stealer<Arc<Runnable>>>,
    ) -> Self {
        // Shuffle the stealers so that each worker's search order when trying to
        // steal work is different and hopefully unique to reduce contention.
        fastrand::shuffle(&mut stealers);

        Self {
            cfg: RefCell::new(WorkerLoopConfig::from(&*shared)),
            shared,
            ticker: RefCell::new(Ticker::new()),
            pop_global_queue: Cell::new(false),
            local,
            stealers,
            should_unpark: Arc::new(AtomicBool::new(false)),
        }
    }

    fn find_task(&self) -> Option<Arc<Runnable>> {
        // Enforce fairness by force-checking the global queue with frequency
        // `global_queue_interval`.
        if self.pop_global_queue.replace(false)
            && let Some(runnable) = self.shared.injector.steal_batch_and_pop(&self.local).success()
        {
            return Some(runnable);
        }

        self.local.pop().or_else(|| {
            // No local work, repeatedly try the global injector and other
            // workers' local queues.
            iter::repeat_with(|| {
                self.shared.injector.steal_batch_and_pop(&self.local).or_else(||
                    // The behavior of collect here is to return the first Success(T) so
                    // *we are not* iterating through all stealers everytime.
                    self.stealers.iter().map(|s| s.steal()).collect())
            })
            // Repeat a maximum of `max_steal_retries` otherwise return None.
            .take(self.cfg.borrow().max_steal_retries)
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        })
    }

    fn tick(&self) -> TickerEvents {
        self.ticker
            .borrow_mut()
            .tick(&*self.shared, &mut *self.cfg.borrow_mut())
    }

    // Whatever is left locally once the pool shut down is cancelled and driven
    // to completion on this thread.
    fn drain_local(&self) {
        while let Some(runnable) = self.local.pop() {
            cancel_and_run_inline(runnable);
        }
    }
}

/// Worker thread entry point.
pub(super) fn run(worker: Worker) {
    let worker = Rc::new(worker);
    CURRENT.with_borrow_mut(|current| *current = Some(Rc::clone(&worker)));

    tracing::trace!(dispatcher = %worker.shared.cfg.name, "worker started");

    loop {
        match worker.find_task() {
            Some(runnable) => runnable.run(),
            None => worker.shared.park_current_thread(&worker.should_unpark),
        }

        let events = worker.tick();
        if events.contains(TickerEvents::SHUTDOWN) {
            break;
        } else if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
            worker.pop_global_queue.set(true);
        }
    }

    worker.drain_local();
    CURRENT.with_borrow_mut(|current| current.take());

    tracing::trace!(dispatcher = %worker.shared.cfg.name, "worker stopped");
}

/// Pushes on the local queue of the current thread if it is a worker of the
/// pool owning `shared`. Hands the runnable back otherwise.
pub(super) fn try_push_local(
    shared: &Arc<Shared>,
    runnable: Arc<Runnable>,
) -> Result<(), Arc<Runnable>> {
    CURRENT.with_borrow(|current| match current {
        Some(worker) if Arc::ptr_eq(&worker.shared, shared) => {
            worker.local.push(runnable);
            Ok(())
        }
        _ => Err(runnable),
    })
}

#[derive(Debug, Clone)]
struct WorkerLoopConfig {
    global_queue_interval: u32,

    max_steal_retries: usize,
}

impl From<&Shared> for WorkerLoopConfig {
    fn from(shared: &Shared) -> WorkerLoopConfig {
        WorkerLoopConfig {
            global_queue_interval: shared.cfg.global_queue_interval,
            max_steal_retries: shared.cfg.max_steal_retries,
        }
    }
}

impl TickerData for WorkerLoopConfig {
    type Context = Shared;

    #[inline(always)]
    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents {
        // Fast-path to enforce shutdown
        if ctx.is_shutdown() {
            return TickerEvents::SHUTDOWN;
        }

        if tick.is_multiple_of(self.global_queue_interval) {
            TickerEvents::POP_GLOBAL_QUEUE
        } else {
            TickerEvents::empty()
        }
    }
}
