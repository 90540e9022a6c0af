use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::atomic::{self, AtomicBool};
use std::sync::{Arc, LazyLock};
use std::task::Waker;
use std::thread;
use std::time::Instant;

use crate::runtime::SPILL_TO_HEAP_THRESHOLD;

pub(crate) const TIMER_THREAD_NAME: &str = "spindle-timer";

// Process-wide, started on first use. Never shut down: it only sleeps when
// there is nothing to fire.
static TIMER: LazyLock<Arc<Timer>> = LazyLock::new(|| {
    let timer = Arc::new(Timer::default());

    thread::Builder::new()
        .name(TIMER_THREAD_NAME.to_string())
        .spawn({
            let timer = Arc::clone(&timer);
            move || timer.run()
        })
        .expect("failed to spawn timer thread");

    timer
});

/// Registers a wake-up at `deadline` with the timer thread.
pub(crate) fn register(deadline: Instant) -> Arc<TimerSlot> {
    TIMER.register(deadline)
}

/// Removes the entry of `slot` so it never fires.
pub(crate) fn cancel(slot: &TimerSlot) {
    TIMER.cancel(slot)
}

// Equal deadlines fire in registration order.
type Key = (Instant, u64);

/// Where the timer thread finds the waker to call once the deadline passed.
#[derive(Debug)]
pub(crate) struct TimerSlot {
    key: Key,

    waker: Mutex<Option<Waker>>,

    fired: AtomicBool,
}

impl TimerSlot {
    fn new(key: Key) -> Self {
        Self {
            key,
            waker: Mutex::new(None),
            fired: AtomicBool::new(false),
        }
    }

    /// Stores the waker to call on firing. Returns false if the slot already
    /// fired, in which case the waker is not stored.
    pub(crate) fn set_waker(&self, waker: &Waker) -> bool {
        let mut slot = self.waker.lock();

        if self.fired.load(atomic::Ordering::Acquire) {
            return false;
        }

        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }

        true
    }

    // The entry may already be in flight on the timer thread, firing it then
    // does nothing.
    fn clear(&self) {
        self.waker.lock().take();
    }

    fn fire(&self) {
        let waker = {
            let mut slot = self.waker.lock();
            self.fired.store(true, atomic::Ordering::Release);
            slot.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

#[derive(Debug, Default)]
struct Timer {
    queue: Mutex<TimerQueue>,

    cond: Condvar,
}

#[derive(Debug, Default)]
struct TimerQueue {
    entries: BTreeMap<Key, Arc<TimerSlot>>,

    next_seq: u64,
}

impl Timer {
    fn register(&self, deadline: Instant) -> Arc<TimerSlot> {
        let (slot, is_next) = {
            let mut queue = self.queue.lock();
            let key = (deadline, queue.next_seq);
            queue.next_seq += 1;

            let slot = Arc::new(TimerSlot::new(key));
            queue.entries.insert(key, Arc::clone(&slot));

            let is_next = queue.entries.first_key_value().is_some_and(|(k, _)| *k == key);
            (slot, is_next)
        };

        // Only an earlier deadline changes how long the timer thread sleeps.
        if is_next {
            self.cond.notify_one();
        }

        slot
    }

    fn cancel(&self, slot: &TimerSlot) {
        self.queue.lock().entries.remove(&slot.key);
        slot.clear();
    }

    fn run(&self) {
        let mut queue = self.queue.lock();

        loop {
            let due = Self::pop_due(&mut queue, Instant::now());

            if !due.is_empty() {
                tracing::trace!(num_fired = due.len(), "timer entries fired");

                // Wakers may run task code inline (unconfined dispatcher), which
                // can register new entries.
                MutexGuard::unlocked(&mut queue, || due.iter().for_each(|slot| slot.fire()));
                continue;
            }

            match queue.entries.first_key_value() {
                Some((&(deadline, _), _)) => {
                    self.cond.wait_until(&mut queue, deadline);
                }
                None => self.cond.wait(&mut queue),
            }
        }
    }

    fn pop_due(
        queue: &mut TimerQueue,
        now: Instant,
    ) -> SmallVec<[Arc<TimerSlot>; SPILL_TO_HEAP_THRESHOLD]> {
        let mut due = SmallVec::new();

        while queue
            .entries
            .first_key_value()
            .is_some_and(|(&(deadline, _), _)| deadline <= now)
        {
            if let Some((_, slot)) = queue.entries.pop_first() {
                due.push(slot);
            }
        }

        due
    }
}

#[cfg(test)]
pub(crate) fn is_registered(slot: &TimerSlot) -> bool {
    TIMER.contains(slot)
}

#[cfg(test)]
impl Timer {
    fn num_entries(&self) -> usize {
        self.queue.lock().entries.len()
    }

    fn contains(&self, slot: &TimerSlot) -> bool {
        self.queue.lock().entries.contains_key(&slot.key)
    }
}
