use parking_lot::Mutex;
use std::sync::Arc;
use std::task::{Wake, Waker};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::task::TaskNode;

/// Collects events from any thread, in the order they happened.
pub(crate) struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Recorder<T> {
    pub(crate) fn record(&self, event: T) {
        self.0.lock().push(event);
    }
}

impl<T: Clone> Recorder<T> {
    pub(crate) fn events(&self) -> Vec<T> {
        self.0.lock().clone()
    }
}

impl<T: Clone + Send + Sync + 'static> Recorder<T> {
    /// A waker recording `event` every time it is woken.
    pub(crate) fn waker(&self, event: T) -> Waker {
        Waker::from(Arc::new(RecordingWaker {
            recorder: self.clone(),
            event,
        }))
    }
}

struct RecordingWaker<T> {
    recorder: Recorder<T>,
    event: T,
}

impl<T: Clone + Send + Sync + 'static> Wake for RecordingWaker<T> {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.recorder.record(self.event.clone());
    }
}

/// Drives a childless node through completion without a runnable.
pub(crate) fn finish_leaf(node: &Arc<TaskNode>, outcome: Option<&Error>) {
    node.begin_completion(outcome.is_none());
    assert!(node.next_child_or_seal().is_none(), "leaf has children");
    node.finish(outcome);
}

#[track_caller]
pub(crate) fn assert_elapsed_between(start: Instant, min: Duration, max: Duration) {
    let elapsed = start.elapsed();
    assert!(
        elapsed >= min && elapsed <= max,
        "elapsed {elapsed:?} not in [{min:?}, {max:?}]"
    );
}
