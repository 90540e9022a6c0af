//! Pull-based lazy generators.
use futures::future::LocalBoxFuture;
use pin_project::pin_project;
use std::cell::RefCell;
use std::fmt;
use std::iter::FusedIterator;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Builds a lazy sequence out of a producer that emits values one at a time.
///
/// Nothing runs until the first call to `next`. Each call resumes the
/// producer until its next [`Emitter::emit`], or until it returns, which ends
/// the sequence. The sequence is single-threaded and cannot be restarted.
///
/// The producer must only await `emit`. Awaiting anything else ends the
/// sequence, and is logged as an error.
///
/// # Examples
///
/// ```
/// let words = spindle::sequence(|co| async move {
///     co.emit("hello").await;
///     co.emit("world").await;
/// });
///
/// assert_eq!(words.collect::<Vec<_>>(), vec!["hello", "world"]);
/// ```
pub fn sequence<T, F, Fut>(producer: F) -> Sequence<T>
where
    T: 'static,
    F: FnOnce(Emitter<T>) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    Sequence {
        state: State::Ready(Box::new(move |emitter| Box::pin(producer(emitter)))),
        slot: Rc::new(RefCell::new(None)),
    }
}

type Init<T> = Box<dyn FnOnce(Emitter<T>) -> LocalBoxFuture<'static, ()>>;

enum State<T> {
    // Not started yet.
    Ready(Init<T>),

    // Parked right after an emit.
    Suspended(LocalBoxFuture<'static, ()>),

    Exhausted,
}

/// The iterator returned by [`sequence`].
pub struct Sequence<T> {
    state: State<T>,

    // Where `emit` leaves the value for `next` to pick up.
    slot: Rc<RefCell<Option<T>>>,
}

impl<T> Iterator for Sequence<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let mut frame = match mem::replace(&mut self.state, State::Exhausted) {
            State::Ready(init) => init(Emitter {
                slot: Rc::clone(&self.slot),
            }),
            State::Suspended(frame) => frame,
            State::Exhausted => return None,
        };

        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        match frame.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                tracing::trace!("sequence exhausted");
                None
            }
            Poll::Pending => match self.slot.borrow_mut().take() {
                Some(value) => {
                    self.state = State::Suspended(frame);
                    Some(value)
                }
                None => {
                    tracing::error!(
                        "sequence producer suspended without emitting a value, ending the sequence"
                    );
                    None
                }
            },
        }
    }
}

impl<T> FusedIterator for Sequence<T> {}

impl<T> fmt::Debug for Sequence<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Ready(_) => "ready",
            State::Suspended(_) => "suspended",
            State::Exhausted => "exhausted",
        };

        f.debug_struct("Sequence").field("state", &state).finish()
    }
}

/// Handed to the producer of a [`sequence`].
pub struct Emitter<T> {
    slot: Rc<RefCell<Option<T>>>,
}

impl<T> Emitter<T> {
    /// Hands `value` to the consumer and suspends the producer until the next
    /// call to `next`.
    pub fn emit(&self, value: T) -> Emit<'_, T> {
        Emit {
            emitter: self,
            value: Some(value),
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").finish_non_exhaustive()
    }
}

/// Future returned by [`Emitter::emit`].
#[pin_project]
#[must_use = "values are only emitted when the future is awaited"]
pub struct Emit<'a, T> {
    emitter: &'a Emitter<T>,

    value: Option<T>,
}

impl<T> Future for Emit<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        // Suspend once with the value in the slot, resume on the next pull.
        match this.value.take() {
            Some(value) => {
                *this.emitter.slot.borrow_mut() = Some(value);
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}
