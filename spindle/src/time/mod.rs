//! Timer service: delays and timeouts.

mod timer;
pub(crate) use timer::TIMER_THREAD_NAME;

mod delay;
pub(crate) use delay::Delay;

pub(crate) mod timeout;
