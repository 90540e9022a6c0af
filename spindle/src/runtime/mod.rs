//! Dispatchers decide where the continuations of a task run.

// Used wherever we rely on SmallVec to store entries on stack first.
// Prevent most heap allocations when walking the task tree.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;

// Public API
mod builder;
pub use builder::Builder;
pub(crate) use builder::DispatcherConfig;

mod dispatcher;
pub use dispatcher::Dispatcher;

mod blocking;
pub use blocking::run_blocking;

// Flavors
pub(crate) mod pinned;

pub(crate) mod pooled;

pub(crate) mod unconfined;

mod ticker;
use ticker::{Ticker, TickerData, TickerEvents};
