//! Structured concurrency on top of a small set of dispatchers.
//!
//! Every task is launched through the [`Scope`] of its parent, so tasks form a
//! tree: a parent does not complete before all of its children are terminal,
//! cancellation flows down the tree, and the first failure of a child cancels
//! its siblings and fails the parent.
//!
//! ```no_run
//! use std::time::Duration;
//! use spindle::Scope;
//!
//! #[spindle::main]
//! async fn main(scope: Scope) -> spindle::Result<()> {
//!     let world = scope.deferred(|scope| async move {
//!         scope.delay(Duration::from_millis(100)).await?;
//!         Ok("world")
//!     })?;
//!
//!     println!("hello {}", world.await_on(&scope).await?);
//!     Ok(())
//! }
//! ```

#[doc(inline)]
pub use spindle_macros::main;

#[doc(inline)]
pub use spindle_macros::test;

mod error;
pub use error::{Error, Result};

mod scope;
pub use scope::{LaunchBuilder, Scope};

mod sequence;
pub use sequence::{Emit, Emitter, Sequence, sequence};

pub mod runtime;
pub use runtime::{Dispatcher, run_blocking};

pub mod task;
pub use task::{Deferred, Id, Job, StartMode, State, TaskOpts};

mod time;

mod utils;

#[cfg(test)]
mod test_utils;
