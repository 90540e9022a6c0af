//! Tasks and the tree they form.

mod id;
pub use self::id::Id;

mod state;
pub use self::state::State;

mod opts;
pub(crate) use self::opts::TaskOptsInternal;
pub use self::opts::{StartMode, TaskOpts};

mod node;
pub(crate) use self::node::TaskNode;

mod runnable;
pub(crate) use self::runnable::Runnable;

pub(crate) mod harness;

mod join;
pub(crate) use self::join::Join;

mod suspend;
pub(crate) use self::suspend::{Suspend, YieldNow};

mod job;
pub use self::job::Job;

mod deferred;
pub use self::deferred::Deferred;
