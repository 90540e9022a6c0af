//! Fixed-size worker pool with a global injector, per-worker local queues and
//! work stealing.

mod pool;
pub(crate) use pool::Pool;

mod worker;
