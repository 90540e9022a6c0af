use anyhow::{Result, anyhow};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crate::runtime::Dispatcher;

///
/// Worker loop policies
//
/// Global queue interval default value.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

/// Name of a pooled dispatcher when none is given.
const DEFAULT_POOL_NAME: &str = "spindle-pool";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Pooled,
    Pinned,
    Unconfined,
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn(prefix: &str) -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));
    let prefix = prefix.to_string();

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{id}")
    }))
}

fn fixed_thread_name_fn(name: String) -> ThreadNameFn {
    ThreadNameFn(Arc::new(move || name.clone()))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and creates a [`Dispatcher`].
///
/// # Examples
///
/// ```no_run
/// use spindle::runtime::Builder;
///
/// # fn doc() -> anyhow::Result<()> {
/// let pool = Builder::new_pooled().pool_size(4).name("io").try_build()?;
/// let ui = Builder::new_pinned("ui").try_build()?;
///
/// pool.shutdown();
/// ui.shutdown();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Dispatcher flavor
    kind: Kind,

    /// Name of the dispatcher, shows up in logs and errors. Pinned dispatchers
    /// also use it as their thread name.
    name: Option<String>,

    /// The number of worker threads of a pooled dispatcher. Defaults to 1 per
    /// core.
    pool_size: Option<usize>,

    /// Name fn used for threads spawned by the dispatcher.
    thread_name: Option<ThreadNameFn>,

    /// Stack size used for threads spawned by the dispatcher.
    thread_stack_size: Option<usize>,

    /// How many ticks before pulling a task from the global injector queue.
    global_queue_interval: u32,

    /// How many times a worker will loop over the global injector queue and
    /// the other workers' queues to find work before parking.
    max_steal_retries: usize,
}

impl Builder {
    fn new(kind: Kind) -> Self {
        Self {
            kind,
            name: None,
            pool_size: None,
            thread_name: None,
            thread_stack_size: None,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
        }
    }

    /// A fixed-size pool of worker threads sharing a global queue, with work
    /// stealing between workers.
    pub fn new_pooled() -> Builder {
        Builder::new(Kind::Pooled)
    }

    /// A single dedicated thread named `name`. Every continuation scheduled on
    /// it runs on that thread.
    pub fn new_pinned(name: impl Into<String>) -> Builder {
        let mut builder = Builder::new(Kind::Pinned);
        builder.name = Some(name.into());
        builder
    }

    /// Runs continuations on whichever thread resumes them.
    pub fn new_unconfined() -> Builder {
        Builder::new(Kind::Unconfined)
    }

    /// The number of worker threads. Only valid for pooled dispatchers.
    ///
    /// Defaults to 1 worker per CPU core.
    #[track_caller]
    pub fn pool_size(mut self, val: usize) -> Self {
        assert!(val > 0, "pool_size must be greater than 0");
        self.pool_size = Some(val);
        self
    }

    #[track_caller]
    pub fn name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        assert!(!val.is_empty(), "name must not be empty");
        self.name = Some(val);
        self
    }

    /// Sets name of threads spawned by the dispatcher.
    ///
    /// The default name is "{name}-{id}" for pooled dispatchers, where id is
    /// monotonically increasing, and "{name}" for pinned ones.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        self.thread_name = Some(fixed_thread_name_fn(val.into()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// dispatcher.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = Some(ThreadNameFn(Arc::new(f)));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets the number of ticks after which a pooled worker looks at the global
    /// queue before its local queue.
    ///
    /// A "tick" roughly corresponds to one `poll` invocation on a task. Setting
    /// the interval to a smaller value increases fairness towards newly
    /// submitted tasks, at the cost of more synchronization overhead.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    /// Creates the configured `Dispatcher`, spawning its threads.
    pub fn try_build(self) -> Result<Dispatcher> {
        let cfg = DispatcherConfig::try_from(self)?;

        match cfg.kind {
            Kind::Pooled => Dispatcher::try_new_pooled(cfg),
            Kind::Pinned => Dispatcher::try_new_pinned(cfg),
            Kind::Unconfined => Ok(Dispatcher::unconfined()),
        }
    }
}

// Validated builder, consumed by each dispatcher flavor.
#[derive(Debug, Clone)]
pub(crate) struct DispatcherConfig {
    pub(crate) kind: Kind,
    pub(crate) name: String,
    pub(crate) pool_size: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) global_queue_interval: u32,
    pub(crate) max_steal_retries: usize,
}

impl DispatcherConfig {
    pub(crate) fn thread_builder(&self) -> thread::Builder {
        let builder = thread::Builder::new().name(self.thread_name.0());

        match self.thread_stack_size {
            Some(stack_size) => builder.stack_size(stack_size),
            None => builder,
        }
    }
}

impl TryFrom<Builder> for DispatcherConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        if builder.pool_size.is_some() && builder.kind != Kind::Pooled {
            return Err(anyhow!(
                "pool_size is only supported by pooled dispatchers, got {:?}",
                builder.kind
            ));
        }

        let pool_size = match builder.kind {
            Kind::Pooled => match builder.pool_size {
                Some(n) => n,
                None => thread::available_parallelism()?.get(),
            },
            Kind::Pinned => 1,
            Kind::Unconfined => 0,
        };

        let name = match (builder.kind, builder.name) {
            (_, Some(name)) => name,
            (Kind::Pooled, None) => DEFAULT_POOL_NAME.to_string(),
            (Kind::Pinned, None) => return Err(anyhow!("pinned dispatchers must be named")),
            (Kind::Unconfined, None) => "unconfined".to_string(),
        };

        let thread_name = builder.thread_name.unwrap_or_else(|| match builder.kind {
            Kind::Pooled => default_thread_name_fn(&name),
            Kind::Pinned | Kind::Unconfined => fixed_thread_name_fn(name.clone()),
        });

        Ok(DispatcherConfig {
            kind: builder.kind,
            name,
            pool_size,
            thread_name,
            thread_stack_size: builder.thread_stack_size,
            global_queue_interval: builder.global_queue_interval,
            max_steal_retries: builder.max_steal_retries,
        })
    }
}
