use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, num::NonZeroU64};

/// An opaque ID that uniquely identifies a task relative to all other tasks
/// launched by the process.
///
/// IDs are handed out from a monotonic counter, so a child launched later than
/// its sibling always has a greater ID. The task tree relies on this to keep
/// children in insertion order.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(pub(crate) NonZeroU64);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Id {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Safety: this number is unimaginably large, even if the runtime was
        // creating 1 billion task/sec, it would take 584 years to wrap around.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_new_task_id_unique_and_increasing() {
        let n = 13;
        let ids = (0..n).map(|_| Id::next()).collect::<Vec<_>>();

        let unique = ids.iter().collect::<HashSet<_>>();
        assert_eq!(unique.len(), n);

        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
