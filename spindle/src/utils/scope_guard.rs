use std::marker::PhantomData;

/// Runs a closure when it goes out of scope, unless disarmed.
///
/// Used wherever a suspension point must leave shared state consistent even
/// if the enclosing future is dropped half-way, or the closure it guards
/// panics.
pub(crate) struct ScopeGuard<'a, F: FnOnce()> {
    // Taken on drop or disarm so the closure runs at most once.
    closure: Option<F>,

    _p: PhantomData<&'a ()>,
}

impl<'a, F: FnOnce()> ScopeGuard<'a, F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
            _p: PhantomData,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<'_, F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::panic;

    #[test]
    fn test_runs_on_drop_unless_disarmed() {
        let fired = Cell::new(0);

        {
            let _guard = ScopeGuard::new(|| fired.set(fired.get() + 1));
        }
        assert_eq!(fired.get(), 1);

        {
            let mut guard = ScopeGuard::new(|| fired.set(fired.get() + 1));
            guard.disarm();
        }
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_runs_on_unwind() {
        let fired = Cell::new(false);

        let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let _guard = ScopeGuard::new(|| fired.set(true));
            panic!("boom");
        }));

        assert!(res.is_err());
        assert!(fired.get());
    }
}
