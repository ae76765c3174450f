/// Runs a closure when dropped, on return and on unwind alike.
pub(crate) struct ScopeGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(on_exit: F) -> Self {
        Self(Some(on_exit))
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(on_exit) = self.0.take() {
            on_exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn test_runs_on_drop() {
        let depth = Cell::new(3);
        {
            let _restore = ScopeGuard::new(|| depth.set(0));
            depth.set(4);
        }
        assert_eq!(depth.get(), 0);
    }

    #[test]
    fn test_runs_on_unwind() {
        let depth = Cell::new(1);
        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            let _restore = ScopeGuard::new(|| depth.set(0));
            panic!("handler panicked");
        }));

        assert!(res.is_err());
        assert_eq!(depth.get(), 0);
    }
}
