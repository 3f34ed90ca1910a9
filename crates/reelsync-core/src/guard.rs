//! Remote-guard: keeps a tool from echoing a remote change back out.
//!
//! A sync tool applies remote changes through the model's normal mutation API,
//! which raises the same local events a user edit would. Wrapping the mutation
//! in [`RemoteGuard::run_remote`] and the local handler in
//! [`RemoteGuard::run_local`] turns those events into no-ops.
//!
//! Guards nest: a child guard also reports active while any ancestor is, which
//! is how a session-wide loading gate silences every tool at once.

use std::cell::Cell;
use std::rc::Rc;

#[derive(Debug, Clone, Default)]
pub struct RemoteGuard {
    depth: Rc<Cell<u32>>,
    ancestors: Vec<Rc<Cell<u32>>>,
}

impl RemoteGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A guard that is also active whenever `self` is.
    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.depth.clone());
        Self {
            depth: Rc::new(Cell::new(0)),
            ancestors,
        }
    }

    pub fn is_applying_remote(&self) -> bool {
        self.depth.get() > 0 || self.ancestors.iter().any(|depth| depth.get() > 0)
    }

    /// Activate the guard until the returned scope is dropped.
    pub fn enter(&self) -> RemoteScope {
        self.depth.set(self.depth.get() + 1);
        RemoteScope {
            depth: self.depth.clone(),
        }
    }

    /// Run a local-event handler unless a remote change is being applied.
    pub fn run_local<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self.is_applying_remote() {
            None
        } else {
            Some(f())
        }
    }

    /// Apply a remote change with the guard held; released even on unwind.
    pub fn run_remote<R>(&self, f: impl FnOnce() -> R) -> R {
        let _scope = self.enter();
        f()
    }
}

/// Keeps a [`RemoteGuard`] active while alive.
#[must_use = "the guard is released as soon as the scope is dropped"]
#[derive(Debug)]
pub struct RemoteScope {
    depth: Rc<Cell<u32>>,
}

impl Drop for RemoteScope {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_work_is_skipped_while_remote() {
        let guard = RemoteGuard::new();
        assert_eq!(guard.run_local(|| 1), Some(1));
        let inner = guard.run_remote(|| guard.run_local(|| 2));
        assert_eq!(inner, None);
        assert!(!guard.is_applying_remote());
    }

    #[test]
    fn nested_remote_scopes_release_in_order() {
        let guard = RemoteGuard::new();
        let outer = guard.enter();
        guard.run_remote(|| assert!(guard.is_applying_remote()));
        assert!(guard.is_applying_remote());
        drop(outer);
        assert!(!guard.is_applying_remote());
    }

    #[test]
    fn child_follows_ancestors() {
        let session = RemoteGuard::new();
        let tool = session.child();
        let nested = tool.child();
        {
            let _loading = session.enter();
            assert!(tool.is_applying_remote());
            assert!(nested.is_applying_remote());
        }
        let _own = tool.enter();
        assert!(!session.is_applying_remote());
        assert!(nested.is_applying_remote());
    }

    #[test]
    fn released_after_panic() {
        let guard = RemoteGuard::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            guard.run_remote(|| {
                let failed = true;
                if failed {
                    panic!("mutation failed");
                }
            });
        }));
        assert!(result.is_err());
        assert!(!guard.is_applying_remote());
    }
}
