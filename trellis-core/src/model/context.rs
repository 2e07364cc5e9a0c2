//! Sync Permits
//!
//! Synchronous accessors read the cache as it is right now. That is only
//! meaningful while a request selector is running, when the data it asked
//! for is known to be present. A [`SyncPermit`] marks such a window.
//!
//! # Implementation
//!
//! Each thread keeps a stack of the roots it currently holds permits for.
//! Entering pushes, dropping the guard pops, so windows nest and unwind
//! correctly even on panic. Permits are scoped to a root: holding one for
//! one model family grants nothing to another.

use std::cell::RefCell;
use std::marker::PhantomData;

use super::Model;

thread_local! {
    static PERMITS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Guard that grants synchronous cache access until dropped.
///
/// Permits are tied to the thread that entered them and cannot be sent
/// elsewhere.
#[derive(Debug)]
pub struct SyncPermit {
    root: usize,
    _thread_bound: PhantomData<*const ()>,
}

impl SyncPermit {
    /// Grant synchronous access to `model` and every model sharing its
    /// cache.
    pub fn enter(model: &Model) -> Self {
        Self::for_root(model.root.id())
    }

    pub(crate) fn for_root(root: usize) -> Self {
        PERMITS.with(|stack| stack.borrow_mut().push(root));
        Self {
            root,
            _thread_bound: PhantomData,
        }
    }

    /// Whether this thread holds any permit at all.
    pub fn is_active() -> bool {
        PERMITS.with(|stack| !stack.borrow().is_empty())
    }

    pub(crate) fn is_granted(root: usize) -> bool {
        PERMITS.with(|stack| stack.borrow().contains(&root))
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        PERMITS.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(
                popped,
                Some(self.root),
                "SyncPermit mismatch: expected {:?}, got {:?}",
                self.root,
                popped
            );
        });
    }
}
