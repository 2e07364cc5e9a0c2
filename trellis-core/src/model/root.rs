//! Model Root
//!
//! Shared state behind every model derived from the same constructor call:
//! the graph cache, the fetches outstanding against it and the unsafe-mode
//! switch. [`PinGuard`] is how callers keep paths resident in that cache
//! while they still need them; when the last pin on a path goes away the
//! cache is trimmed back to its collection target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::graph::GraphCache;
use crate::path::Path;
use crate::request::InFlight;

/// The cache, its in-flight fetches and the unsafe-mode switch.
///
/// Models hold this behind an `Arc`; deriving a model never copies it.
#[derive(Debug)]
pub struct Root {
    pub(crate) cache: Mutex<GraphCache>,
    pub(crate) inflight: InFlight,
    unsafe_mode: AtomicBool,
}

impl Root {
    pub fn new(cache: GraphCache, unsafe_mode: bool) -> Self {
        Self {
            cache: Mutex::new(cache),
            inflight: InFlight::new(),
            unsafe_mode: AtomicBool::new(unsafe_mode),
        }
    }

    /// Whether synchronous accessors skip the request-context check.
    pub fn unsafe_mode(&self) -> bool {
        self.unsafe_mode.load(Ordering::Relaxed)
    }

    pub fn set_unsafe_mode(&self, enabled: bool) {
        self.unsafe_mode.store(enabled, Ordering::Relaxed);
    }

    /// Address used to match sync permits to this root.
    pub(crate) fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// Keeps a set of paths pinned against eviction until dropped.
#[derive(Debug)]
pub(crate) struct PinGuard {
    root: Arc<Root>,
    paths: Vec<Path>,
}

impl PinGuard {
    pub(crate) fn new(root: Arc<Root>, paths: Vec<Path>) -> Self {
        {
            let mut cache = root.cache.lock();
            for path in &paths {
                cache.pin(path);
            }
        }
        Self { root, paths }
    }

    /// Take ownership of pins the cache already holds on `paths`.
    pub(crate) fn adopt(root: Arc<Root>, paths: Vec<Path>) -> Self {
        Self { root, paths }
    }

    /// Pin more paths for the lifetime of this guard.
    pub(crate) fn extend(&mut self, paths: impl IntoIterator<Item = Path>) {
        let mut cache = self.root.cache.lock();
        for path in paths {
            cache.pin(&path);
            self.paths.push(path);
        }
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut cache = self.root.cache.lock();
        for path in &self.paths {
            cache.unpin(path);
        }
        if !self.paths.is_empty() {
            cache.evict_to_target();
        }
    }
}
