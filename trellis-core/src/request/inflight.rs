//! In-Flight Fetch Registry
//!
//! Every path handed to a data source is registered here until the
//! response has been merged. A later request whose optimized path is the
//! same path, or lies below it, waits on the existing fetch instead of
//! issuing another one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use serde_json::Value;

use crate::model::PinGuard;
use crate::path::{Path, PathSet};

/// Unique identifier for one data source round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchId(u64);

impl FetchId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch#{}", self.0)
    }
}

/// A data source response after it has been merged into the cache.
///
/// The leaves it merged stay pinned until every clone has been dropped,
/// so waiters can re-resolve through them before a collection pass runs.
#[derive(Debug, Clone)]
pub struct Merged {
    /// Generation stamped on the merged leaves.
    pub generation: u64,
    /// Paths the source claimed to answer.
    pub paths: Vec<PathSet>,
    pins: Option<Arc<PinGuard>>,
}

impl Merged {
    pub fn new(generation: u64, paths: Vec<PathSet>) -> Self {
        Self {
            generation,
            paths,
            pins: None,
        }
    }

    pub(crate) fn pinning(mut self, pins: PinGuard) -> Self {
        self.pins = Some(Arc::new(pins));
        self
    }
}

impl PartialEq for Merged {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation && self.paths == other.paths
    }
}

/// Either the merged response or the data source's error payload.
pub type Outcome = Result<Merged, Value>;

/// Handle every waiter on one fetch can clone and await.
pub type FetchHandle = Shared<BoxFuture<'static, Outcome>>;

/// Fetches currently outstanding for one cache root.
#[derive(Default)]
pub struct InFlight {
    fetches: DashMap<Path, (FetchId, FetchHandle)>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the fetch answering `paths`.
    pub fn register(&self, paths: &[Path], handle: &FetchHandle) -> FetchId {
        let id = FetchId::next();
        for path in paths {
            self.fetches.insert(path.clone(), (id, handle.clone()));
        }
        id
    }

    /// The outstanding fetch that will answer `path`, if any.
    pub fn covering(&self, path: &Path) -> Option<FetchHandle> {
        (1..=path.len()).find_map(|depth| {
            self.fetches
                .get(&Path::from(&path[..depth]))
                .map(|entry| entry.value().1.clone())
        })
    }

    /// Forget the paths registered by fetch `id`. Paths re-registered by a
    /// newer fetch in the meantime are left alone.
    pub fn release(&self, paths: &[Path], id: FetchId) {
        for path in paths {
            self.fetches.remove_if(path, |_, (owner, _)| *owner == id);
        }
    }

    pub fn len(&self) -> usize {
        self.fetches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetches.is_empty()
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("paths", &self.fetches.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use futures_util::FutureExt;

    fn ready(generation: u64) -> FetchHandle {
        async move { Ok(Merged::new(generation, Vec::new())) }
        .boxed()
        .shared()
    }

    #[tokio::test]
    async fn covers_descendants_of_registered_paths() {
        let inflight = InFlight::new();
        let handle = ready(3);
        let id = inflight.register(&[path!["users", 0]], &handle);

        assert!(inflight.covering(&path!["users", 0, "name"]).is_some());
        assert!(inflight.covering(&path!["users", 0]).is_some());
        assert!(inflight.covering(&path!["users"]).is_none());
        assert!(inflight.covering(&path!["users", 1]).is_none());

        let waited = inflight.covering(&path!["users", 0]).unwrap().await;
        assert_eq!(waited.unwrap().generation, 3);

        inflight.release(&[path!["users", 0]], id);
        assert!(inflight.is_empty());
    }

    #[test]
    fn release_leaves_newer_registrations() {
        let inflight = InFlight::new();
        let old = inflight.register(&[path!["a"]], &ready(1));
        inflight.register(&[path!["a"]], &ready(2));

        inflight.release(&[path!["a"]], old);
        assert_eq!(inflight.len(), 1);
    }
}
