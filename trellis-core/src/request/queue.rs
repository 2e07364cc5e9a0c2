//! Request Queue
//!
//! The queue collects cache misses, writes and calls into batching windows
//! and turns each window into as few data source round trips as it can.
//!
//! # Flush
//!
//! When a window closes:
//!
//! 1. Every queued get path is resolved again. Paths answered in the
//!    meantime need no fetch at all.
//! 2. Paths already covered by an in-flight fetch join that fetch.
//! 3. Everything left is collapsed into path sets and sent as a single
//!    `get` per (root, data source) pair.
//! 4. Queued writes to the same pair are folded into one `set`.
//! 5. Calls are never merged; each goes out on its own.
//!
//! Responses are merged into the cache by the task that received them, in
//! the order they arrive. Waiters are only told about a fetch after the
//! merge, so by the time they resolve again the data is there. The merged
//! leaves stay pinned until the last waiter lets go of the outcome.
//!
//! # Closing a window
//!
//! With the immediate policy there is no timer. Every request hands back a
//! [`Ticket`], and the first ticket of a window to be polled or dropped
//! flushes that window on the caller's own task. Everything a caller
//! enqueues before it first awaits therefore shares one window, whatever
//! the runtime flavor. Delayed and custom policies close the window from
//! their [`Scheduler`] instead.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::inflight::{FetchHandle, FetchId, Merged, Outcome};
use super::scheduler::Scheduler;
use super::source::{CallRequest, DataSource, JsonGraphEnvelope, SourceError};
use crate::error::{Error, Result};
use crate::graph::{self, Branch, Node, Resolution, ResolveOptions};
use crate::model::{PinGuard, Root};
use crate::path::{collapse, Path, PathSet};

/// A queued path and the fetch that will answer it.
///
/// `fetch` is `None` when the cache could already answer the path at
/// flush time, one way or another.
#[derive(Clone)]
pub struct Pending {
    pub path: Path,
    pub fetch: Option<FetchHandle>,
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("path", &self.path)
            .field("fetching", &self.fetch.is_some())
            .finish()
    }
}

struct GetWaiter {
    paths: Vec<Path>,
    reply: oneshot::Sender<Vec<Pending>>,
}

struct GetGroup {
    root: Arc<Root>,
    source: Arc<dyn DataSource>,
    paths: IndexSet<Path>,
    waiters: Vec<GetWaiter>,
}

struct SetGroup {
    root: Arc<Root>,
    source: Arc<dyn DataSource>,
    fragment: Branch,
    paths: Vec<PathSet>,
    replies: Vec<oneshot::Sender<Outcome>>,
}

struct CallJob {
    root: Arc<Root>,
    source: Arc<dyn DataSource>,
    call: CallRequest,
    reply: oneshot::Sender<Outcome>,
}

/// Everything enqueued since the last flush.
#[derive(Default)]
struct Window {
    /// Number of windows flushed before this one.
    epoch: u64,
    scheduled: bool,
    runtime: Option<Handle>,
    gets: Vec<GetGroup>,
    sets: Vec<SetGroup>,
    calls: Vec<CallJob>,
}

fn same_target(
    root: &Arc<Root>,
    source: &Arc<dyn DataSource>,
    other_root: &Arc<Root>,
    other_source: &Arc<dyn DataSource>,
) -> bool {
    Arc::ptr_eq(root, other_root)
        && Arc::as_ptr(source) as *const () == Arc::as_ptr(other_source) as *const ()
}

#[derive(Clone)]
enum Policy {
    /// Flush when the first ticket of the window is polled or dropped.
    OnAwait,
    Scheduled(Arc<dyn Scheduler>),
}

/// Receiving end of a queued request.
///
/// Under the immediate policy the ticket also closes its window: the
/// first poll, or dropping it unpolled, flushes the window it was issued
/// in. Tickets from a window that has already been flushed just wait for
/// their reply.
#[must_use = "an unpolled ticket flushes its window only when dropped"]
pub(crate) struct Ticket<T> {
    window: Option<Arc<Mutex<Window>>>,
    epoch: u64,
    reply: oneshot::Receiver<T>,
}

impl<T> std::fmt::Debug for Ticket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl<T> Ticket<T> {
    fn close_window(&mut self) {
        if let Some(window) = self.window.take() {
            flush(&window, self.epoch);
        }
    }
}

impl<T> Future for Ticket<T> {
    type Output = std::result::Result<T, oneshot::error::RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.close_window();
        Pin::new(&mut this.reply).poll(cx)
    }
}

impl<T> Drop for Ticket<T> {
    fn drop(&mut self) {
        self.close_window();
    }
}

/// Batches requests and dispatches them to data sources.
///
/// Clones share the same window. Models derived with a different batching
/// policy get a queue of their own.
#[derive(Clone)]
pub struct RequestQueue {
    policy: Policy,
    window: Arc<Mutex<Window>>,
}

impl RequestQueue {
    /// A queue whose windows are closed by `scheduler`.
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_policy(Policy::Scheduled(scheduler))
    }

    /// A queue that flushes as soon as one of a window's requests is
    /// awaited, on the awaiting task.
    pub fn immediate() -> Self {
        Self::with_policy(Policy::OnAwait)
    }

    fn with_policy(policy: Policy) -> Self {
        Self {
            policy,
            window: Arc::new(Mutex::new(Window::default())),
        }
    }

    /// The scheduler closing this queue's windows; `None` for the
    /// immediate policy.
    pub fn scheduler(&self) -> Option<&Arc<dyn Scheduler>> {
        match &self.policy {
            Policy::OnAwait => None,
            Policy::Scheduled(scheduler) => Some(scheduler),
        }
    }

    /// Queue `paths` for fetching. The receiver gets one [`Pending`] per
    /// path, in order, once the window has been flushed.
    pub(crate) fn get(
        &self,
        root: &Arc<Root>,
        source: &Arc<dyn DataSource>,
        paths: Vec<Path>,
    ) -> Result<Ticket<Vec<Pending>>> {
        let runtime = current_runtime()?;
        let (reply, receiver) = oneshot::channel();
        Ok(self.enqueue(runtime, receiver, |window| {
            let index = match window
                .gets
                .iter()
                .position(|group| same_target(&group.root, &group.source, root, source))
            {
                Some(index) => index,
                None => {
                    window.gets.push(GetGroup {
                        root: root.clone(),
                        source: source.clone(),
                        paths: IndexSet::new(),
                        waiters: Vec::new(),
                    });
                    window.gets.len() - 1
                }
            };
            let group = &mut window.gets[index];
            group.paths.extend(paths.iter().cloned());
            group.waiters.push(GetWaiter { paths, reply });
        }))
    }

    /// Queue a write of `fragment` covering `paths`.
    pub(crate) fn set(
        &self,
        root: &Arc<Root>,
        source: &Arc<dyn DataSource>,
        fragment: Branch,
        paths: Vec<PathSet>,
    ) -> Result<Ticket<Outcome>> {
        let runtime = current_runtime()?;
        let (reply, receiver) = oneshot::channel();
        Ok(self.enqueue(runtime, receiver, |window| {
            match window
                .sets
                .iter_mut()
                .find(|group| same_target(&group.root, &group.source, root, source))
            {
                Some(group) => {
                    group.fragment.absorb(fragment);
                    group.paths.extend(paths);
                    group.replies.push(reply);
                }
                None => window.sets.push(SetGroup {
                    root: root.clone(),
                    source: source.clone(),
                    fragment,
                    paths,
                    replies: vec![reply],
                }),
            }
        }))
    }

    /// Queue a remote call.
    pub(crate) fn call(
        &self,
        root: &Arc<Root>,
        source: &Arc<dyn DataSource>,
        call: CallRequest,
    ) -> Result<Ticket<Outcome>> {
        let runtime = current_runtime()?;
        let (reply, receiver) = oneshot::channel();
        Ok(self.enqueue(runtime, receiver, |window| {
            window.calls.push(CallJob {
                root: root.clone(),
                source: source.clone(),
                call,
                reply,
            });
        }))
    }

    fn enqueue<T>(
        &self,
        runtime: Handle,
        reply: oneshot::Receiver<T>,
        add: impl FnOnce(&mut Window),
    ) -> Ticket<T> {
        let (first, epoch) = {
            let mut window = self.window.lock();
            window.runtime.get_or_insert(runtime);
            add(&mut window);
            (!std::mem::replace(&mut window.scheduled, true), window.epoch)
        };
        match &self.policy {
            Policy::OnAwait => Ticket {
                window: Some(self.window.clone()),
                epoch,
                reply,
            },
            Policy::Scheduled(scheduler) => {
                if first {
                    let window = self.window.clone();
                    scheduler.schedule(Box::new(move || flush(&window, epoch)));
                }
                Ticket {
                    window: None,
                    epoch,
                    reply,
                }
            }
        }
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::immediate()
    }
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RequestQueue");
        match &self.policy {
            Policy::OnAwait => debug.field("policy", &"immediate"),
            Policy::Scheduled(scheduler) => debug.field("policy", scheduler),
        };
        debug.finish()
    }
}

fn current_runtime() -> Result<Handle> {
    Handle::try_current().map_err(|_| {
        Error::Configuration("asynchronous requests need a running Tokio runtime".into())
    })
}

/// Take window `epoch` and dispatch everything in it. Does nothing when
/// that window has already been flushed.
fn flush(state: &Mutex<Window>, epoch: u64) {
    let window = {
        let mut state = state.lock();
        if state.epoch != epoch {
            return;
        }
        let taken = std::mem::take(&mut *state);
        state.epoch = epoch + 1;
        taken
    };
    let Some(runtime) = window.runtime else {
        return;
    };
    debug!(
        gets = window.gets.len(),
        sets = window.sets.len(),
        calls = window.calls.len(),
        "flushing request window"
    );

    for group in window.gets {
        flush_gets(&runtime, group);
    }
    for group in window.sets {
        dispatch_set(&runtime, group);
    }
    for job in window.calls {
        dispatch_call(&runtime, job);
    }
}

fn flush_gets(runtime: &Handle, group: GetGroup) {
    let GetGroup {
        root,
        source,
        paths,
        waiters,
    } = group;

    let mut handles: HashMap<Path, Option<FetchHandle>> = HashMap::with_capacity(paths.len());
    let mut unfetched = Vec::new();
    let mut to_fetch = IndexSet::new();
    {
        let mut cache = root.cache.lock();
        let opts = ResolveOptions::default();
        for path in paths {
            match graph::resolve(&mut cache, &path, &opts) {
                Ok(Resolution::Missing { optimized, .. }) => {
                    if let Some(handle) = root.inflight.covering(&optimized) {
                        trace!(%optimized, "joining in-flight fetch");
                        handles.insert(path, Some(handle));
                    } else {
                        to_fetch.insert(optimized);
                        unfetched.push(path);
                    }
                }
                _ => {
                    handles.insert(path, None);
                }
            }
        }
    }

    if !to_fetch.is_empty() {
        let handle = dispatch_get(runtime, root, source, to_fetch.into_iter().collect());
        for path in unfetched {
            handles.insert(path, Some(handle.clone()));
        }
    }

    for waiter in waiters {
        let pending = waiter
            .paths
            .into_iter()
            .map(|path| {
                let fetch = handles.get(&path).cloned().flatten();
                Pending { path, fetch }
            })
            .collect();
        if waiter.reply.send(pending).is_err() {
            trace!("waiter dropped before its window flushed");
        }
    }
}

fn dispatch_get(
    runtime: &Handle,
    root: Arc<Root>,
    source: Arc<dyn DataSource>,
    paths: Vec<Path>,
) -> FetchHandle {
    let (done, outcome) = oneshot::channel::<Outcome>();
    let handle: FetchHandle = async move {
        outcome
            .await
            .unwrap_or_else(|_| Err(Value::from("fetch ended without a response")))
    }
    .boxed()
    .shared();

    let id = root.inflight.register(&paths, &handle);
    let request = collapse(paths.iter().cloned());
    debug!(%id, paths = paths.len(), sets = request.len(), "dispatching get");

    runtime.spawn(async move {
        let result = contain_panics("get", source.get(request)).await;
        let outcome = settle(&root, id, "get", result);
        root.inflight.release(&paths, id);
        let _ = done.send(outcome);
    });
    handle
}

fn dispatch_set(runtime: &Handle, group: SetGroup) {
    let SetGroup {
        root,
        source,
        fragment,
        paths,
        replies,
    } = group;
    let id = FetchId::next();
    debug!(%id, paths = paths.len(), waiters = replies.len(), "dispatching set");

    runtime.spawn(async move {
        let envelope = JsonGraphEnvelope::new(Node::Branch(fragment), paths);
        let result = contain_panics("set", source.set(envelope)).await;
        let outcome = settle(&root, id, "set", result);
        for reply in replies {
            let _ = reply.send(outcome.clone());
        }
    });
}

fn dispatch_call(runtime: &Handle, job: CallJob) {
    let CallJob {
        root,
        source,
        call,
        reply,
    } = job;
    let id = FetchId::next();
    debug!(%id, path = %call.path, "dispatching call");

    runtime.spawn(async move {
        let result = contain_panics("call", source.call(call)).await;
        let _ = reply.send(settle(&root, id, "call", result));
    });
}

/// A data source that panics fails its request like any other error.
async fn contain_panics<F>(
    op: &'static str,
    request: F,
) -> std::result::Result<JsonGraphEnvelope, SourceError>
where
    F: Future<Output = std::result::Result<JsonGraphEnvelope, SourceError>>,
{
    match AssertUnwindSafe(request).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(SourceError::from(format!("data source panicked during {op}"))),
    }
}

fn settle(
    root: &Arc<Root>,
    id: FetchId,
    op: &'static str,
    result: std::result::Result<JsonGraphEnvelope, SourceError>,
) -> Outcome {
    match result {
        Ok(envelope) => Ok(commit(root, envelope)),
        Err(err) => {
            warn!(%id, op, error = %err, "data source request failed");
            Err(err.into_value())
        }
    }
}

/// Merge a data source response into the cache and apply its
/// invalidations. The merged leaves stay pinned for as long as the
/// returned [`Merged`] (or a clone of it) is alive.
fn commit(root: &Arc<Root>, envelope: JsonGraphEnvelope) -> Merged {
    let JsonGraphEnvelope {
        json_graph,
        paths,
        invalidated,
    } = envelope;

    let mut cache = root.cache.lock();
    let (generation, pinned) = cache.merge_pinned(&json_graph);
    if !invalidated.is_empty() {
        let now = graph::now_ms();
        for path in invalidated
            .iter()
            .flat_map(|set| set.expand().unwrap_or_default())
        {
            if let Ok(real) = graph::optimize(&mut cache, &path, now) {
                cache.remove(&real);
            }
        }
    }
    trace!(generation, size = cache.size(), pinned = pinned.len(), "merged response");
    drop(cache);
    Merged::new(generation, paths).pinning(PinGuard::adopt(root.clone(), pinned))
}
