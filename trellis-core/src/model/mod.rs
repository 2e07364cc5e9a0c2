//! Model
//!
//! The model is the public face of the cache. It answers what it can
//! straight from the cache and sends the rest through the request queue.
//!
//! # Overview
//!
//! A [`Model`] is a small, cheaply cloned bundle of configuration:
//!
//! - the shared [`Root`] (cache, in-flight fetches, unsafe-mode switch)
//! - an optional [`DataSource`] and the [`RequestQueue`] that talks to it
//! - an error selector applied to every error payload before delivery
//! - formatting flags (boxed values, progressive delivery)
//! - the path the model is bound to
//!
//! Derivations such as [`Model::batch`] or [`Model::box_values`] return a
//! copy with one field changed. The root is shared through an `Arc`, so
//! every derived model reads and writes the same cache.
//!
//! # Accessors
//!
//! Asynchronous accessors (`get`, `set`, `invalidate`, `call`) return a
//! [`ResultStream`]. Malformed input fails immediately with `Err`; data
//! errors arrive through the stream as a single terminal [`Error::Batch`]
//! after every deliverable value.
//!
//! Synchronous accessors (`get_value_sync`, `set_value_sync`, `bind_sync`)
//! only look at the cache. Unless the root is in unsafe mode they need a
//! [`SyncPermit`] for the model's root.

mod builder;
mod context;
mod options;
mod root;
mod source;
mod stream;

pub use builder::ModelBuilder;
pub use context::SyncPermit;
pub use options::ModelOptions;
pub use root::Root;
pub use source::ModelSource;
pub use stream::{json_tree, ResultStream};

pub(crate) use root::PinGuard;
pub(crate) use stream::Emitter;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, PathFailure, Result};
use crate::graph::{self, Branch, GraphCache, Node, Resolution, ResolveOptions};
use crate::path::{expand_all, Path, PathSet};
use crate::request::{
    CallRequest, DataSource, FixedDelayScheduler, Outcome, Pending, RequestQueue, Scheduler,
    Ticket,
};

/// Upper bound on fetch rounds for one path. Each extra round must make
/// progress through a reference the previous round brought in.
pub const MAX_FETCH_ROUNDS: usize = 8;

/// Maps an error payload, together with the path it was found at, to the
/// payload callers see.
pub type ErrorSelector = Arc<dyn Fn(&Path, Value) -> Value + Send + Sync>;

fn identity_selector() -> ErrorSelector {
    Arc::new(|_, value| value)
}

/// A value delivered for one requested path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    pub path: Path,
    pub value: Value,
}

impl PathValue {
    pub fn new(path: impl Into<Path>, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
        }
    }
}

/// Batching policy for [`Model::batch`].
#[derive(Debug, Clone)]
pub enum Batch {
    /// Flush when the first request of a window is awaited.
    Immediate,
    /// Flush a fixed delay after the first request of a window.
    Delay(Duration),
    /// Flush whenever a custom scheduler says so.
    Scheduler(Arc<dyn Scheduler>),
}

impl Batch {
    fn into_queue(self) -> RequestQueue {
        match self {
            Batch::Immediate => RequestQueue::immediate(),
            Batch::Delay(delay) => RequestQueue::new(Arc::new(FixedDelayScheduler::new(delay))),
            Batch::Scheduler(scheduler) => RequestQueue::new(scheduler),
        }
    }
}

impl From<u64> for Batch {
    fn from(millis: u64) -> Self {
        Batch::Delay(Duration::from_millis(millis))
    }
}

impl From<Duration> for Batch {
    fn from(delay: Duration) -> Self {
        Batch::Delay(delay)
    }
}

impl From<Arc<dyn Scheduler>> for Batch {
    fn from(scheduler: Arc<dyn Scheduler>) -> Self {
        Batch::Scheduler(scheduler)
    }
}

/// How one requested path ended up.
#[derive(Debug, Clone)]
enum Settled {
    Value(PathValue),
    Empty,
    Failed(PathFailure),
}

/// Values in request order, then one batch error if anything failed.
fn results(settled: impl IntoIterator<Item = Settled>) -> Vec<Result<PathValue>> {
    let mut items = Vec::new();
    let mut failures = Vec::new();
    for outcome in settled {
        match outcome {
            Settled::Value(value) => items.push(Ok(value)),
            Settled::Failed(failure) => failures.push(failure),
            Settled::Empty => {}
        }
    }
    if !failures.is_empty() {
        items.push(Err(Error::Batch(failures)));
    }
    items
}

/// Reduce a single-path stream to its value.
async fn single_value(stream: Result<ResultStream<PathValue>>) -> Result<Option<Value>> {
    let (mut values, error) = stream?.settle().await;
    match error {
        Some(Error::Batch(mut failures)) if failures.len() == 1 => Err(failures.remove(0).error),
        Some(error) => Err(error),
        None => Ok(values.pop().map(|delivered| delivered.value)),
    }
}

/// State carried by a get from its synchronous pass into its driver.
struct GetJob {
    requested: Vec<Path>,
    absolute: Vec<Path>,
    settled: Vec<Option<Settled>>,
    missing: Vec<(usize, Path)>,
    receiver: Ticket<Vec<Pending>>,
    source: Arc<dyn DataSource>,
    pins: PinGuard,
}

/// Path-addressable view of a shared JSON Graph cache.
#[derive(Clone)]
pub struct Model {
    root: Arc<Root>,
    source: Option<Arc<dyn DataSource>>,
    queue: RequestQueue,
    error_selector: ErrorSelector,
    boxed: bool,
    progressive: bool,
    path: Path,
}

impl Model {
    pub const EXPIRES_NOW: i64 = graph::EXPIRES_NOW;
    pub const EXPIRES_NEVER: i64 = graph::EXPIRES_NEVER;

    /// An empty, unbounded model without a data source.
    pub fn new() -> Self {
        Self {
            root: Arc::new(Root::new(
                GraphCache::new(graph::DEFAULT_MAX_SIZE, graph::DEFAULT_COLLECT_RATIO),
                true,
            )),
            source: None,
            queue: RequestQueue::immediate(),
            error_selector: identity_selector(),
            boxed: false,
            progressive: false,
            path: Path::new(),
        }
    }

    pub fn builder() -> ModelBuilder {
        ModelBuilder::new()
    }

    // ---- asynchronous accessors ----

    /// Request every path in `paths`.
    pub fn get(&self, paths: Vec<PathSet>) -> Result<ResultStream<PathValue>> {
        let requested = expand_all(&paths)?;
        self.get_paths(requested)
    }

    /// Request `paths` and hand the delivered values to `selector`, which
    /// runs with a sync permit for this model's root.
    pub fn get_with<T, F>(&self, paths: Vec<PathSet>, selector: F) -> Result<ResultStream<T>>
    where
        T: Send + 'static,
        F: FnOnce(&[PathValue]) -> T + Send + 'static,
    {
        let inner = self.get(paths)?;
        let root = self.root.clone();
        Ok(ResultStream::new(move |emit| async move {
            let (values, error) = inner.settle().await;
            let selected = {
                let _permit = SyncPermit::for_root(root.id());
                selector(&values)
            };
            emit.next(selected);
            if let Some(error) = error {
                emit.error(error);
            }
        }))
    }

    /// Request a single path and resolve to its value.
    pub fn get_value(
        &self,
        path: impl Into<Path>,
    ) -> impl Future<Output = Result<Option<Value>>> + Send + 'static {
        single_value(self.get(vec![PathSet::from(path.into())]))
    }

    /// Write `values` into the cache, following references, and forward
    /// them to the data source if there is one.
    pub fn set(&self, values: Vec<PathValue>) -> Result<ResultStream<PathValue>> {
        let now = graph::now_ms();
        let mut requested = Vec::with_capacity(values.len());
        let mut absolute = Vec::with_capacity(values.len());
        let mut nodes = Vec::with_capacity(values.len());
        for PathValue { path, value } in &values {
            nodes.push(Node::from_json(value, now)?);
            absolute.push(self.absolute(path));
            requested.push(path.clone());
        }

        let (generation, written) = {
            let mut cache = self.root.cache.lock();
            let written = absolute
                .iter()
                .map(|path| graph::optimize(&mut cache, path, now))
                .collect::<Result<Vec<_>>>()?;
            let generation = cache.next_generation();
            for (real, node) in written.iter().zip(&nodes) {
                cache.set(real, node.clone())?;
            }
            (generation, written)
        };

        let Some(source) = self.source.clone() else {
            let resolutions = self.resolve_many(&absolute, &[generation]);
            return Ok(ResultStream::ready(self.settle_all(&requested, resolutions)));
        };

        let mut fragment = Branch::new();
        for (real, node) in written.iter().zip(nodes) {
            place(&mut fragment, real, node);
        }
        let paths = written.iter().map(PathSet::from).collect();
        let receiver = self.queue.set(&self.root, &source, fragment, paths)?;
        let pins = PinGuard::new(self.root.clone(), written);
        let model = self.clone();

        Ok(ResultStream::new(move |emit| async move {
            let _pins = pins;
            let outcome = receiver
                .await
                .unwrap_or_else(|_| Err(Value::from("set ended without a response")));
            let merged = match outcome {
                Ok(merged) => merged,
                Err(payload) => {
                    emit.error(model.source_failures(&requested, &absolute, payload));
                    return;
                }
            };
            let resolutions = model.resolve_many(&absolute, &[generation, merged.generation]);
            for item in model.settle_all(&requested, resolutions) {
                emit.send(item);
            }
        }))
    }

    /// Write a single value and resolve to what the cache holds afterwards.
    pub fn set_value(
        &self,
        path: impl Into<Path>,
        value: impl Into<Value>,
    ) -> impl Future<Output = Result<Option<Value>>> + Send + 'static {
        single_value(self.set(vec![PathValue::new(path, value)]))
    }

    /// Drop the nodes at `paths` from the cache. References along each
    /// path are followed; the node at the end is removed, not its target.
    pub fn invalidate(&self, paths: Vec<PathSet>) -> Result<ResultStream<PathValue>> {
        let targets = expand_all(&paths)?;
        let now = graph::now_ms();
        let mut cache = self.root.cache.lock();
        for path in &targets {
            let absolute = self.absolute(path);
            match graph::optimize(&mut cache, &absolute, now) {
                Ok(real) => {
                    cache.remove(&real);
                }
                Err(err) => trace!(path = %absolute, %err, "nothing to invalidate"),
            }
        }
        Ok(ResultStream::empty())
    }

    /// Invoke the remote function at `path` and deliver the values of the
    /// paths its response names.
    pub fn call(
        &self,
        path: impl Into<Path>,
        args: Vec<Value>,
        ref_paths: Vec<PathSet>,
        this_paths: Vec<PathSet>,
    ) -> Result<ResultStream<PathValue>> {
        let Some(source) = self.source.clone() else {
            return Err(Error::Configuration(
                "Model#call requires a data source".into(),
            ));
        };
        let absolute = self.absolute(&path.into());
        let request = CallRequest {
            path: absolute.clone(),
            args,
            ref_paths,
            this_paths,
        };
        let receiver = self.queue.call(&self.root, &source, request)?;
        let model = self.clone();

        Ok(ResultStream::new(move |emit| async move {
            let outcome = receiver
                .await
                .unwrap_or_else(|_| Err(Value::from("call ended without a response")));
            let merged = match outcome {
                Ok(merged) => merged,
                Err(payload) => {
                    emit.error(Error::Source {
                        value: model.select(&absolute, payload),
                        path: absolute,
                    });
                    return;
                }
            };
            let returned = match expand_all(&merged.paths) {
                Ok(returned) => returned,
                Err(err) => {
                    emit.error(err.into());
                    return;
                }
            };
            let relative: Vec<Path> = returned.iter().map(|path| model.relative(path)).collect();
            let resolutions = model.resolve_many(&returned, &[merged.generation]);
            for item in model.settle_all(&relative, resolutions) {
                emit.send(item);
            }
        }))
    }

    // ---- synchronous accessors ----

    /// Read `path` from the cache as it is now.
    pub fn get_value_sync(&self, path: impl Into<Path>) -> Result<Option<Value>> {
        self.check_sync("getValueSync")?;
        let absolute = self.absolute(&path.into());
        let resolution = self.resolve_one(&absolute)?;
        self.sync_value(resolution)
    }

    /// Write `value` at `path` and read it back.
    ///
    /// Models with a data source must use [`Model::set`] instead, or derive
    /// a model with [`Model::without_data_source`] first.
    pub fn set_value_sync(
        &self,
        path: impl Into<Path>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>> {
        if self.source.is_some() {
            return Err(Error::Configuration(
                "Model#setValueSync can not be invoked on a model with a data source; \
                 use set, or without_data_source first"
                    .into(),
            ));
        }
        self.check_sync("setValueSync")?;

        let absolute = self.absolute(&path.into());
        let now = graph::now_ms();
        let node = Node::from_json(&value.into(), now)?;
        let resolution = {
            let mut cache = self.root.cache.lock();
            let real = graph::optimize(&mut cache, &absolute, now)?;
            let fresh = [cache.next_generation()];
            cache.set(&real, node)?;
            let opts = ResolveOptions {
                now,
                fresh: &fresh,
                ..ResolveOptions::default()
            };
            graph::resolve(&mut cache, &absolute, &opts)?
        };
        self.sync_value(resolution)
    }

    /// A model bound to the real location of `path`, if the cache can
    /// resolve it right now.
    pub fn bind_sync(&self, path: impl Into<Path>) -> Result<Option<Model>> {
        self.check_sync("bindSync")?;
        let absolute = self.absolute(&path.into());
        match self.resolve_one(&absolute)? {
            Resolution::Found { path, .. } => Ok(Some(self.with_path(path))),
            Resolution::Error { path, value } => Err(Error::Graph {
                value: self.select(&path, value),
                path,
            }),
            Resolution::Short { .. } | Resolution::Missing { .. } => Ok(None),
        }
    }

    /// Bind to `bound`, fetching `bound` + each of `value_paths` first when
    /// the cache cannot resolve it yet.
    pub fn bind(
        &self,
        bound: impl Into<Path>,
        value_paths: Vec<PathSet>,
    ) -> Result<impl Future<Output = Result<Option<Model>>> + Send + 'static> {
        if value_paths.is_empty() {
            return Err(Error::Configuration(
                "Model#bind requires at least one value path".into(),
            ));
        }
        let bound = bound.into();
        let model = self.clone();

        Ok(async move {
            let attempt = {
                let _permit = SyncPermit::for_root(model.root.id());
                model.bind_sync(bound.clone())
            };
            if let Ok(Some(bound_model)) = attempt {
                return Ok(Some(bound_model));
            }

            debug!(path = %bound, "bind is fetching before it can resolve");
            let paths = value_paths.iter().map(|set| set.prefixed(&bound)).collect();
            let (_, error) = model.get(paths)?.settle().await;
            if let Some(error) = error {
                return Err(error);
            }
            let _permit = SyncPermit::for_root(model.root.id());
            model.bind_sync(bound)
        })
    }

    /// The value at the bound path, or the whole cache for an unbound model.
    pub fn get_bound_value(&self) -> Result<Option<Value>> {
        self.check_sync("getBoundValue")?;
        if self.path.is_empty() {
            return Ok(Some(self.get_cache()));
        }
        let resolution = self.resolve_one(&self.path)?;
        self.sync_value(resolution)
    }

    /// The JSON Graph node at the bound path as the cache stores it, with
    /// its envelope and metadata, whatever this model's output format. An
    /// unbound model gets the whole cache.
    pub fn get_bound_context(&self) -> Result<Option<Value>> {
        self.check_sync("getBoundContext")?;
        if self.path.is_empty() {
            return Ok(Some(self.get_cache()));
        }
        match self.resolve_one(&self.path)? {
            Resolution::Found { node, .. } => Ok(Some(node.to_json())),
            Resolution::Error { path, value } => Err(Error::Graph {
                value: self.select(&path, value),
                path,
            }),
            Resolution::Short { .. } | Resolution::Missing { .. } => Ok(None),
        }
    }

    // ---- cache management ----

    /// Merge a JSON Graph tree into the cache.
    pub fn set_cache(&self, cache: &Value) -> Result<()> {
        let node = Node::from_json(cache, graph::now_ms())?;
        self.root.cache.lock().merge(&node);
        Ok(())
    }

    /// The whole cache in JSON Graph form.
    pub fn get_cache(&self) -> Value {
        self.root.cache.lock().to_json()
    }

    /// Accounted size of the shared cache.
    pub fn cache_size(&self) -> usize {
        self.root.cache.lock().size()
    }

    /// The absolute path this model is bound to.
    pub fn bound_path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> &Arc<Root> {
        &self.root
    }

    pub fn has_data_source(&self) -> bool {
        self.source.is_some()
    }

    // ---- derivations ----

    /// Same model, batching requests with `policy`.
    pub fn batch(&self, policy: impl Into<Batch>) -> Model {
        Model {
            queue: policy.into().into_queue(),
            ..self.clone()
        }
    }

    /// Same model, flushing requests on the next runtime tick.
    pub fn unbatch(&self) -> Model {
        self.batch(Batch::Immediate)
    }

    pub fn box_values(&self) -> Model {
        Model {
            boxed: true,
            ..self.clone()
        }
    }

    pub fn unbox_values(&self) -> Model {
        Model {
            boxed: false,
            ..self.clone()
        }
    }

    /// Same cache, no data source: misses are final.
    pub fn without_data_source(&self) -> Model {
        Model {
            source: None,
            ..self.clone()
        }
    }

    /// Same model, delivering each value as soon as it settles.
    pub fn progressively(&self) -> Model {
        Model {
            progressive: true,
            ..self.clone()
        }
    }

    /// Same model with a different error selector.
    pub fn with_error_selector<F>(&self, selector: F) -> Model
    where
        F: Fn(&Path, Value) -> Value + Send + Sync + 'static,
    {
        Model {
            error_selector: Arc::new(selector),
            ..self.clone()
        }
    }

    /// Same model bound to the absolute `path`.
    pub fn with_path(&self, path: impl Into<Path>) -> Model {
        Model {
            path: path.into(),
            ..self.clone()
        }
    }

    /// Serve this model's cache to another model.
    pub fn as_data_source(&self) -> ModelSource {
        ModelSource::new(self.clone())
    }

    // ---- internals ----

    fn absolute(&self, path: &Path) -> Path {
        self.path.join(path)
    }

    fn relative(&self, path: &Path) -> Path {
        match path.strip_prefix(self.path.keys()) {
            Some(rest) => Path::from(rest),
            None => path.clone(),
        }
    }

    fn check_sync(&self, name: &'static str) -> Result<()> {
        if self.root.unsafe_mode() || SyncPermit::is_granted(self.root.id()) {
            Ok(())
        } else {
            Err(Error::SyncGuard(name))
        }
    }

    fn select(&self, path: &Path, value: Value) -> Value {
        (self.error_selector)(path, value)
    }

    /// What a caller sees for a resolved node. A `null` atom records that
    /// the path holds nothing and delivers nothing unless boxed.
    fn format(&self, node: &Node) -> Option<Value> {
        match node {
            Node::Atom { value, .. } if !self.boxed => match value {
                Value::Null => None,
                value => Some(value.clone()),
            },
            Node::Branch(_) => Some(node.to_json()),
            Node::Atom { .. } | Node::Ref { .. } | Node::Error { .. } => Some(node.boxed()),
        }
    }

    fn resolve_one(&self, path: &Path) -> Result<Resolution> {
        let mut cache = self.root.cache.lock();
        graph::resolve(&mut cache, path, &ResolveOptions::default())
    }

    fn resolve_many(&self, paths: &[Path], fresh: &[u64]) -> Vec<Result<Resolution>> {
        let mut cache = self.root.cache.lock();
        let opts = ResolveOptions {
            fresh,
            ..ResolveOptions::default()
        };
        paths
            .iter()
            .map(|path| graph::resolve(&mut cache, path, &opts))
            .collect()
    }

    fn sync_value(&self, resolution: Resolution) -> Result<Option<Value>> {
        match resolution {
            Resolution::Found { node, .. } => Ok(self.format(&node)),
            Resolution::Error { path, value } => Err(Error::Graph {
                value: self.select(&path, value),
                path,
            }),
            Resolution::Short { .. } | Resolution::Missing { .. } => Ok(None),
        }
    }

    fn settle(&self, requested: &Path, resolution: Result<Resolution>) -> Settled {
        match resolution {
            Ok(Resolution::Found { node, .. }) => match self.format(&node) {
                Some(value) => Settled::Value(PathValue {
                    path: requested.clone(),
                    value,
                }),
                None => Settled::Empty,
            },
            Ok(Resolution::Error { path, value }) => Settled::Failed(PathFailure {
                path: requested.clone(),
                error: Error::Graph {
                    value: self.select(&path, value),
                    path,
                },
            }),
            Ok(Resolution::Short { .. }) | Ok(Resolution::Missing { .. }) => Settled::Empty,
            Err(error) => Settled::Failed(PathFailure {
                path: requested.clone(),
                error,
            }),
        }
    }

    fn settle_all(
        &self,
        requested: &[Path],
        resolutions: Vec<Result<Resolution>>,
    ) -> Vec<Result<PathValue>> {
        results(
            requested
                .iter()
                .zip(resolutions)
                .map(|(path, resolution)| self.settle(path, resolution)),
        )
    }

    fn source_failures(&self, requested: &[Path], absolute: &[Path], payload: Value) -> Error {
        Error::Batch(
            requested
                .iter()
                .zip(absolute)
                .map(|(path, absolute)| PathFailure {
                    path: path.clone(),
                    error: Error::Source {
                        value: self.select(absolute, payload.clone()),
                        path: absolute.clone(),
                    },
                })
                .collect(),
        )
    }

    /// Copy of every node `paths` pass through, as a standalone fragment.
    pub(crate) fn fragment(&self, paths: &[Path]) -> Branch {
        let mut sink = Branch::new();
        let mut cache = self.root.cache.lock();
        let opts = ResolveOptions::default();
        for path in paths {
            if let Err(err) = graph::resolve_into(&mut cache, path, &opts, &mut sink) {
                trace!(%path, %err, "leaving path out of fragment");
            }
        }
        sink
    }

    fn get_paths(&self, requested: Vec<Path>) -> Result<ResultStream<PathValue>> {
        let absolute: Vec<Path> = requested.iter().map(|path| self.absolute(path)).collect();
        let resolutions = self.resolve_many(&absolute, &[]);

        let mut settled = Vec::with_capacity(requested.len());
        let mut missing = Vec::new();
        for (index, resolution) in resolutions.into_iter().enumerate() {
            match resolution {
                Ok(Resolution::Missing { optimized, .. }) if self.source.is_some() => {
                    missing.push((index, optimized));
                    settled.push(None);
                }
                other => settled.push(Some(self.settle(&requested[index], other))),
            }
        }

        let source = match &self.source {
            Some(source) if !missing.is_empty() => source.clone(),
            _ => return Ok(ResultStream::ready(results(settled.into_iter().flatten()))),
        };

        debug!(missing = missing.len(), requested = requested.len(), "cache miss, queueing fetch");
        let fetch = missing.iter().map(|(_, path)| path.clone()).collect::<Vec<_>>();
        let receiver = self.queue.get(&self.root, &source, fetch.clone())?;
        let pins = PinGuard::new(
            self.root.clone(),
            absolute.iter().cloned().chain(fetch).collect(),
        );
        let job = GetJob {
            requested,
            absolute,
            settled,
            missing,
            receiver,
            source,
            pins,
        };
        let model = self.clone();
        Ok(ResultStream::new(move |emit| model.drive_get(emit, job)))
    }

    /// Wait on fetches, resolve again, fetch again when a reference brought
    /// in a new location, and deliver.
    async fn drive_get(self, emit: Emitter<PathValue>, job: GetJob) {
        let GetJob {
            requested,
            absolute,
            mut settled,
            mut missing,
            mut receiver,
            source,
            mut pins,
        } = job;

        if self.progressive {
            for value in settled.iter().flatten() {
                if let Settled::Value(value) = value {
                    emit.next(value.clone());
                }
            }
        }

        let mut attempted: HashMap<usize, Vec<Path>> = missing
            .iter()
            .map(|(index, path)| (*index, vec![path.clone()]))
            .collect();
        let mut fresh = Vec::new();
        // Responses whose leaves stay pinned until this request settles.
        let mut merges = Vec::new();
        let mut rounds = 1;

        loop {
            let pending = receiver.await.unwrap_or_default();
            let outcomes: Vec<Option<Outcome>> = join_all(pending.into_iter().map(|pending| async move {
                match pending.fetch {
                    Some(fetch) => Some(fetch.await),
                    None => None,
                }
            }))
            .await;

            let mut retry = Vec::with_capacity(missing.len());
            for (slot, (index, _)) in missing.iter().enumerate() {
                match outcomes.get(slot).cloned().flatten() {
                    Some(Err(payload)) => {
                        settled[*index] = Some(Settled::Failed(PathFailure {
                            path: requested[*index].clone(),
                            error: Error::Source {
                                value: self.select(&absolute[*index], payload),
                                path: absolute[*index].clone(),
                            },
                        }));
                    }
                    Some(Ok(merged)) => {
                        if !fresh.contains(&merged.generation) {
                            fresh.push(merged.generation);
                            merges.push(merged);
                        }
                        retry.push(*index);
                    }
                    None => retry.push(*index),
                }
            }

            let paths: Vec<Path> = retry.iter().map(|index| absolute[*index].clone()).collect();
            let resolutions = self.resolve_many(&paths, &fresh);
            let mut next = Vec::new();
            for (index, resolution) in retry.into_iter().zip(resolutions) {
                match resolution {
                    Ok(Resolution::Missing { optimized, .. }) => {
                        let tried = attempted.entry(index).or_default();
                        if rounds < MAX_FETCH_ROUNDS && !tried.contains(&optimized) {
                            tried.push(optimized.clone());
                            next.push((index, optimized));
                        } else {
                            trace!(path = %absolute[index], "still missing after fetch");
                            settled[index] = Some(Settled::Empty);
                        }
                    }
                    other => {
                        let outcome = self.settle(&requested[index], other);
                        if let (true, Settled::Value(value)) = (self.progressive, &outcome) {
                            emit.next(value.clone());
                        }
                        settled[index] = Some(outcome);
                    }
                }
            }

            if next.is_empty() {
                break;
            }
            rounds += 1;
            debug!(paths = next.len(), round = rounds, "following references into another fetch");
            let fetch: Vec<Path> = next.iter().map(|(_, path)| path.clone()).collect();
            match self.queue.get(&self.root, &source, fetch.clone()) {
                Ok(next_receiver) => {
                    pins.extend(fetch);
                    receiver = next_receiver;
                    missing = next;
                }
                Err(error) => {
                    for (index, _) in next {
                        settled[index] = Some(Settled::Failed(PathFailure {
                            path: requested[index].clone(),
                            error: error.clone(),
                        }));
                    }
                    break;
                }
            }
        }
        drop(pins);
        drop(merges);

        for item in results(settled.into_iter().flatten()) {
            match item {
                Ok(_) if self.progressive => {}
                item => emit.send(item),
            }
        }
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("path", &self.path)
            .field("boxed", &self.boxed)
            .field("progressive", &self.progressive)
            .field("has_data_source", &self.source.is_some())
            .field("queue", &self.queue)
            .finish()
    }
}

/// Store `node` at `path` inside a standalone fragment.
fn place(fragment: &mut Branch, path: &Path, node: Node) {
    let Some((last, prefix)) = path.split_last() else {
        return;
    };
    let mut branch = fragment;
    for key in prefix {
        branch = branch.branch_mut(key.clone());
    }
    branch.insert(last.clone(), node);
}
