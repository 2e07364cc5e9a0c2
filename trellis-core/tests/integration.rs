//! Integration Tests for Model and Request Queue
//!
//! These tests drive a front model against a data source and check the
//! cache, the number of round trips, and what callers get back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trellis_core::graph::{now_ms, Node};
use trellis_core::request::CallRequest;
use trellis_core::{
    path, pathset, DataSource, Error, JsonGraphEnvelope, Model, ModelSource, PathSet, PathValue,
    SourceError, SyncPermit,
};

/// Install a test subscriber once. `RUST_LOG=trellis_core=debug` shows
/// queue activity.
fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

/// Counts round trips to a backing model and can hold or fail them.
struct Counting {
    inner: ModelSource,
    gets: AtomicUsize,
    sets: AtomicUsize,
    requests: Mutex<Vec<Vec<PathSet>>>,
    gate: Option<Arc<Notify>>,
    failure: Option<Value>,
}

impl Counting {
    fn new(backend: &Model) -> Self {
        Self {
            inner: backend.as_data_source(),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            gate: None,
            failure: None,
        }
    }

    fn gated(backend: &Model, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(backend)
        }
    }

    fn failing(backend: &Model, failure: Value) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(backend)
        }
    }

    fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for Counting {
    async fn get(&self, paths: Vec<PathSet>) -> Result<JsonGraphEnvelope, SourceError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(paths.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(failure) = &self.failure {
            return Err(SourceError(failure.clone()));
        }
        self.inner.get(paths).await
    }

    async fn set(&self, envelope: JsonGraphEnvelope) -> Result<JsonGraphEnvelope, SourceError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(envelope).await
    }
}

/// Answers each get with the next canned fragment, and calls with a
/// fixed response.
struct Scripted {
    responses: Mutex<VecDeque<Value>>,
    gets: AtomicUsize,
}

impl Scripted {
    fn new(responses: Vec<Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            gets: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DataSource for Scripted {
    async fn get(&self, paths: Vec<PathSet>) -> Result<JsonGraphEnvelope, SourceError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().pop_front().unwrap_or_else(|| json!({}));
        let graph = Node::from_json(&next, now_ms())
            .map_err(|err| SourceError::from(err.to_string()))?;
        Ok(JsonGraphEnvelope::new(graph, paths))
    }

    async fn call(&self, call: CallRequest) -> Result<JsonGraphEnvelope, SourceError> {
        let by = call.args.first().and_then(Value::as_i64).unwrap_or(1);
        Ok(JsonGraphEnvelope {
            json_graph: Node::from_json(&json!({"counter": 1 + by}), 0).unwrap_or_default(),
            paths: vec![pathset!["counter"]],
            invalidated: vec![pathset!["stale"]],
        })
    }
}

fn backend() -> Model {
    Model::builder()
        .cache(json!({
            "users": {
                "0": {"$type": "ref", "value": ["usersById", "u1"]},
                "1": {"$type": "ref", "value": ["usersById", "u2"]},
                "length": 2
            },
            "usersById": {
                "u1": {"name": "Ann", "age": 30},
                "u2": {"name": "Bo", "age": 41}
            },
            "broken": {"$type": "error", "value": "backend exploded"}
        }))
        .build()
        .unwrap()
}

fn front(source: Arc<dyn DataSource>) -> Model {
    Model::builder().shared_source(source).build().unwrap()
}

/// A path set and the values fetched for it come back in request order.
#[tokio::test]
async fn fetches_misses_and_follows_references() {
    init_tracing();
    let counting = Arc::new(Counting::new(&backend()));
    let model = front(counting.clone());

    let values = model
        .get(vec![pathset!["users", 0..=1, "name"]])
        .unwrap()
        .into_values()
        .await
        .unwrap();

    assert_eq!(
        values,
        vec![
            PathValue::new(path!["users", 0, "name"], "Ann"),
            PathValue::new(path!["users", 1, "name"], "Bo"),
        ]
    );
    assert_eq!(counting.gets(), 1);
    assert_eq!(
        counting.requests.lock()[0],
        vec![pathset!["users", 0..=1, "name"]]
    );
    assert_eq!(
        model.get_value_sync(path!["usersById", "u2", "name"]).unwrap(),
        Some(json!("Bo"))
    );
}

/// Asking twice gives the same answer, and the second time costs nothing.
#[tokio::test]
async fn resolution_is_idempotent() {
    init_tracing();
    let counting = Arc::new(Counting::new(&backend()));
    let model = front(counting.clone());
    let request = || vec![pathset!["users", 0, ["name", "age"]]];

    let first = model.get(request()).unwrap().into_json().await.unwrap();
    let second = model.get(request()).unwrap().into_json().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, json!({"users": {"0": {"name": "Ann", "age": 30}}}));
    assert_eq!(counting.gets(), 1);
}

/// Overlapping requests share one outstanding fetch.
#[tokio::test]
async fn overlapping_requests_share_a_fetch() {
    init_tracing();
    let gate = Arc::new(Notify::new());
    let counting = Arc::new(Counting::gated(&backend(), gate.clone()));
    let model = front(counting.clone());

    let first = tokio::spawn(model.get(vec![pathset!["usersById", "u1"]]).unwrap().into_values());
    while counting.gets() == 0 {
        tokio::task::yield_now().await;
    }
    let second = model.get(vec![pathset!["usersById", "u1", "name"]]).unwrap();
    gate.notify_one();

    let second = second.into_values().await;
    assert_eq!(first.await.unwrap().unwrap().len(), 1);
    assert_eq!(
        second.unwrap(),
        vec![PathValue::new(path!["usersById", "u1", "name"], "Ann")]
    );
    assert_eq!(counting.gets(), 1);
}

/// A value reached through a reference is the value at its target.
#[tokio::test]
async fn references_are_transparent() {
    init_tracing();
    let model = front(Arc::new(Counting::new(&backend())));

    let through_ref = model.get_value(path!["users", 1, "age"]).await.unwrap();
    let direct = model.get_value(path!["usersById", "u2", "age"]).await.unwrap();
    assert_eq!(through_ref, Some(json!(41)));
    assert_eq!(through_ref, direct);
}

/// Reference cycles fail their path; traversing a cyclic structure does not.
#[tokio::test]
async fn cycles_are_detected() {
    init_tracing();
    let model = Model::builder()
        .cache(json!({
            "a": {"$type": "ref", "value": ["b"]},
            "b": {"$type": "ref", "value": ["a"]},
            "ring": {
                "x": {"next": {"$type": "ref", "value": ["ring", "y"]}, "v": 1},
                "y": {"next": {"$type": "ref", "value": ["ring", "x"]}, "v": 2}
            },
            "ok": true
        }))
        .build()
        .unwrap();

    let (values, error) = model
        .get(vec![pathset!["a", "x"], pathset!["ok"]])
        .unwrap()
        .settle()
        .await;
    assert_eq!(values, vec![PathValue::new(path!["ok"], true)]);
    let failures = error.unwrap().failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0].error, Error::Cycle { .. }));

    assert_eq!(
        model.get_value(path!["ring", "x", "next", "next", "next", "v"]).await.unwrap(),
        Some(json!(2))
    );
}

/// An error sentinel fails its own path and nothing else.
#[tokio::test]
async fn errors_short_circuit_their_path_only() {
    init_tracing();
    let model = Model::builder()
        .shared_source(Arc::new(Counting::new(&backend())))
        .error_selector(|path, value| json!({"at": path.to_string(), "cause": value}))
        .build()
        .unwrap();

    let (values, error) = model
        .get(vec![pathset!["broken", "deep", "key"], pathset!["users", "length"]])
        .unwrap()
        .settle()
        .await;

    assert_eq!(values, vec![PathValue::new(path!["users", "length"], 2)]);
    let failures = error.unwrap().failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].path, path!["broken", "deep", "key"]);
    assert_eq!(
        failures[0].error,
        Error::Graph {
            path: path!["broken"],
            value: json!({"at": "[\"broken\"]", "cause": "backend exploded"}),
        }
    );
}

/// The cache never stays above its bound.
#[test]
fn eviction_keeps_the_cache_bounded() {
    init_tracing();
    let model = Model::builder().max_size(600).collect_ratio(0.75).build().unwrap();

    for i in 0..30 {
        model.set_value_sync(path!["items", i], i).unwrap();
        assert!(model.cache_size() <= 600, "size {} after write {}", model.cache_size(), i);
    }
    assert_eq!(model.get_value_sync(path!["items", 29]).unwrap(), Some(json!(29)));
    assert_eq!(model.get_value_sync(path!["items", 0]).unwrap(), None);
}

/// Binding through a reference that points back at itself is a cycle.
#[test]
fn bind_sync_reports_self_references() {
    init_tracing();
    let model = Model::builder()
        .cache(json!({"x": {"$type": "ref", "value": ["x"]}}))
        .build()
        .unwrap();

    assert!(matches!(model.bind_sync(path!["x"]), Err(Error::Cycle { .. })));
}

/// A merge that pushes the cache over its bound does not evict what the
/// fetched references point at before the request has resolved through them.
#[tokio::test]
async fn fetched_references_survive_the_collection_they_trigger() {
    init_tracing();
    let counting = Arc::new(Counting::new(&backend()));
    let model = Model::builder()
        .shared_source(counting.clone())
        .max_size(150)
        .collect_ratio(0.5)
        .build()
        .unwrap();

    let values = model
        .get(vec![pathset!["users", 0..=1, "name"]])
        .unwrap()
        .into_values()
        .await
        .unwrap();
    assert_eq!(
        values,
        vec![
            PathValue::new(path!["users", 0, "name"], "Ann"),
            PathValue::new(path!["users", 1, "name"], "Bo"),
        ]
    );
    assert_eq!(counting.gets(), 1);
    assert!(model.cache_size() <= 150, "size {}", model.cache_size());
}

/// A data source that panics fails the request instead of wedging the
/// paths it was asked for.
#[tokio::test]
async fn a_panicking_source_does_not_wedge_its_paths() {
    struct Flaky {
        inner: ModelSource,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DataSource for Flaky {
        async fn get(&self, paths: Vec<PathSet>) -> Result<JsonGraphEnvelope, SourceError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first request blows up");
            }
            self.inner.get(paths).await
        }
    }

    init_tracing();
    let flaky = Arc::new(Flaky {
        inner: backend().as_data_source(),
        calls: AtomicUsize::new(0),
    });
    let model = front(flaky.clone());

    assert!(matches!(
        model.get_value(path!["usersById", "u1", "name"]).await,
        Err(Error::Source { .. })
    ));
    assert_eq!(
        model.get_value(path!["usersById", "u1", "name"]).await.unwrap(),
        Some(json!("Ann"))
    );
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
}

/// Sync accessors need a permit when unsafe mode is off; bind grants one.
#[tokio::test]
async fn sync_guard_and_bind() {
    init_tracing();
    let model = Model::builder()
        .shared_source(Arc::new(Counting::new(&backend())))
        .unsafe_mode(false)
        .build()
        .unwrap();

    assert_eq!(
        model.get_value_sync(path!["users", "length"]),
        Err(Error::SyncGuard("getValueSync"))
    );

    let bound = model
        .bind(path!["users", 0], vec![pathset!["name"]])
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bound.bound_path(), &path!["usersById", "u1"]);
    assert!(matches!(
        bound.get_value_sync(path!["name"]),
        Err(Error::SyncGuard(_))
    ));

    let _permit = SyncPermit::enter(&bound);
    assert_eq!(bound.get_value_sync(path!["name"]).unwrap(), Some(json!("Ann")));
}

/// A batching window merges requests that an immediate policy keeps apart.
#[tokio::test(start_paused = true)]
async fn batching_policy_can_be_swapped() {
    init_tracing();
    let counting = Arc::new(Counting::new(&backend()));
    let batched = front(counting.clone()).batch(Duration::from_millis(50));

    let first = batched.get(vec![pathset!["usersById", "u1", "name"]]).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = batched.get(vec![pathset!["usersById", "u2", "name"]]).unwrap();
    let (first, second) = tokio::join!(first.into_values(), second.into_values());
    assert_eq!(first.unwrap().len(), 1);
    assert_eq!(second.unwrap().len(), 1);
    assert_eq!(counting.gets(), 1);

    let unbatched = batched.unbatch();
    let third = tokio::spawn(unbatched.get(vec![pathset!["usersById", "u1", "age"]]).unwrap().into_values());
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fourth = unbatched.get(vec![pathset!["usersById", "u2", "age"]]).unwrap();
    assert_eq!(fourth.into_values().await.unwrap().len(), 1);
    assert_eq!(third.await.unwrap().unwrap().len(), 1);
    assert_eq!(counting.gets(), 3);
}

/// Requests issued back to back share a window even when other workers
/// are free to run in between.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn immediate_batching_holds_on_a_multi_thread_runtime() {
    init_tracing();
    for _ in 0..20 {
        let counting = Arc::new(Counting::new(&backend()));
        let model = front(counting.clone());

        let first = model.get(vec![pathset!["usersById", "u1", "name"]]).unwrap();
        std::thread::sleep(Duration::from_millis(1));
        let second = model.get(vec![pathset!["usersById", "u2", "name"]]).unwrap();
        let (first, second) = tokio::join!(first.into_values(), second.into_values());

        assert_eq!(first.unwrap(), vec![PathValue::new(path!["usersById", "u1", "name"], "Ann")]);
        assert_eq!(second.unwrap(), vec![PathValue::new(path!["usersById", "u2", "name"], "Bo")]);
        assert_eq!(counting.gets(), 1);
    }
}

/// Data source failures reach every waiting path through the selector.
#[tokio::test]
async fn source_failures_go_through_the_error_selector() {
    init_tracing();
    let model = Model::builder()
        .shared_source(Arc::new(Counting::failing(&backend(), json!({"status": 503}))))
        .error_selector(|_, value| json!({"wrapped": value}))
        .build()
        .unwrap();

    let error = model
        .get(vec![pathset!["users", [0, 1], "name"]])
        .unwrap()
        .into_values()
        .await
        .unwrap_err();

    let failures = error.failures();
    assert_eq!(failures.len(), 2);
    for failure in failures {
        assert!(matches!(
            failure.error,
            Error::Source { ref value, .. } if value == &json!({"wrapped": {"status": 503}})
        ));
    }

    assert_eq!(
        model.get_value(path!["users", "length"]).await,
        Err(Error::Source {
            path: path!["users", "length"],
            value: json!({"wrapped": {"status": 503}}),
        })
    );
}

/// Dropping a waiter does not cancel the fetch others depend on, and the
/// response is merged even when nobody is left waiting.
#[tokio::test]
async fn cancelling_a_waiter_keeps_the_fetch() {
    init_tracing();
    let gate = Arc::new(Notify::new());
    let counting = Arc::new(Counting::gated(&backend(), gate.clone()));
    let model = front(counting.clone());

    let dropped = model.get(vec![pathset!["usersById", "u1", "name"]]).unwrap();
    let kept = model.get(vec![pathset!["usersById", "u1", "name"]]).unwrap();
    tokio::task::yield_now().await;
    drop(dropped);
    gate.notify_one();

    assert_eq!(
        kept.into_values().await.unwrap(),
        vec![PathValue::new(path!["usersById", "u1", "name"], "Ann")]
    );

    let abandoned = model.get(vec![pathset!["usersById", "u2", "age"]]).unwrap();
    tokio::task::yield_now().await;
    drop(abandoned);
    gate.notify_one();

    let mut merged = None;
    for _ in 0..100 {
        merged = model.get_value_sync(path!["usersById", "u2", "age"]).unwrap();
        if merged.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(merged, Some(json!(41)));
    assert_eq!(counting.gets(), 2);
}

/// Stale leaves are fetched again; `EXPIRES_NOW` values are delivered once.
#[tokio::test]
async fn expired_values_are_refetched() {
    init_tracing();
    let source = Arc::new(Scripted::new(vec![
        json!({"a": "fresh"}),
        json!({"now": {"$type": "atom", "value": 5, "$expires": Model::EXPIRES_NOW}}),
    ]));
    let model = Model::builder()
        .shared_source(source.clone())
        .cache(json!({"a": {"$type": "atom", "value": "stale", "$expires": 1000}}))
        .build()
        .unwrap();

    assert_eq!(model.get_value(path!["a"]).await.unwrap(), Some(json!("fresh")));
    assert_eq!(model.get_value(path!["now"]).await.unwrap(), Some(json!(5)));
    assert_eq!(model.get_value_sync(path!["now"]).unwrap(), None);
    assert_eq!(source.gets.load(Ordering::SeqCst), 2);
}

/// A reference that only arrives with the first response is followed by a
/// second fetch.
#[tokio::test]
async fn newly_fetched_references_trigger_another_round() {
    init_tracing();
    let source = Arc::new(Scripted::new(vec![
        json!({"users": {"0": {"$type": "ref", "value": ["usersById", "u9"]}}}),
        json!({"usersById": {"u9": {"name": "Ida"}}}),
    ]));
    let model = front(source.clone());

    assert_eq!(
        model.get_value(path!["users", 0, "name"]).await.unwrap(),
        Some(json!("Ida"))
    );
    assert_eq!(source.gets.load(Ordering::SeqCst), 2);

    // Nothing new to follow: a second miss on the same path is final.
    assert_eq!(model.get_value(path!["users", 0, "email"]).await.unwrap(), None);
    assert_eq!(source.gets.load(Ordering::SeqCst), 3);
}

/// Writes go to the cache and the data source; the source has the last word.
#[tokio::test]
async fn set_writes_through_to_the_source() {
    init_tracing();
    let upstream = backend();
    let counting = Arc::new(Counting::new(&upstream));
    let model = front(counting.clone());

    let written = model
        .set(vec![
            PathValue::new(path!["usersById", "u1", "name"], "Cy"),
            PathValue::new(path!["usersById", "u2", "name"], "Di"),
        ])
        .unwrap()
        .into_values()
        .await
        .unwrap();

    assert_eq!(written.len(), 2);
    assert_eq!(counting.sets.load(Ordering::SeqCst), 1);
    assert_eq!(
        upstream.get_value_sync(path!["usersById", "u1", "name"]).unwrap(),
        Some(json!("Cy"))
    );
    assert_eq!(
        model.set_value(path!["usersById", "u2", "age"], 42).await.unwrap(),
        Some(json!(42))
    );
}

/// Calls merge their response and deliver the paths it names.
#[tokio::test]
async fn calls_deliver_returned_paths() {
    init_tracing();
    let model = Model::builder()
        .shared_source(Arc::new(Scripted::new(vec![])))
        .cache(json!({"stale": "x"}))
        .build()
        .unwrap();

    let values = model
        .call(path!["increment"], vec![json!(4)], vec![], vec![])
        .unwrap()
        .into_values()
        .await
        .unwrap();

    assert_eq!(values, vec![PathValue::new(path!["counter"], 5)]);
    assert_eq!(model.get_value_sync(path!["stale"]).unwrap(), None);
}

/// Progressive models hand out cached values before fetched ones arrive.
#[tokio::test]
async fn progressive_delivery() {
    init_tracing();
    let gate = Arc::new(Notify::new());
    let model = Model::builder()
        .shared_source(Arc::new(Counting::gated(&backend(), gate.clone())))
        .cache(json!({"local": 1}))
        .build()
        .unwrap()
        .progressively();

    let mut stream = model
        .get(vec![pathset!["local"], pathset!["users", "length"]])
        .unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first, PathValue::new(path!["local"], 1));

    gate.notify_one();
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second, PathValue::new(path!["users", "length"], 2));
    assert!(stream.next().await.is_none());
}

/// Selectors see every delivered value and may read the cache directly.
#[tokio::test]
async fn get_with_selects_over_fetched_values() {
    init_tracing();
    let model = Model::builder()
        .shared_source(Arc::new(Counting::new(&backend())))
        .unsafe_mode(false)
        .build()
        .unwrap();
    let reader = model.clone();

    let names = model
        .get_with(vec![pathset!["users", 0..=1, "name"]], move |values| {
            let length = reader.get_value_sync(path!["users", "length"]).unwrap();
            let names: Vec<Value> = values.iter().map(|v| v.value.clone()).collect();
            (names, length)
        })
        .unwrap()
        .into_values()
        .await
        .unwrap();

    assert_eq!(names, vec![(vec![json!("Ann"), json!("Bo")], None)]);
}

/// Bound models fetch relative to their binding.
#[tokio::test]
async fn bound_models_fetch_relative_paths() {
    init_tracing();
    let counting = Arc::new(Counting::new(&backend()));
    let model = front(counting.clone()).with_path(path!["usersById", "u2"]);

    let values = model
        .get(vec![pathset![["name", "age"]]])
        .unwrap()
        .into_json()
        .await
        .unwrap();
    assert_eq!(values, json!({"name": "Bo", "age": 41}));
    assert_eq!(counting.requests.lock()[0], vec![pathset!["usersById", "u2", ["name", "age"]]]);
}
