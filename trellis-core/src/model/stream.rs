//! Result Streams
//!
//! Every asynchronous accessor hands back a [`ResultStream`]. The work
//! behind it is already queued when the accessor returns; the stream just
//! drives the part that belongs to this caller (waiting on fetches,
//! resolving again, formatting) and yields what it produces.
//!
//! Dropping the stream cancels the caller's part only. Fetches it joined
//! keep running for whoever else is waiting, and their responses are
//! still merged into the cache.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::PathValue;
use crate::error::{Error, Result};

/// Sending half handed to a stream's driver.
pub(crate) struct Emitter<T> {
    tx: mpsc::UnboundedSender<Result<T>>,
}

impl<T> Emitter<T> {
    pub(crate) fn next(&self, item: T) {
        let _ = self.tx.send(Ok(item));
    }

    pub(crate) fn error(&self, error: Error) {
        let _ = self.tx.send(Err(error));
    }

    pub(crate) fn send(&self, item: Result<T>) {
        let _ = self.tx.send(item);
    }
}

/// Values of one request, followed by at most one terminal error.
#[must_use = "streams do nothing for the caller unless polled"]
pub struct ResultStream<T> {
    driver: Option<BoxFuture<'static, ()>>,
    items: mpsc::UnboundedReceiver<Result<T>>,
}

impl<T> Unpin for ResultStream<T> {}

impl<T: Send + 'static> ResultStream<T> {
    /// A stream fed by the future `drive` builds around an emitter.
    pub(crate) fn new<F, Fut>(drive: F) -> Self
    where
        F: FnOnce(Emitter<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, items) = mpsc::unbounded_channel();
        Self {
            driver: Some(drive(Emitter { tx }).boxed()),
            items,
        }
    }

    /// A stream whose items are all known up front.
    pub(crate) fn ready(items: impl IntoIterator<Item = Result<T>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for item in items {
            let _ = tx.send(item);
        }
        Self {
            driver: None,
            items: rx,
        }
    }

    pub(crate) fn empty() -> Self {
        Self::ready(std::iter::empty())
    }

    /// Collect every value, or the terminal error if there is one.
    pub async fn into_values(self) -> Result<Vec<T>> {
        let (values, error) = self.settle().await;
        match error {
            Some(error) => Err(error),
            None => Ok(values),
        }
    }

    /// Collect every value and the terminal error, if any.
    pub async fn settle(mut self) -> (Vec<T>, Option<Error>) {
        let mut values = Vec::new();
        let mut error = None;
        while let Some(item) = self.next().await {
            match item {
                Ok(value) => values.push(value),
                Err(err) => error = Some(err),
            }
        }
        (values, error)
    }
}

impl ResultStream<PathValue> {
    /// Fold the delivered values into one JSON tree.
    pub async fn into_json(self) -> Result<Value> {
        let values = self.into_values().await?;
        Ok(json_tree(&values))
    }
}

impl<T> Stream for ResultStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(driver) = this.driver.as_mut() {
            if driver.as_mut().poll(cx).is_ready() {
                this.driver = None;
            }
        }
        this.items.poll_recv(cx)
    }
}

/// Nest `values` into a JSON object keyed by their paths.
pub fn json_tree(values: &[PathValue]) -> Value {
    let mut root = Value::Object(Map::new());
    for PathValue { path, value } in values {
        let Some((last, prefix)) = path.split_last() else {
            root = value.clone();
            continue;
        };
        let mut node = &mut root;
        for key in prefix {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = match node {
                Value::Object(map) => map
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => unreachable!("node was just made an object"),
            };
        }
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        if let Value::Object(map) = node {
            map.insert(last.to_string(), value.clone());
        }
    }
    root
}
