//! Data Source Interface
//!
//! A data source serves graph fragments on demand. The cache does not care
//! how: over HTTP, from another cache, or straight out of a test fixture.
//! It only needs "given path sets, eventually produce a fragment or an
//! error".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::graph::Node;
use crate::path::{Path, PathSet};

/// A graph fragment plus the paths it answers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonGraphEnvelope {
    /// Fragment rooted at the graph root.
    pub json_graph: Node,

    /// Paths the fragment is known to cover.
    #[serde(default)]
    pub paths: Vec<PathSet>,

    /// Paths the receiver should drop from its cache.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalidated: Vec<PathSet>,
}

impl JsonGraphEnvelope {
    pub fn new(json_graph: Node, paths: Vec<PathSet>) -> Self {
        Self {
            json_graph,
            paths,
            invalidated: Vec::new(),
        }
    }
}

/// A remote procedure invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    /// Absolute path of the function to invoke.
    pub path: Path,
    pub args: Vec<Value>,
    /// Paths to read relative to any references the call returns.
    pub ref_paths: Vec<PathSet>,
    /// Paths to read relative to the function's parent.
    pub this_paths: Vec<PathSet>,
}

/// A data source rejected a request. The payload is delivered to every
/// waiter after passing through the model's error selector.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("data source error: {0}")]
pub struct SourceError(pub Value);

impl SourceError {
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for SourceError {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<String> for SourceError {
    fn from(message: String) -> Self {
        Self(Value::String(message))
    }
}

impl From<&str> for SourceError {
    fn from(message: &str) -> Self {
        Self(Value::from(message))
    }
}

/// Something that can answer graph requests asynchronously.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch a fragment covering `paths`. Extra nodes are welcome.
    async fn get(&self, paths: Vec<PathSet>) -> Result<JsonGraphEnvelope, SourceError>;

    /// Apply the values in `envelope` and answer with their new state.
    async fn set(&self, envelope: JsonGraphEnvelope) -> Result<JsonGraphEnvelope, SourceError> {
        let _ = envelope;
        Err(SourceError::from("this data source does not support set"))
    }

    /// Invoke a remote function and answer with the graph changes it made.
    async fn call(&self, call: CallRequest) -> Result<JsonGraphEnvelope, SourceError> {
        Err(SourceError::from(format!(
            "this data source does not support call ({})",
            call.path
        )))
    }
}
