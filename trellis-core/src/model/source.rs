//! A data source backed by another model's cache.
//!
//! Useful for layering a small front cache over a larger one, and for
//! tests that need a data source with real JSON Graph semantics.

use async_trait::async_trait;
use tracing::trace;

use super::Model;
use crate::graph::Node;
use crate::path::{expand_all, PathSet};
use crate::request::{DataSource, JsonGraphEnvelope, SourceError};

/// Serves fragments out of a model's cache, from the graph root.
///
/// Only the cache is consulted: the backing model's own data source, if
/// any, is never asked.
#[derive(Debug, Clone)]
pub struct ModelSource {
    model: Model,
}

impl ModelSource {
    pub fn new(model: Model) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    fn answer(&self, paths: Vec<PathSet>) -> Result<JsonGraphEnvelope, SourceError> {
        let requested = expand_all(&paths).map_err(|err| SourceError::from(err.to_string()))?;
        let fragment = self.model.fragment(&requested);
        trace!(paths = requested.len(), nodes = fragment.len(), "serving fragment");
        Ok(JsonGraphEnvelope::new(Node::Branch(fragment), paths))
    }
}

#[async_trait]
impl DataSource for ModelSource {
    async fn get(&self, paths: Vec<PathSet>) -> Result<JsonGraphEnvelope, SourceError> {
        self.answer(paths)
    }

    async fn set(&self, envelope: JsonGraphEnvelope) -> Result<JsonGraphEnvelope, SourceError> {
        self.model.root.cache.lock().merge(&envelope.json_graph);
        self.answer(envelope.paths)
    }
}
