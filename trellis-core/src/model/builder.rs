//! Model Builder
//!
//! [`ModelBuilder`] collects options, a data source, an error selector and
//! a seed cache, then creates the shared [`Root`] every derived model will
//! point at. The seed cache is merged before `build` returns, and an
//! invalid seed fails the build instead of leaving a partial model behind.

use std::sync::Arc;

use serde_json::Value;

use super::{identity_selector, ErrorSelector, Model, ModelOptions, Root};
use crate::error::Result;
use crate::graph::GraphCache;
use crate::path::Path;
use crate::request::{DataSource, FixedDelayScheduler, RequestQueue, Scheduler};

/// Assembles a [`Model`] from options, a data source and a seed cache.
#[derive(Default)]
pub struct ModelBuilder {
    options: ModelOptions,
    source: Option<Arc<dyn DataSource>>,
    cache: Option<Value>,
    error_selector: Option<ErrorSelector>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every option at once.
    pub fn options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn source(self, source: impl DataSource + 'static) -> Self {
        self.shared_source(Arc::new(source))
    }

    pub fn shared_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Seed the cache with a JSON Graph tree.
    pub fn cache(mut self, cache: Value) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.options.max_size = max_size;
        self
    }

    pub fn collect_ratio(mut self, collect_ratio: f64) -> Self {
        self.options.collect_ratio = collect_ratio;
        self
    }

    pub fn unsafe_mode(mut self, enabled: bool) -> Self {
        self.options.unsafe_mode = enabled;
        self
    }

    pub fn boxed(mut self, boxed: bool) -> Self {
        self.options.boxed = boxed;
        self
    }

    pub fn progressive(mut self, progressive: bool) -> Self {
        self.options.progressive = progressive;
        self
    }

    pub fn batch_delay_ms(mut self, millis: u64) -> Self {
        self.options.batch_delay_ms = Some(millis);
        self
    }

    /// Flush windows with a custom scheduler. Takes precedence over
    /// `batch_delay_ms`.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn error_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&Path, Value) -> Value + Send + Sync + 'static,
    {
        self.error_selector = Some(Arc::new(selector));
        self
    }

    pub fn build(self) -> Result<Model> {
        let ModelBuilder {
            options,
            source,
            cache,
            error_selector,
            scheduler,
        } = self;
        options.validate()?;

        let queue = match (scheduler, options.batch_delay_ms) {
            (Some(scheduler), _) => RequestQueue::new(scheduler),
            (None, Some(millis)) => {
                RequestQueue::new(Arc::new(FixedDelayScheduler::from_millis(millis)))
            }
            (None, None) => RequestQueue::immediate(),
        };
        let root = Root::new(
            GraphCache::new(options.max_size, options.collect_ratio),
            options.unsafe_mode,
        );

        let model = Model {
            root: Arc::new(root),
            source,
            queue,
            error_selector: error_selector.unwrap_or_else(identity_selector),
            boxed: options.boxed,
            progressive: options.progressive,
            path: Path::new(),
        };
        if let Some(cache) = cache {
            model.set_cache(&cache)?;
        }
        Ok(model)
    }
}
