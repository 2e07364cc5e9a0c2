//! Trellis Core
//!
//! This crate provides a client-side cache for JSON Graph data. It
//! implements:
//!
//! - Path syntax: atomic paths, path sets with key sets and ranges
//! - A bounded graph cache with references, error sentinels and expiry
//! - A resolver that follows references and detects cycles
//! - A request queue that batches and deduplicates data source fetches
//! - The `Model` façade with synchronous and asynchronous accessors
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `path`: path and path-set types, expansion and collapse
//! - `graph`: cache nodes, the cache store and the path resolver
//! - `request`: data source trait, schedulers, request queue
//! - `model`: the public `Model` and everything it hands out
//! - `error`: error types shared by all of the above
//!
//! # Example
//!
//! ```rust,ignore
//! use serde_json::json;
//! use trellis_core::{path, pathset, Model};
//!
//! let backend = Model::builder()
//!     .cache(json!({
//!         "users": {"0": {"$type": "ref", "value": ["usersById", "u1"]}},
//!         "usersById": {"u1": {"name": "Ann"}}
//!     }))
//!     .build()?;
//!
//! let model = Model::builder().source(backend.as_data_source()).build()?;
//!
//! // Misses go to the data source; the reference is followed either way.
//! let name = model.get_value(path!["users", 0, "name"]).await?;
//! assert_eq!(name, Some(json!("Ann")));
//!
//! // Now it is cached.
//! assert_eq!(model.get_value_sync(path!["users", 0, "name"])?, Some(json!("Ann")));
//! ```

pub mod error;
pub mod graph;
pub mod model;
pub mod path;
pub mod request;

pub use error::{Error, PathError, PathFailure, Result};
pub use graph::{EXPIRES_NEVER, EXPIRES_NOW};
pub use model::{
    Batch, Model, ModelBuilder, ModelOptions, ModelSource, PathValue, ResultStream, SyncPermit,
};
pub use path::{Key, KeySet, Path, PathSet, Range};
pub use request::{DataSource, JsonGraphEnvelope, Scheduler, SourceError};
