//! Graph Cache
//!
//! This module implements the JSON Graph cache: the node types, the store
//! that holds them, and the resolver that walks paths through it.
//!
//! # Overview
//!
//! The cache is a tree of nodes keyed by path segment where:
//!
//! - Branches hold children
//! - Atoms hold terminal values
//! - References redirect to another absolute path
//! - Error sentinels stop resolution and report an error
//!
//! References turn the tree into a graph. The store itself never follows
//! them; the resolver does, and it is the only place that has to think
//! about cycles.
//!
//! # Design Decisions
//!
//! 1. Size accounting is per leaf. Branches are free, so eviction only ever
//!    has to reason about leaves, and empty branches are pruned as it goes.
//!
//! 2. Every write carries a generation number. `EXPIRES_NOW` values stay
//!    visible to the request whose write produced them and to nobody else.
//!
//! 3. The store is not thread-safe on its own. The model wraps it in a
//!    mutex that is never held across an await point.

mod cache;
mod node;
mod resolve;

pub use cache::{GraphCache, DEFAULT_COLLECT_RATIO, DEFAULT_MAX_SIZE};
pub use node::{Branch, Expires, Meta, Node, EXPIRES_NEVER, EXPIRES_NOW};
pub use resolve::{optimize, resolve, resolve_into, MissReason, Resolution, ResolveOptions};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
