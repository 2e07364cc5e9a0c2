//! Requests
//!
//! Everything between a cache miss and the data source:
//!
//! - [`DataSource`]: the asynchronous collaborator that serves fragments
//! - [`Scheduler`]: decides when a delayed or custom batching window closes
//! - [`RequestQueue`]: collects misses, writes and calls per window and
//!   dispatches them
//! - [`InFlight`]: remembers outstanding fetches so overlapping requests
//!   share them
//!
//! # Design Decisions
//!
//! 1. A fetch is a spawned task, not a future owned by whoever asked for
//!    it. Dropping a request only drops that request's interest; the fetch
//!    still completes and its response is still merged for everyone else.
//!
//! 2. Waiters hold a [`futures_util::future::Shared`] handle to the fetch,
//!    so any number of them can await the same response.
//!
//! 3. Immediate batching has no timer of its own. A window closes on the
//!    task that first awaits (or drops) one of its requests, so requests
//!    issued back to back always share it.

mod inflight;
mod queue;
mod scheduler;
mod source;

pub use inflight::{FetchHandle, FetchId, InFlight, Merged, Outcome};
pub use queue::{Pending, RequestQueue};
pub use scheduler::{FixedDelayScheduler, Scheduler, Task};

pub(crate) use queue::Ticket;
pub use source::{CallRequest, DataSource, JsonGraphEnvelope, SourceError};
