//! Paths
//!
//! Everything in the cache is addressed by path. This module defines:
//!
//! - [`Key`] and [`Path`]: a literal, atomic path.
//! - [`KeySet`], [`Range`] and [`PathSet`]: a path specification whose
//!   segments may denote several keys, and its expansion into atomic paths.
//! - [`collapse`]: folding atomic paths back into compact specifications.
//!
//! Nothing here touches the cache, so specifications can be validated
//! before one exists.

mod collapse;
mod key;
mod spec;

pub use collapse::collapse;
pub use key::{Key, Path};
pub use spec::{expand_all, KeySet, PathSet, Range};
