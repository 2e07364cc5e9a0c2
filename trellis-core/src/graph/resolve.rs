//! Path Resolver
//!
//! Resolution walks an atomic path through the cache one key at a time,
//! tracking the *real* location reached so far. References are followed
//! by splicing their target in front of the keys not yet consumed.
//!
//! # Outcomes
//!
//! - [`Resolution::Found`]: the whole path resolved. `path` is where the
//!   value really lives, after references.
//! - [`Resolution::Error`]: an error sentinel sits on the path. Resolution
//!   is complete, and failed.
//! - [`Resolution::Short`]: an atom sits on the path before its end. The
//!   path is complete but holds nothing.
//! - [`Resolution::Missing`]: a key is absent or a leaf is expired.
//!   `optimized` is the real prefix plus the unresolved suffix, which is
//!   exactly what has to be fetched.
//!
//! # Cycles
//!
//! A chain of reference follows that consumes none of the caller's keys
//! must not come back to a reference it already followed, and a reference
//! must not point at itself or one of its ancestors. Either case is an
//! [`Error::Cycle`]. Walking through a legitimately cyclic structure
//! (`a.next.next.next`) consumes keys, so it never trips the check.

use serde_json::Value;

use super::cache::GraphCache;
use super::node::{Branch, Node};
use crate::error::{Error, Result};
use crate::path::{Key, Path};

/// Why a path is not in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// Never fetched, evicted, or invalidated.
    Absent,
    /// Present but past its expiration.
    Expired,
}

/// Outcome of resolving one atomic path.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found { path: Path, node: Node },
    Error { path: Path, value: Value },
    Short { path: Path },
    Missing { optimized: Path, reason: MissReason },
}

impl Resolution {
    /// Whether the cache fully answered the path, with or without a value.
    pub fn is_complete(&self) -> bool {
        !matches!(self, Resolution::Missing { .. })
    }
}

/// Knobs for a single resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions<'a> {
    /// Current time in epoch milliseconds.
    pub now: i64,
    /// Write generations whose `EXPIRES_NOW` leaves are still usable.
    pub fresh: &'a [u64],
    /// Follow a reference sitting at the very end of the path.
    pub follow_final_ref: bool,
}

impl Default for ResolveOptions<'_> {
    fn default() -> Self {
        Self {
            now: super::now_ms(),
            fresh: &[],
            follow_final_ref: true,
        }
    }
}

enum Step {
    Found(Path),
    Error(Path, Value),
    Short(Path),
    Missing(Path, MissReason),
}

/// Resolve `path` against `cache`.
pub fn resolve(cache: &mut GraphCache, path: &Path, opts: &ResolveOptions<'_>) -> Result<Resolution> {
    let step = walk(cache, path.keys(), opts, None)?;
    Ok(finish(cache, step))
}

/// Resolve `path`, copying every reference and the final node it passes
/// through into `sink`, so that `sink` becomes a fragment able to answer
/// the same path on its own.
pub fn resolve_into(
    cache: &mut GraphCache,
    path: &Path,
    opts: &ResolveOptions<'_>,
    sink: &mut Branch,
) -> Result<Resolution> {
    let step = walk(cache, path.keys(), opts, Some(&mut *sink))?;
    let resolution = finish(cache, step);
    if let Resolution::Found { path, node } = &resolution {
        if !node.is_leaf() {
            record(sink, path, node);
        }
    }
    Ok(resolution)
}

/// The real location a write or invalidation of `path` lands on.
///
/// References along the prefix are followed; the last key is not.
pub fn optimize(cache: &mut GraphCache, path: &Path, now: i64) -> Result<Path> {
    let Some((last, prefix)) = path.split_last() else {
        return Err(Error::Structural {
            path: Path::new(),
            kind: "root",
        });
    };
    if prefix.is_empty() {
        return Ok(path.clone());
    }

    let opts = ResolveOptions {
        now,
        fresh: &[],
        follow_final_ref: true,
    };
    let base = match walk(cache, prefix, &opts, None)? {
        Step::Found(real) => match cache.get(&real).filter(|node| node.is_leaf()) {
            Some(leaf) => {
                return Err(Error::Structural {
                    kind: leaf.kind(),
                    path: real,
                })
            }
            None => real,
        },
        Step::Missing(real, MissReason::Absent) => real,
        Step::Missing(real, MissReason::Expired) => {
            return Err(Error::Structural {
                path: real,
                kind: "expired leaf",
            })
        }
        Step::Short(at) => return Err(Error::Structural { path: at, kind: "atom" }),
        Step::Error(at, _) => return Err(Error::Structural { path: at, kind: "error" }),
    };
    Ok(base.join(std::slice::from_ref(last)))
}

fn finish(cache: &GraphCache, step: Step) -> Resolution {
    match step {
        Step::Found(path) => {
            let node = if path.is_empty() {
                Node::Branch(cache.root().clone())
            } else {
                cache
                    .get(&path)
                    .cloned()
                    .unwrap_or_else(|| Node::Branch(Branch::new()))
            };
            Resolution::Found { path, node }
        }
        Step::Error(path, value) => Resolution::Error { path, value },
        Step::Short(path) => Resolution::Short { path },
        Step::Missing(optimized, reason) => Resolution::Missing { optimized, reason },
    }
}

fn walk(
    cache: &mut GraphCache,
    path: &[Key],
    opts: &ResolveOptions<'_>,
    mut sink: Option<&mut Branch>,
) -> Result<Step> {
    let mut keys: Vec<Key> = path.to_vec();
    let mut index = 0;
    // Leading entries of `keys` that came from reference targets rather
    // than from the caller.
    let mut target_len = 0;
    let mut real = Path::new();
    let mut chain: Vec<Path> = Vec::new();

    loop {
        if index == keys.len() {
            return Ok(Step::Found(real));
        }

        let mut location = real.clone();
        location.push(keys[index].clone());

        let node = match cache.get(&location) {
            None => {
                let missing = location.join(&keys[index + 1..]);
                return Ok(Step::Missing(missing, MissReason::Absent));
            }
            Some(node) => node,
        };

        if let Node::Branch(_) = node {
            if index >= target_len {
                chain.clear();
            }
            real = location;
            index += 1;
            continue;
        }

        if node.meta().is_some_and(|meta| meta.is_expired(opts.now, opts.fresh)) {
            let missing = location.join(&keys[index + 1..]);
            cache.record_expired(&location);
            return Ok(Step::Missing(missing, MissReason::Expired));
        }

        let node = node.clone();
        let is_last = index + 1 == keys.len();
        cache.touch(&location);

        match node {
            Node::Branch(_) => unreachable!("branches are handled above"),
            Node::Atom { .. } => {
                if let Some(sink) = sink.as_deref_mut() {
                    record(sink, &location, &node);
                }
                return Ok(if is_last {
                    Step::Found(location)
                } else {
                    Step::Short(location)
                });
            }
            Node::Error { ref value, .. } => {
                if let Some(sink) = sink.as_deref_mut() {
                    record(sink, &location, &node);
                }
                return Ok(Step::Error(location, value.clone()));
            }
            Node::Ref { ref target, .. } => {
                if is_last && !opts.follow_final_ref {
                    return Ok(Step::Found(location));
                }
                if let Some(sink) = sink.as_deref_mut() {
                    record(sink, &location, &node);
                }
                if index >= target_len {
                    chain.clear();
                }
                if location.starts_with(target) || chain.contains(&location) {
                    return Err(Error::Cycle { path: location });
                }
                chain.push(location);

                let rest = keys.split_off(index + 1);
                let carried = target_len.saturating_sub(index + 1);
                keys = target.iter().cloned().chain(rest).collect();
                target_len = target.len() + carried;
                index = 0;
                real = Path::new();
            }
        }
    }
}

fn record(sink: &mut Branch, path: &Path, node: &Node) {
    let Some((last, prefix)) = path.split_last() else {
        return;
    };
    let mut branch = sink;
    for key in prefix {
        branch = branch.branch_mut(key.clone());
    }
    branch.insert(last.clone(), node.clone());
}
