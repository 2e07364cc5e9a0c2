//! Graph Cache Store
//!
//! The store is a tree of [`Node`]s rooted at a [`Branch`], plus the
//! bookkeeping needed to bound its size:
//!
//! - every leaf has an entry recording its size and the tick at which it
//!   was last touched;
//! - `recency` orders leaves from least to most recently touched;
//! - `expired` collects leaves the resolver found expired, so they are the
//!   first to go;
//! - `pins` protects paths that in-flight requests still need.
//!
//! The store never follows references. That is the resolver's job.

use std::collections::{BTreeMap, HashMap};

use indexmap::IndexSet;
use tracing::{debug, trace};

use super::node::{Branch, Node};
use crate::error::{Error, Result};
use crate::path::{Key, Path};

/// Default size bound: effectively unbounded.
pub const DEFAULT_MAX_SIZE: usize = (1 << 53) - 1;

/// Default fraction of `max_size` that eviction shrinks the cache to.
pub const DEFAULT_COLLECT_RATIO: f64 = 0.75;

#[derive(Debug, Clone, Copy)]
struct Entry {
    size: usize,
    tick: u64,
}

/// The graph cache.
#[derive(Debug)]
pub struct GraphCache {
    root: Branch,
    entries: HashMap<Path, Entry>,
    recency: BTreeMap<u64, Path>,
    expired: IndexSet<Path>,
    pins: HashMap<Path, usize>,
    clock: u64,
    generation: u64,
    size: usize,
    max_size: usize,
    collect_ratio: f64,
}

impl GraphCache {
    /// Create an empty cache with the given bound.
    pub fn new(max_size: usize, collect_ratio: f64) -> Self {
        Self {
            root: Branch::new(),
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            expired: IndexSet::new(),
            pins: HashMap::new(),
            clock: 0,
            generation: 0,
            size: 0,
            max_size,
            collect_ratio,
        }
    }

    pub fn root(&self) -> &Branch {
        &self.root
    }

    /// Total size of all leaves.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The generation stamped on leaves by the current write.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new write generation and return it.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// The node stored exactly at `path`, without following references.
    pub fn get(&self, path: &[Key]) -> Option<&Node> {
        let (last, prefix) = match path.split_last() {
            Some(split) => split,
            None => return None,
        };
        let mut branch = &self.root;
        for key in prefix {
            match branch.get(key)? {
                Node::Branch(child) => branch = child,
                _ => return None,
            }
        }
        branch.get(last)
    }

    pub fn has(&self, path: &[Key]) -> bool {
        self.get(path).is_some()
    }

    /// Store `node` at `path`, creating intermediate branches.
    ///
    /// Whatever was at `path` is replaced wholesale. A leaf on the way down
    /// is a structural error.
    pub fn set(&mut self, path: &Path, node: Node) -> Result<()> {
        self.write(path, node, false)?;
        self.collect_if_needed();
        Ok(())
    }

    /// Merge a fragment from a data source into the cache.
    ///
    /// Fragments are authoritative: leaves in the way are replaced. Returns
    /// the generation stamped on the merged leaves.
    /// Merge `fragment` with every leaf it carries pinned beforehand, so the
    /// collection pass that may follow cannot evict them. Returns the
    /// generation and the pinned paths; the caller owns those pins.
    pub fn merge_pinned(&mut self, fragment: &Node) -> (u64, Vec<Path>) {
        let mut leaves = Vec::new();
        collect_leaves(&Path::new(), fragment, &mut leaves);
        let pinned: Vec<Path> = leaves
            .into_iter()
            .map(|(path, _)| path)
            .filter(|path| !path.is_empty())
            .collect();
        for path in &pinned {
            self.pin(path);
        }
        (self.merge(fragment), pinned)
    }

    pub fn merge(&mut self, fragment: &Node) -> u64 {
        let generation = self.next_generation();
        match fragment {
            Node::Branch(branch) => {
                for (key, child) in branch.iter() {
                    let mut path = Path::new();
                    path.push(key.clone());
                    self.merge_at(path, child);
                }
            }
            leaf => debug!(kind = leaf.kind(), "ignoring fragment that is not rooted at a branch"),
        }
        self.collect_if_needed();
        generation
    }

    fn merge_at(&mut self, path: Path, node: &Node) {
        match node {
            Node::Branch(branch) => {
                if branch.is_empty() {
                    return;
                }
                for (key, child) in branch.iter() {
                    let mut child_path = path.clone();
                    child_path.push(key.clone());
                    self.merge_at(child_path, child);
                }
            }
            leaf => {
                if let Err(err) = self.write(&path, leaf.clone(), true) {
                    debug!(%path, %err, "dropping fragment leaf");
                }
            }
        }
    }

    fn write(&mut self, path: &Path, mut node: Node, force: bool) -> Result<()> {
        let Some((last, prefix)) = path.split_last() else {
            return Err(Error::Structural {
                path: Path::new(),
                kind: "root",
            });
        };

        let now = super::now_ms();
        stamp(&mut node, self.generation, now);
        let mut added = Vec::new();
        collect_leaves(path, &node, &mut added);

        let mut displaced = Vec::new();
        let old = {
            let mut branch = &mut self.root;
            for (depth, key) in prefix.iter().enumerate() {
                if let Some(leaf) = branch.get(key).filter(|child| child.is_leaf()) {
                    let at = Path::from(&prefix[..=depth]);
                    if !force {
                        return Err(Error::Structural {
                            path: at,
                            kind: leaf.kind(),
                        });
                    }
                    trace!(path = %at, kind = leaf.kind(), "replacing leaf with branch");
                    displaced.push(at);
                }
                branch = branch.branch_mut(key.clone());
            }
            branch.insert(last.clone(), node)
        };

        for at in displaced {
            self.forget(&at);
        }
        if let Some(old) = old {
            let mut removed = Vec::new();
            collect_leaves(path, &old, &mut removed);
            for (at, _) in removed {
                self.forget(&at);
            }
        }
        for (at, size) in added {
            self.remember(at, size);
        }
        Ok(())
    }

    /// Remove whatever is stored at `path`, pruning emptied branches.
    pub fn remove(&mut self, path: &Path) -> Option<Node> {
        let (last, prefix) = path.split_last()?;
        let removed = branch_at_mut(&mut self.root, prefix)?.remove(last)?;

        let mut leaves = Vec::new();
        collect_leaves(path, &removed, &mut leaves);
        for (at, _) in leaves {
            self.forget(&at);
        }
        self.prune(prefix);
        Some(removed)
    }

    /// Drop empty branches along `prefix`, deepest first.
    fn prune(&mut self, prefix: &[Key]) {
        for depth in (0..prefix.len()).rev() {
            let (key, parent) = (&prefix[depth], &prefix[..depth]);
            let Some(branch) = branch_at_mut(&mut self.root, parent) else {
                return;
            };
            match branch.get(key) {
                Some(Node::Branch(child)) if child.is_empty() => {
                    branch.remove(key);
                }
                _ => return,
            }
        }
    }

    /// Mark the leaf at `path` as most recently used.
    pub fn touch(&mut self, path: &Path) {
        if let Some(entry) = self.entries.get_mut(path) {
            self.recency.remove(&entry.tick);
            self.clock += 1;
            entry.tick = self.clock;
            self.recency.insert(self.clock, path.clone());
        }
    }

    /// Note that the leaf at `path` was found expired.
    pub fn record_expired(&mut self, path: &Path) {
        self.expired.insert(path.clone());
    }

    /// Paths found expired and not yet collected.
    pub fn expired(&self) -> impl Iterator<Item = &Path> {
        self.expired.iter()
    }

    /// Protect `path` (and anything on its way) from eviction.
    pub fn pin(&mut self, path: &Path) {
        *self.pins.entry(path.clone()).or_insert(0) += 1;
    }

    pub fn unpin(&mut self, path: &Path) {
        if let Some(count) = self.pins.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(path);
            }
        }
    }

    pub fn is_pinned(&self, path: &Path) -> bool {
        self.pins.keys().any(|pinned| pinned.overlaps(path))
    }

    fn collect_if_needed(&mut self) {
        if self.size > self.max_size {
            self.evict_to_target();
        }
    }

    /// Evict leaves until the cache is back under `max_size * collect_ratio`.
    ///
    /// Expired leaves go first, then the least recently touched. Pinned
    /// leaves are skipped. Returns the number of leaves evicted.
    pub fn evict_to_target(&mut self) -> usize {
        if self.size <= self.max_size {
            return 0;
        }
        let target = (self.max_size as f64 * self.collect_ratio) as usize;
        let before = self.size;
        let mut evicted = 0;

        let now = super::now_ms();
        let expired: Vec<Path> = self.expired.drain(..).collect();
        for path in expired {
            let still_expired = self
                .get(&path)
                .and_then(Node::meta)
                .map(|meta| meta.is_expired(now, &[]))
                .unwrap_or(false);
            if still_expired && !self.is_pinned(&path) && self.remove(&path).is_some() {
                evicted += 1;
            }
        }

        let order: Vec<Path> = self.recency.values().cloned().collect();
        for path in order {
            if self.size <= target {
                break;
            }
            if self.is_pinned(&path) {
                continue;
            }
            if self.remove(&path).is_some() {
                evicted += 1;
            }
        }

        debug!(before, after = self.size, target, evicted, "cache eviction pass");
        evicted
    }

    /// The whole cache in JSON Graph form.
    pub fn to_json(&self) -> serde_json::Value {
        Node::Branch(self.root.clone()).to_json()
    }

    fn remember(&mut self, path: Path, size: usize) {
        self.clock += 1;
        self.size += size;
        self.recency.insert(self.clock, path.clone());
        self.entries.insert(
            path,
            Entry {
                size,
                tick: self.clock,
            },
        );
    }

    fn forget(&mut self, path: &Path) {
        if let Some(entry) = self.entries.remove(path) {
            self.size -= entry.size;
            self.recency.remove(&entry.tick);
        }
        self.expired.shift_remove(path);
    }
}

impl Default for GraphCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, DEFAULT_COLLECT_RATIO)
    }
}

fn branch_at_mut<'a>(root: &'a mut Branch, keys: &[Key]) -> Option<&'a mut Branch> {
    let mut branch = root;
    for key in keys {
        match branch.get_mut(key)? {
            Node::Branch(child) => branch = child,
            _ => return None,
        }
    }
    Some(branch)
}

fn stamp(node: &mut Node, generation: u64, now: i64) {
    match node {
        Node::Branch(branch) => {
            let keys: Vec<_> = branch.iter().map(|(key, _)| key.clone()).collect();
            for key in keys {
                if let Some(child) = branch.get_mut(&key) {
                    stamp(child, generation, now);
                }
            }
        }
        leaf => {
            if let Some(meta) = leaf.meta_mut() {
                meta.generation = generation;
                meta.timestamp.get_or_insert(now);
            }
        }
    }
}

fn collect_leaves(path: &Path, node: &Node, out: &mut Vec<(Path, usize)>) {
    match node {
        Node::Branch(branch) => {
            for (key, child) in branch.iter() {
                let mut child_path = path.clone();
                child_path.push(key.clone());
                collect_leaves(&child_path, child, out);
            }
        }
        leaf => out.push((path.clone(), leaf.size())),
    }
}
