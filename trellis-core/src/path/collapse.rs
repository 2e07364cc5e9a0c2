//! Path Collapse
//!
//! The inverse of expansion: folds a list of atomic paths into a small
//! number of path specifications. Sibling keys whose subtrees have the same
//! shape are merged into a set, and runs of consecutive indices become
//! ranges. The request queue uses this to keep data source requests compact.

use indexmap::IndexMap;

use super::key::{Key, Path};
use super::spec::{KeySet, PathSet, Range};

#[derive(Default)]
struct Trie {
    children: IndexMap<Key, Trie>,
}

impl Trie {
    fn insert(&mut self, keys: &[Key]) {
        if let Some((first, rest)) = keys.split_first() {
            self.children.entry(first.clone()).or_default().insert(rest);
        }
    }

    /// Collapse this subtree into the suffixes it denotes.
    fn collapse(&self) -> Vec<Vec<KeySet>> {
        if self.children.is_empty() {
            return vec![Vec::new()];
        }

        // Children with identical suffix shapes share one key set.
        let mut groups: IndexMap<Vec<Vec<KeySet>>, Vec<Key>> = IndexMap::new();
        for (key, child) in &self.children {
            groups.entry(child.collapse()).or_default().push(key.clone());
        }

        let mut out = Vec::new();
        for (suffixes, keys) in groups {
            let head = key_set_of(keys);
            for suffix in suffixes {
                let mut segments = Vec::with_capacity(suffix.len() + 1);
                segments.push(head.clone());
                segments.extend(suffix);
                out.push(segments);
            }
        }
        out
    }
}

fn key_set_of(keys: Vec<Key>) -> KeySet {
    let mut indices = Vec::new();
    let mut members = Vec::new();
    for key in keys {
        match key {
            Key::Index(n) => indices.push(n),
            name => members.push(KeySet::Key(name)),
        }
    }
    indices.sort_unstable();

    let mut runs = Vec::new();
    let mut iter = indices.into_iter();
    if let Some(first) = iter.next() {
        let (mut from, mut to) = (first, first);
        for n in iter {
            if to.checked_add(1) == Some(n) {
                to = n;
            } else {
                runs.push(run_key_set(from, to));
                from = n;
                to = n;
            }
        }
        runs.push(run_key_set(from, to));
    }
    runs.extend(members);

    if runs.len() == 1 {
        runs.remove(0)
    } else {
        KeySet::Set(runs)
    }
}

fn run_key_set(from: i64, to: i64) -> KeySet {
    if from == to {
        KeySet::Key(Key::Index(from))
    } else {
        KeySet::Range(Range::inclusive(from, to))
    }
}

/// Fold atomic paths into path specifications covering exactly those paths.
pub fn collapse<I>(paths: I) -> Vec<PathSet>
where
    I: IntoIterator<Item = Path>,
{
    let mut by_length: IndexMap<usize, Trie> = IndexMap::new();
    for path in paths {
        if path.is_empty() {
            continue;
        }
        by_length.entry(path.len()).or_default().insert(&path);
    }

    by_length
        .values()
        .flat_map(Trie::collapse)
        .map(PathSet::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{path, pathset};

    #[test]
    fn collapses_ranges_and_sets() {
        let paths = pathset!["list", 0..=2, ["name", "age"]].expand().unwrap();
        assert_eq!(
            collapse(paths),
            vec![pathset!["list", 0..=2, ["name", "age"]]]
        );
    }

    #[test]
    fn mixed_keys_split_into_runs() {
        let paths = vec![
            path!["a", 5],
            path!["a", 0],
            path!["a", 1],
            path!["a", "x"],
        ];
        let collapsed = collapse(paths);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(
            collapsed[0],
            PathSet::from(vec![
                KeySet::from("a"),
                KeySet::Set(vec![
                    KeySet::Range(Range::inclusive(0, 1)),
                    KeySet::from(5),
                    KeySet::from("x"),
                ]),
            ])
        );
    }

    #[test]
    fn different_shapes_stay_separate() {
        let paths = vec![path!["a", "b"], path!["c"], path!["a", "d"], path!["c"]];
        let collapsed = collapse(paths.clone());
        assert_eq!(collapsed, vec![pathset!["a", ["b", "d"]], pathset!["c"]]);

        let mut expanded: Vec<Path> = collapsed.iter().flat_map(|s| s.expand().unwrap()).collect();
        expanded.sort();
        let mut expected = paths;
        expected.sort();
        expected.dedup();
        assert_eq!(expanded, expected);
    }
}
