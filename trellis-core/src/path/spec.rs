//! Path Specifications
//!
//! A [`PathSet`] is a path whose segments may denote several keys at once:
//! a literal key, a set of key sets, or an inclusive integer range.
//! Expansion produces the Cartesian product of the segments, first segment
//! varying slowest, so array-shaped results come out in order.

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use smallvec::SmallVec;

use super::key::{Key, Path};
use crate::error::PathError;

/// An inclusive integer range of index keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub from: i64,
    pub to: i64,
}

impl Range {
    /// `from..=to`. Validated when expanded.
    pub fn inclusive(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    /// `length` consecutive indices starting at `from`.
    pub fn with_length(from: i64, length: i64) -> Result<Self, PathError> {
        if length < 1 {
            return Err(PathError::InvalidLength(length));
        }
        let to = from
            .checked_add(length - 1)
            .ok_or(PathError::InvalidLength(length))?;
        Ok(Self { from, to })
    }

    fn keys(&self, out: &mut Vec<Key>) -> Result<(), PathError> {
        if self.from > self.to {
            return Err(PathError::InvalidRange {
                from: self.from,
                to: self.to,
            });
        }
        out.extend((self.from..=self.to).map(Key::Index));
        Ok(())
    }
}

/// One segment of a path specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySet {
    Key(Key),
    Range(Range),
    Set(Vec<KeySet>),
}

impl KeySet {
    /// Append the keys this segment denotes, in order.
    pub fn expand_into(&self, out: &mut Vec<Key>) -> Result<(), PathError> {
        match self {
            KeySet::Key(key) => out.push(key.clone()),
            KeySet::Range(range) => range.keys(out)?,
            KeySet::Set(members) => {
                if members.is_empty() {
                    return Err(PathError::EmptySet);
                }
                for member in members {
                    member.expand_into(out)?;
                }
            }
        }
        Ok(())
    }

    pub fn as_key(&self) -> Option<&Key> {
        match self {
            KeySet::Key(key) => Some(key),
            _ => None,
        }
    }

    /// Parse one segment of the JSON form.
    pub fn from_json(value: &Value) -> Result<Self, PathError> {
        match value {
            Value::Array(members) => members
                .iter()
                .map(KeySet::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(KeySet::Set),
            Value::Object(map) => range_from_json(map).map(KeySet::Range),
            other => Key::from_json(other).map(KeySet::Key),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeySet::Key(key) => key.to_json(),
            KeySet::Range(range) => {
                let mut map = Map::new();
                map.insert("from".into(), Value::from(range.from));
                map.insert("to".into(), Value::from(range.to));
                Value::Object(map)
            }
            KeySet::Set(members) => Value::Array(members.iter().map(KeySet::to_json).collect()),
        }
    }
}

fn integer_bound(map: &Map<String, Value>, name: &str) -> Result<Option<i64>, PathError> {
    match map.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| PathError::NonIntegerBound(value.to_string())),
    }
}

fn range_from_json(map: &Map<String, Value>) -> Result<Range, PathError> {
    let from = integer_bound(map, "from")?.unwrap_or(0);
    match (integer_bound(map, "to")?, integer_bound(map, "length")?) {
        (Some(to), _) => Ok(Range::inclusive(from, to)),
        (None, Some(length)) => Range::with_length(from, length),
        (None, None) => Err(PathError::InvalidKey(Value::Object(map.clone()).to_string())),
    }
}

impl From<Key> for KeySet {
    fn from(key: Key) -> Self {
        KeySet::Key(key)
    }
}

impl From<&str> for KeySet {
    fn from(s: &str) -> Self {
        KeySet::Key(Key::from(s))
    }
}

impl From<String> for KeySet {
    fn from(s: String) -> Self {
        KeySet::Key(Key::from(s))
    }
}

impl From<i64> for KeySet {
    fn from(n: i64) -> Self {
        KeySet::Key(Key::Index(n))
    }
}

impl From<i32> for KeySet {
    fn from(n: i32) -> Self {
        KeySet::Key(Key::from(n))
    }
}

impl From<usize> for KeySet {
    fn from(n: usize) -> Self {
        KeySet::Key(Key::from(n))
    }
}

impl From<Range> for KeySet {
    fn from(range: Range) -> Self {
        KeySet::Range(range)
    }
}

impl From<RangeInclusive<i64>> for KeySet {
    fn from(range: RangeInclusive<i64>) -> Self {
        KeySet::Range(Range::inclusive(*range.start(), *range.end()))
    }
}

impl From<RangeInclusive<i32>> for KeySet {
    fn from(range: RangeInclusive<i32>) -> Self {
        KeySet::Range(Range::inclusive(
            i64::from(*range.start()),
            i64::from(*range.end()),
        ))
    }
}

impl<T: Into<KeySet>> From<Vec<T>> for KeySet {
    fn from(members: Vec<T>) -> Self {
        KeySet::Set(members.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<KeySet>, const N: usize> From<[T; N]> for KeySet {
    fn from(members: [T; N]) -> Self {
        KeySet::Set(members.into_iter().map(Into::into).collect())
    }
}

/// A path specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PathSet(SmallVec<[KeySet; 8]>);

impl PathSet {
    pub fn segments(&self) -> &[KeySet] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Expand into the ordered list of atomic paths this specification denotes.
    pub fn expand(&self) -> Result<Vec<Path>, PathError> {
        if self.0.is_empty() {
            return Err(PathError::Empty);
        }

        let mut paths = vec![Path::new()];
        let mut keys = Vec::new();
        for segment in &self.0 {
            keys.clear();
            segment.expand_into(&mut keys)?;
            let mut next = Vec::with_capacity(paths.len() * keys.len());
            for prefix in &paths {
                for key in &keys {
                    let mut path = prefix.clone();
                    path.push(key.clone());
                    next.push(path);
                }
            }
            paths = next;
        }
        Ok(paths)
    }

    /// The atomic path, if every segment is a single key.
    pub fn as_path(&self) -> Option<Path> {
        self.0
            .iter()
            .map(|segment| segment.as_key().cloned())
            .collect::<Option<Vec<_>>>()
            .map(Path::from)
    }

    /// Prefix every segment of `self` with the keys of `prefix`.
    pub fn prefixed(&self, prefix: &Path) -> PathSet {
        prefix
            .iter()
            .cloned()
            .map(KeySet::Key)
            .chain(self.0.iter().cloned())
            .collect()
    }

    pub fn from_json(value: &Value) -> Result<Self, PathError> {
        match value {
            Value::Array(segments) => segments.iter().map(KeySet::from_json).collect(),
            other => Err(PathError::InvalidKey(other.to_string())),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.0.iter().map(KeySet::to_json).collect())
    }
}

/// Expand several specifications, concatenating their atomic paths in order.
pub fn expand_all(sets: &[PathSet]) -> Result<Vec<Path>, PathError> {
    let mut out = Vec::new();
    for set in sets {
        out.extend(set.expand()?);
    }
    Ok(out)
}

impl FromIterator<KeySet> for PathSet {
    fn from_iter<I: IntoIterator<Item = KeySet>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<KeySet>> for PathSet {
    fn from(segments: Vec<KeySet>) -> Self {
        Self(SmallVec::from_vec(segments))
    }
}

impl From<Path> for PathSet {
    fn from(path: Path) -> Self {
        path.into_iter().map(KeySet::Key).collect()
    }
}

impl From<&Path> for PathSet {
    fn from(path: &Path) -> Self {
        path.iter().cloned().map(KeySet::Key).collect()
    }
}

impl fmt::Display for PathSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for PathSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PathSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        PathSet::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// Build a [`PathSet`] from segment expressions: keys, `a..=b` ranges, or
/// `[..]` arrays of members.
///
/// ```rust,ignore
/// let spec = pathset!["users", 0..=9, ["name", "age"]];
/// ```
#[macro_export]
macro_rules! pathset {
    ($($segment:expr),+ $(,)?) => {
        $crate::path::PathSet::from(vec![$($crate::path::KeySet::from($segment)),+])
    };
}
