//! Keys and Atomic Paths
//!
//! A [`Key`] is one literal segment of a path. A [`Path`] is an ordered
//! sequence of keys from the graph root, denoting exactly one graph location.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use smallvec::SmallVec;

use crate::error::PathError;

/// A literal path segment.
///
/// String keys that spell a canonical integer are normalized to
/// [`Key::Index`], so `"3"` and `3` address the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Index(i64),
    Name(String),
}

impl Key {
    /// Parse a key from its string form.
    pub fn parse(s: &str) -> Self {
        match s.parse::<i64>() {
            Ok(n) if n.to_string() == s => Key::Index(n),
            _ => Key::Name(s.to_string()),
        }
    }

    /// Read a key from a JSON string or integer.
    pub fn from_json(value: &Value) -> Result<Self, PathError> {
        match value {
            Value::String(s) => Ok(Key::parse(s)),
            Value::Number(n) => n
                .as_i64()
                .map(Key::Index)
                .ok_or_else(|| PathError::InvalidKey(n.to_string())),
            other => Err(PathError::InvalidKey(other.to_string())),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Key::Index(n) => Value::from(*n),
            Key::Name(s) => Value::String(s.clone()),
        }
    }

    /// The integer value of an index key.
    pub fn as_index(&self) -> Option<i64> {
        match self {
            Key::Index(n) => Some(*n),
            Key::Name(_) => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Index(n) => write!(f, "{}", n),
            Key::Name(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::parse(s)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::parse(&s)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Index(n)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Index(i64::from(n))
    }
}

impl From<u32> for Key {
    fn from(n: u32) -> Self {
        Key::Index(i64::from(n))
    }
}

impl From<usize> for Key {
    fn from(n: usize) -> Self {
        Key::Index(n as i64)
    }
}

/// An atomic path: a concrete sequence of keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Path(SmallVec<[Key; 8]>);

impl Path {
    /// The empty path, addressing the graph root.
    pub fn new() -> Self {
        Self(SmallVec::new())
    }

    pub fn push(&mut self, key: Key) {
        self.0.push(key);
    }

    pub fn pop(&mut self) -> Option<Key> {
        self.0.pop()
    }

    /// Concatenate `self` and `suffix` into a new path.
    pub fn join(&self, suffix: &[Key]) -> Path {
        let mut keys = self.0.clone();
        keys.extend(suffix.iter().cloned());
        Self(keys)
    }

    /// The path without its last key.
    pub fn parent(&self) -> Option<Path> {
        if self.0.is_empty() {
            None
        } else {
            Some(Path::from(&self.0[..self.0.len() - 1]))
        }
    }

    pub fn keys(&self) -> &[Key] {
        &self.0
    }

    /// Whether either path is a prefix of the other.
    pub fn overlaps(&self, other: &Path) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }

    /// Parse a path from a JSON array of keys.
    pub fn from_json(value: &Value) -> Result<Self, PathError> {
        match value {
            Value::Array(items) => items.iter().map(Key::from_json).collect(),
            other => Err(PathError::InvalidKey(other.to_string())),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.0.iter().map(Key::to_json).collect())
    }
}

impl Deref for Path {
    type Target = [Key];

    fn deref(&self) -> &[Key] {
        &self.0
    }
}

impl FromIterator<Key> for Path {
    fn from_iter<I: IntoIterator<Item = Key>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<Key>> for Path {
    fn from(keys: Vec<Key>) -> Self {
        Self(SmallVec::from_vec(keys))
    }
}

impl From<&[Key]> for Path {
    fn from(keys: &[Key]) -> Self {
        Self(keys.iter().cloned().collect())
    }
}

impl IntoIterator for Path {
    type Item = Key;
    type IntoIter = smallvec::IntoIter<[Key; 8]>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a Key;
    type IntoIter = std::slice::Iter<'a, Key>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Path::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// Build a [`Path`] from a list of key expressions.
///
/// ```rust,ignore
/// let p = path!["users", 0, "name"];
/// ```
#[macro_export]
macro_rules! path {
    () => {
        $crate::path::Path::new()
    };
    ($($key:expr),+ $(,)?) => {
        $crate::path::Path::from(vec![$($crate::path::Key::from($key)),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_integer_strings_become_indices() {
        assert_eq!(Key::parse("3"), Key::Index(3));
        assert_eq!(Key::parse("-7"), Key::Index(-7));
        assert_eq!(Key::parse("03"), Key::Name("03".into()));
        assert_eq!(Key::parse("name"), Key::Name("name".into()));
        assert_eq!(Key::from("3"), Key::from(3));
    }

    #[test]
    fn path_json_round_trip() {
        let p = path!["users", 0, "name"];
        assert_eq!(p.to_json(), json!(["users", 0, "name"]));
        assert_eq!(Path::from_json(&json!(["users", "0", "name"])).unwrap(), p);
        assert!(Path::from_json(&json!(["a", true])).is_err());
        assert!(Path::from_json(&json!("a")).is_err());
    }

    #[test]
    fn prefix_helpers() {
        let p = path!["a", "b", "c"];
        assert!(p.starts_with(&path!["a", "b"]));
        assert!(path!["a"].overlaps(&p));
        assert!(!path!["b"].overlaps(&p));
        assert_eq!(p.parent(), Some(path!["a", "b"]));
        assert_eq!(path![].parent(), None);
        assert_eq!(path!["a"].join(&path!["b", 1]), path!["a", "b", 1]);
        assert_eq!(p.to_string(), r#"["a","b","c"]"#);
    }

    #[test]
    fn slices_of_named_keys_become_paths() {
        let p = path!["users", "u1", "name"];
        assert_eq!(Path::from(&p[..2]), path!["users", "u1"]);
        assert_eq!(Path::from(&p[..0]), path![]);
    }
}
