//! Graph Nodes
//!
//! This module defines the node types that live in the graph cache, their
//! expiration metadata, and their JSON Graph representation.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::PathError;
use crate::path::{Key, Path};

/// Raw `$expires` value meaning "expired as soon as it has been delivered".
pub const EXPIRES_NOW: i64 = 0;

/// Raw `$expires` value meaning "never expires".
pub const EXPIRES_NEVER: i64 = 1;

/// Fixed cost charged for every leaf, on top of its payload.
pub(crate) const NODE_BASE_SIZE: usize = 50;

const TYPE_KEY: &str = "$type";
const EXPIRES_KEY: &str = "$expires";
const TIMESTAMP_KEY: &str = "$timestamp";

/// When a leaf stops being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expires {
    /// The leaf is valid until it is replaced or evicted.
    #[default]
    Never,

    /// The leaf is handed to the request that wrote it and is expired for
    /// everyone after that.
    Now,

    /// Absolute expiry time in epoch milliseconds.
    At(i64),
}

impl Expires {
    /// Interpret a raw JSON Graph `$expires` value.
    ///
    /// `0` and `1` are the `EXPIRES_NOW`/`EXPIRES_NEVER` sentinels, negative
    /// values are relative to `now`, anything else is absolute.
    pub fn from_raw(raw: i64, now: i64) -> Self {
        match raw {
            EXPIRES_NOW => Expires::Now,
            EXPIRES_NEVER => Expires::Never,
            relative if relative < 0 => Expires::At(now.saturating_sub(relative)),
            absolute => Expires::At(absolute),
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            Expires::Never => EXPIRES_NEVER,
            Expires::Now => EXPIRES_NOW,
            Expires::At(at) => at,
        }
    }
}

/// Metadata carried by every leaf.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Meta {
    pub expires: Expires,
    pub timestamp: Option<i64>,
    /// Write generation that last stored this leaf.
    pub(crate) generation: u64,
}

impl Meta {
    /// Whether the leaf is expired at `now`.
    ///
    /// `EXPIRES_NOW` leaves are still usable by whoever holds one of the
    /// `fresh` generations that wrote them.
    pub fn is_expired(&self, now: i64, fresh: &[u64]) -> bool {
        match self.expires {
            Expires::Never => false,
            Expires::Now => !fresh.contains(&self.generation),
            Expires::At(at) => at <= now,
        }
    }
}

/// An interior node: ordered children by key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Branch {
    children: IndexMap<Key, Node>,
}

impl Branch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Key) -> Option<&Node> {
        self.children.get(key)
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut Node> {
        self.children.get_mut(key)
    }

    pub fn insert(&mut self, key: Key, node: Node) -> Option<Node> {
        self.children.insert(key, node)
    }

    pub fn remove(&mut self, key: &Key) -> Option<Node> {
        self.children.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Node)> {
        self.children.iter()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Fold `other` into this branch. Leaves in `other` win.
    pub fn absorb(&mut self, other: Branch) {
        for (key, node) in other.children {
            match node {
                Node::Branch(incoming) => self.branch_mut(key).absorb(incoming),
                leaf => {
                    self.children.insert(key, leaf);
                }
            }
        }
    }

    /// Get the child at `key`, turning it into a branch if it is not one.
    pub(crate) fn branch_mut(&mut self, key: Key) -> &mut Branch {
        let child = self
            .children
            .entry(key)
            .or_insert_with(|| Node::Branch(Branch::new()));
        if !matches!(child, Node::Branch(_)) {
            *child = Node::Branch(Branch::new());
        }
        match child {
            Node::Branch(branch) => branch,
            _ => unreachable!("child was just made a branch"),
        }
    }
}

/// A node in the graph cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Container of child nodes.
    Branch(Branch),

    /// Terminal value. A `null` atom records that the path holds nothing.
    Atom { value: Value, meta: Meta },

    /// Redirect to another absolute path.
    Ref { target: Path, meta: Meta },

    /// Error sentinel: resolution stops here and reports `value`.
    Error { value: Value, meta: Meta },
}

impl Default for Node {
    fn default() -> Self {
        Node::Branch(Branch::new())
    }
}

impl Node {
    pub fn atom(value: impl Into<Value>) -> Self {
        Node::Atom {
            value: value.into(),
            meta: Meta::default(),
        }
    }

    pub fn reference(target: Path) -> Self {
        Node::Ref {
            target,
            meta: Meta::default(),
        }
    }

    pub fn error(value: impl Into<Value>) -> Self {
        Node::Error {
            value: value.into(),
            meta: Meta::default(),
        }
    }

    pub fn with_expires(mut self, expires: Expires) -> Self {
        if let Some(meta) = self.meta_mut() {
            meta.expires = expires;
        }
        self
    }

    /// Short name of the variant, for messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Branch(_) => "branch",
            Node::Atom { .. } => "atom",
            Node::Ref { .. } => "ref",
            Node::Error { .. } => "error",
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self, Node::Branch(_))
    }

    pub fn meta(&self) -> Option<&Meta> {
        match self {
            Node::Branch(_) => None,
            Node::Atom { meta, .. } | Node::Ref { meta, .. } | Node::Error { meta, .. } => {
                Some(meta)
            }
        }
    }

    pub fn meta_mut(&mut self) -> Option<&mut Meta> {
        match self {
            Node::Branch(_) => None,
            Node::Atom { meta, .. } | Node::Ref { meta, .. } | Node::Error { meta, .. } => {
                Some(meta)
            }
        }
    }

    /// Size charged against the cache bound. Branches are free.
    pub fn size(&self) -> usize {
        match self {
            Node::Branch(_) => 0,
            Node::Atom { value, .. } | Node::Error { value, .. } => {
                NODE_BASE_SIZE + payload_size(value)
            }
            Node::Ref { target, .. } => NODE_BASE_SIZE + target.len(),
        }
    }

    /// Parse a JSON Graph value. Relative expirations are anchored at `now`.
    pub fn from_json(value: &Value, now: i64) -> Result<Self, PathError> {
        let map = match value {
            Value::Object(map) => map,
            other => return Ok(Node::atom(other.clone())),
        };

        let Some(kind) = map.get(TYPE_KEY) else {
            let mut branch = Branch::new();
            for (key, child) in map {
                branch.insert(Key::parse(key), Node::from_json(child, now)?);
            }
            return Ok(Node::Branch(branch));
        };

        let meta = Meta {
            expires: map
                .get(EXPIRES_KEY)
                .and_then(Value::as_i64)
                .map(|raw| Expires::from_raw(raw, now))
                .unwrap_or_default(),
            timestamp: map.get(TIMESTAMP_KEY).and_then(Value::as_i64),
            generation: 0,
        };
        let payload = map.get("value").cloned().unwrap_or(Value::Null);

        match kind.as_str() {
            Some("ref") => Ok(Node::Ref {
                target: Path::from_json(&payload)?,
                meta,
            }),
            Some("error") => Ok(Node::Error {
                value: payload,
                meta,
            }),
            Some("atom") => Ok(Node::Atom {
                value: payload,
                meta,
            }),
            _ => Err(PathError::InvalidKey(format!("unknown {}: {}", TYPE_KEY, kind))),
        }
    }

    /// The JSON Graph form. Plain atoms come out bare.
    pub fn to_json(&self) -> Value {
        match self {
            Node::Branch(branch) => Value::Object(
                branch
                    .iter()
                    .map(|(key, child)| (key.to_string(), child.to_json()))
                    .collect(),
            ),
            Node::Atom { value, meta }
                if meta.expires == Expires::Never && !value.is_object() && !value.is_array() =>
            {
                value.clone()
            }
            Node::Atom { .. } | Node::Ref { .. } | Node::Error { .. } => self.envelope(false),
        }
    }

    /// The leaf wrapped in its `$type` envelope with all of its metadata.
    pub fn boxed(&self) -> Value {
        self.envelope(true)
    }

    fn envelope(&self, with_timestamp: bool) -> Value {
        let (kind, value, meta) = match self {
            Node::Branch(_) => return self.to_json(),
            Node::Atom { value, meta } => ("atom", value.clone(), meta),
            Node::Ref { target, meta } => ("ref", target.to_json(), meta),
            Node::Error { value, meta } => ("error", value.clone(), meta),
        };
        let mut map = Map::new();
        map.insert(TYPE_KEY.into(), Value::from(kind));
        map.insert("value".into(), value);
        if meta.expires != Expires::Never {
            map.insert(EXPIRES_KEY.into(), Value::from(meta.expires.to_raw()));
        }
        if let Some(timestamp) = meta.timestamp.filter(|_| with_timestamp) {
            map.insert(TIMESTAMP_KEY.into(), Value::from(timestamp));
        }
        Value::Object(map)
    }
}

fn payload_size(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        Value::Array(_) | Value::Object(_) => value.to_string().len(),
        Value::Null | Value::Bool(_) | Value::Number(_) => 0,
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Node::from_json(&value, super::now_ms()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use serde_json::json;

    #[test]
    fn parses_sentinels_and_branches() {
        let node = Node::from_json(
            &json!({
                "users": {
                    "0": {"$type": "ref", "value": ["usersById", "u1"]},
                    "length": 1
                },
                "broken": {"$type": "error", "value": "boom"},
                "config": {"$type": "atom", "value": {"a": 1}, "$expires": 1}
            }),
            0,
        )
        .unwrap();

        let Node::Branch(root) = node else {
            panic!("expected branch");
        };
        let Some(Node::Branch(users)) = root.get(&Key::from("users")) else {
            panic!("expected users branch");
        };
        assert_eq!(
            users.get(&Key::Index(0)),
            Some(&Node::reference(path!["usersById", "u1"]))
        );
        assert_eq!(users.get(&Key::from("length")), Some(&Node::atom(1)));
        assert_eq!(root.get(&Key::from("broken")), Some(&Node::error("boom")));
        assert!(matches!(
            root.get(&Key::from("config")),
            Some(Node::Atom { value, .. }) if value == &json!({"a": 1})
        ));
    }

    #[test]
    fn expiration_sentinels() {
        assert_eq!(Expires::from_raw(EXPIRES_NOW, 100), Expires::Now);
        assert_eq!(Expires::from_raw(EXPIRES_NEVER, 100), Expires::Never);
        assert_eq!(Expires::from_raw(-50, 100), Expires::At(150));
        assert_eq!(Expires::from_raw(5000, 100), Expires::At(5000));

        let meta = Meta {
            expires: Expires::At(150),
            ..Meta::default()
        };
        assert!(!meta.is_expired(149, &[]));
        assert!(meta.is_expired(150, &[]));

        let meta = Meta {
            expires: Expires::Now,
            timestamp: None,
            generation: 7,
        };
        assert!(meta.is_expired(0, &[]));
        assert!(!meta.is_expired(0, &[7]));
    }

    #[test]
    fn json_form_boxes_only_when_needed() {
        assert_eq!(Node::atom("x").to_json(), json!("x"));
        assert_eq!(
            Node::atom("x").with_expires(Expires::At(9)).to_json(),
            json!({"$type": "atom", "value": "x", "$expires": 9})
        );
        assert_eq!(
            Node::reference(path!["a", 1]).to_json(),
            json!({"$type": "ref", "value": ["a", 1]})
        );
        assert!(Node::from_json(&json!({"$type": "bogus"}), 0).is_err());
    }

    #[test]
    fn absorb_merges_nested_branches() {
        let Node::Branch(mut left) = Node::from_json(&json!({"a": {"x": 1}, "b": 2}), 0).unwrap()
        else {
            panic!("expected branch");
        };
        let Node::Branch(right) = Node::from_json(&json!({"a": {"y": 3}, "b": {"z": 4}}), 0).unwrap()
        else {
            panic!("expected branch");
        };
        left.absorb(right);
        assert_eq!(
            Node::Branch(left).to_json(),
            json!({"a": {"x": 1, "y": 3}, "b": {"z": 4}})
        );
    }

    #[test]
    fn leaf_sizes() {
        assert_eq!(Node::atom(1).size(), NODE_BASE_SIZE);
        assert_eq!(Node::atom("abcd").size(), NODE_BASE_SIZE + 4);
        assert_eq!(Node::reference(path!["a", "b"]).size(), NODE_BASE_SIZE + 2);
        assert_eq!(Node::Branch(Branch::new()).size(), 0);
    }
}
