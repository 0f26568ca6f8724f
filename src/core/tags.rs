//! Tag sets and tag predicates.
//!
//! A [`KeyValues`] identifies a channel inside a queue. A [`TagQuery`] is the
//! predicate a consumer dequeues with, and the selection an admission rule
//! applies to.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered key-value tag set. Ordering makes equality and hashing independent
/// of insertion order, so two identical tag sets always name the same channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyValues(BTreeMap<String, String>);

impl KeyValues {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// True when every pair of `other` is present in `self`.
    pub fn contains_all(&self, other: &KeyValues) -> bool {
        other
            .0
            .iter()
            .all(|(k, v)| self.0.get(k).is_some_and(|mine| mine == v))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for KeyValues {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<BTreeMap<String, String>> for KeyValues {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl fmt::Display for KeyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}

/// Predicate over tag sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagQuery {
    /// Matches every tag set.
    Any,
    /// Matches only the identical tag set.
    Exact(KeyValues),
    /// Matches any tag set containing all of these pairs.
    Subset(KeyValues),
}

impl TagQuery {
    pub fn matches(&self, tags: &KeyValues) -> bool {
        match self {
            TagQuery::Any => true,
            TagQuery::Exact(kv) => kv == tags,
            TagQuery::Subset(kv) => tags.contains_all(kv),
        }
    }
}

impl fmt::Display for TagQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagQuery::Any => f.write_str("*"),
            TagQuery::Exact(kv) => write!(f, "={kv}"),
            TagQuery::Subset(kv) => write!(f, "~{kv}"),
        }
    }
}
