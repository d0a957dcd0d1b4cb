//! Tag sets attached to samples and check results.
//!
//! Tags are opaque key/value labels. The engine never interprets them; they
//! exist purely so samples can be grouped and filtered (`endpoint=cursor-based`,
//! `test_type=soak`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while parsing a tag filter such as `endpoint:limit-offset,method=GET`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TagParseError {
    #[error("Tag pair '{0}' must be written as key:value or key=value")]
    MissingSeparator(String),

    #[error("Tag pair '{0}' has an empty key")]
    EmptyKey(String),

    #[error("Tag key '{0}' appears more than once")]
    DuplicateKey(String),
}

/// Ordered mapping of tag keys to values.
///
/// Ordering is by key so that two sets with the same content compare and
/// display identically regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tag set from string pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
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

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a new set containing `self` overlaid with `overrides`.
    ///
    /// Keys present in both take the value from `overrides`.
    pub fn merged(&self, overrides: &TagSet) -> TagSet {
        let mut out = self.0.clone();
        for (k, v) in &overrides.0 {
            out.insert(k.clone(), v.clone());
        }
        TagSet(out)
    }

    /// True when every key/value in `filter` is present in `self` with the
    /// same value. Extra tags on `self` are ignored; an empty filter matches all.
    pub fn matches(&self, filter: &TagSet) -> bool {
        filter
            .0
            .iter()
            .all(|(k, v)| self.0.get(k).is_some_and(|mine| mine == v))
    }
}

impl FromStr for TagSet {
    type Err = TagParseError;

    /// Parses `key:value,key2=value2`. Whitespace around keys and values is
    /// trimmed; an empty string yields an empty set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tags = BTreeMap::new();

        for raw in s.split(',') {
            let pair = raw.trim();
            if pair.is_empty() {
                continue;
            }

            let split_at = pair
                .find([':', '='])
                .ok_or_else(|| TagParseError::MissingSeparator(pair.to_string()))?;
            let key = pair[..split_at].trim();
            let value = pair[split_at + 1..].trim();

            if key.is_empty() {
                return Err(TagParseError::EmptyKey(pair.to_string()));
            }
            if tags.insert(key.to_string(), value.to_string()).is_some() {
                return Err(TagParseError::DuplicateKey(key.to_string()));
            }
        }

        Ok(TagSet(tags))
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
        write!(f, "{{{}}}", pairs.join(","))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}
