//! Connection parameters, the cache key of every adapter

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// Ordered string to string mapping describing one connection
///
/// Two parameter sets are equal when their key/value content is identical,
/// whatever order the keys were inserted in. Absent keys and empty values are
/// treated alike by the accessors.
#[derive(Clone, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct ConnectionParams(BTreeMap<String, String>);

impl ConnectionParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key`, or "" when unset
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn is_set(&self, key: &str) -> bool {
        !self.get(key).is_empty()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Fill `key` with `value` when it is unset or empty
    pub fn set_default(&mut self, key: &str, value: &str) {
        if !self.is_set(key) {
            self.0.insert(key.to_string(), value.to_string());
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// First non-empty value among `keys`
    pub fn first_of<'a>(&'a self, keys: &[&str]) -> &'a str {
        keys.iter()
            .map(|k| self.get(k))
            .find(|v| !v.is_empty())
            .unwrap_or("")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Apply `f` to every value (used for environment substitution)
    pub fn try_map_values<E>(self, mut f: impl FnMut(&str) -> Result<String, E>) -> Result<Self, E> {
        let mut out = BTreeMap::new();
        for (k, v) in self.0 {
            let mapped = f(&v)?;
            out.insert(k, mapped);
        }
        Ok(Self(out))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConnectionParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in &self.0 {
            if k == "password" {
                map.entry(k, &"***");
            } else {
                map.entry(k, v);
            }
        }
        map.finish()
    }
}
