// src/task/resources.rs

//! Backend-specific key/value resource request attached to a task.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Separators accepted inside list-valued resources, tried in order.
const LIST_SEPARATORS: [char; 3] = ['\t', ',', ';'];

/// Free-form resource bag (`cpus`, `mem`, cloud instance parameters, ...).
///
/// Backends read the keys they understand and ignore the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(BTreeMap<String, String>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// First non-empty value found under any of `keys`.
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    /// Number of CPUs requested (`cpus` or `cpu`), defaulting to 1.
    pub fn cpus(&self) -> usize {
        self.get_any(&["cpus", "cpu"])
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<BTreeMap<String, String>> for Resources {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Split a list value on the first separator (tab, comma, semicolon) it
/// contains. A value without any separator is a one-element list.
pub fn parse_list(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    let sep = LIST_SEPARATORS.iter().find(|sep| value.contains(**sep));
    match sep {
        Some(sep) => value
            .split(*sep)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => vec![value.trim().to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_any_honours_key_order_and_skips_empty() {
        let mut r = Resources::new();
        r.insert("instanceType", "");
        r.insert("instance-type", "m5.large");
        assert_eq!(r.get_any(&["instanceType", "instance-type"]), Some("m5.large"));
        assert_eq!(r.get_any(&["region"]), None);
    }

    #[test]
    fn cpus_defaults_to_one() {
        let mut r = Resources::new();
        assert_eq!(r.cpus(), 1);
        r.insert("cpus", "4");
        assert_eq!(r.cpus(), 4);
        r.insert("cpus", "zero");
        assert_eq!(r.cpus(), 1);
    }

    #[test]
    fn lists_split_on_first_separator_present() {
        assert_eq!(parse_list("sg-1,sg-2"), vec!["sg-1", "sg-2"]);
        assert_eq!(parse_list("sg-1\tsg-2;x"), vec!["sg-1", "sg-2;x"]);
        assert_eq!(parse_list("sg-1"), vec!["sg-1"]);
        assert!(parse_list("").is_empty());
    }
}
