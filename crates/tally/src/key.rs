//! Hierarchical key model.
//!
//! Counter keys are `/`-delimited paths of alternating entity/id segment
//! pairs ending in a counter field name, e.g.
//! `users/1/products/42/order_count`. A leaf update also updates every
//! ancestor aggregate bucket; [`CounterKey::rollup_keys`] derives the
//! canonical ordered list of those ancestor keys by substituting the
//! `default` placeholder for alternating id segments.
//!
//! This is pure path logic with no storage dependency, so it can be tested
//! and reused in isolation.

/// Wildcard id segment used for ancestor rollup buckets.
pub const ROLLUP_PLACEHOLDER: &str = "default";

const DELIMITER: char = '/';

/// A hierarchical counter key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    /// Wraps a key string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the trailing counter field name from the entity path.
    ///
    /// `users/1/products/default/order_count` yields
    /// `("order_count", "users/1/products/default")`. A key without a
    /// delimiter is all field name with an empty path.
    pub fn counter_name(&self) -> (&str, &str) {
        match self.0.rsplit_once(DELIMITER) {
            Some((path, field)) => (field, path),
            None => (self.0.as_str(), ""),
        }
    }

    /// The ordered list of rollup keys a single logical update expands into.
    ///
    /// Walking the entity path, even-positioned segments emit a bucket with
    /// the following id replaced by [`ROLLUP_PLACEHOLDER`], odd-positioned id
    /// segments emit the literal bucket. An id that is already the
    /// placeholder is skipped so the same bucket is never aggregated twice.
    /// For a path of complete entity/id pairs the final element is the
    /// original full key; a key with no entity path yields an empty list.
    pub fn rollup_keys(&self) -> Vec<CounterKey> {
        let segments: Vec<&str> = self.0.split(DELIMITER).collect();
        let (field, path_segments) = match segments.split_last() {
            Some((field, rest)) => (*field, rest),
            None => return Vec::new(),
        };

        let mut result = Vec::new();
        let mut parent = String::new();
        for (i, segment) in path_segments.iter().enumerate() {
            if !parent.is_empty() {
                parent.push(DELIMITER);
            }
            parent.push_str(segment);

            if i % 2 == 1 {
                if *segment == ROLLUP_PLACEHOLDER {
                    continue;
                }
                result.push(CounterKey(format!("{parent}{DELIMITER}{field}")));
            } else {
                result.push(CounterKey(format!(
                    "{parent}{DELIMITER}{ROLLUP_PLACEHOLDER}{DELIMITER}{field}"
                )));
            }
        }

        result
    }
}

impl From<&str> for CounterKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for CounterKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `/`-delimited entity path without a trailing counter field.
///
/// [`NestedKey::prefixes`] enumerates the entity scopes a path belongs to:
/// each prefix ending at an id segment, narrowest last.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NestedKey(String);

impl NestedKey {
    /// Wraps an entity path string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefixes of the path ending at each id segment, in order.
    ///
    /// `users/1/products/42` yields `["users/1", "users/1/products/42"]`.
    pub fn prefixes(&self) -> Vec<NestedKey> {
        let segments: Vec<&str> = self.0.split(DELIMITER).collect();
        segments
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 2 == 1)
            .map(|(i, _)| NestedKey(segments[..=i].join("/")))
            .collect()
    }
}

impl From<&str> for NestedKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}
