//! Structured cache keys.
//!
//! A key is an ordered sequence of segments, category first, e.g.
//! `["attendance", "store", 42]`. Keeping the segments structured (instead of
//! hashing them) is what makes bulk invalidation by prefix possible.

use std::fmt;

/// One segment of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySegment {
  Text(String),
  Id(u64),
}

impl fmt::Display for KeySegment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeySegment::Text(s) => f.write_str(s),
      KeySegment::Id(n) => write!(f, "{}", n),
    }
  }
}

impl From<&str> for KeySegment {
  fn from(s: &str) -> Self {
    KeySegment::Text(s.to_string())
  }
}

impl From<String> for KeySegment {
  fn from(s: String) -> Self {
    KeySegment::Text(s)
  }
}

impl From<u64> for KeySegment {
  fn from(n: u64) -> Self {
    KeySegment::Id(n)
  }
}

/// An ordered, prefix-comparable cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
  segments: Vec<KeySegment>,
}

impl QueryKey {
  /// A key rooted at a category segment, e.g. `QueryKey::new("attendance")`.
  pub fn new(category: &str) -> Self {
    Self { segments: vec![KeySegment::from(category)] }
  }

  /// Append a sub-scope segment, builder style:
  /// `QueryKey::new("attendance").segment("store").segment(42)`.
  pub fn segment(mut self, seg: impl Into<KeySegment>) -> Self {
    self.segments.push(seg.into());
    self
  }

  /// The category this key belongs to (its first segment).
  pub fn category(&self) -> &str {
    match self.segments.first() {
      Some(KeySegment::Text(s)) => s,
      // An id as the first segment would be a caller bug; treat it as an
      // unrecognized category so policy lookup falls back to the default.
      _ => "",
    }
  }

  pub fn segments(&self) -> &[KeySegment] {
    &self.segments
  }

  /// Whether `prefix` is a (possibly complete) leading run of this key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.segments.len() >= prefix.segments.len()
      && self.segments[..prefix.segments.len()] == prefix.segments[..]
  }
}

/// Joins segments with `:` for log lines and error messages.
impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, seg) in self.segments.iter().enumerate() {
      if i > 0 {
        f.write_str(":")?;
      }
      write!(f, "{}", seg)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn prefix_matching() {
    let key = QueryKey::new("attendance").segment("store").segment(42u64);

    assert!(key.starts_with(&QueryKey::new("attendance")));
    assert!(key.starts_with(&QueryKey::new("attendance").segment("store")));
    assert!(key.starts_with(&key.clone()));
    assert!(!key.starts_with(&QueryKey::new("payroll")));
    assert!(!key.starts_with(&QueryKey::new("attendance").segment("store").segment(7u64)));

    // A longer prefix never matches a shorter key.
    let longer = key.clone().segment("detail");
    assert!(!key.starts_with(&longer));
  }

  #[test]
  fn category_is_first_segment() {
    let key = QueryKey::new("payroll").segment(2024u64).segment(7u64);
    assert_eq!(key.category(), "payroll");
  }

  #[test]
  fn display_joins_with_colons() {
    let key = QueryKey::new("attendance").segment("store").segment(42u64);
    assert_eq!(key.to_string(), "attendance:store:42");
  }
}
