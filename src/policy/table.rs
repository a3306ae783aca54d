//! Baseline cache policies per data category.

use std::time::Duration;

/// Data categories served by the ShiftDesk API.
///
/// Categories are tiered by volatility: operational data that drives
/// on-the-spot decisions (current attendance) stays near-real-time, while
/// reference material (policy documents) is fresh for hours. The tiering
/// bounds redundant network calls for data that rarely changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
  /// Session / token validity
  Auth,
  /// Current attendance status (checked-in, on break, ...)
  Attendance,
  /// Store roster and store-level settings
  Store,
  /// Payroll statements and summaries
  Payroll,
  /// Announcements and notices
  Notice,
  /// The signed-in user's profile
  Profile,
  /// Policy documents and other static reference text
  Reference,
}

impl Category {
  /// The key segment used as the first element of cache keys.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Auth => "auth",
      Self::Attendance => "attendance",
      Self::Store => "store",
      Self::Payroll => "payroll",
      Self::Notice => "notice",
      Self::Profile => "profile",
      Self::Reference => "reference",
    }
  }

  /// Parse a category from a key segment. Unknown strings return `None`;
  /// the policy table falls back to its default policy for those.
  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "auth" => Some(Self::Auth),
      "attendance" => Some(Self::Attendance),
      "store" => Some(Self::Store),
      "payroll" => Some(Self::Payroll),
      "notice" => Some(Self::Notice),
      "profile" => Some(Self::Profile),
      "reference" => Some(Self::Reference),
      _ => None,
    }
  }
}

impl std::fmt::Display for Category {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Cache lifetime parameters for one category.
///
/// The same shape describes both a baseline (straight from the table) and an
/// effective policy (baseline run through the adjusters).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
  /// How long a cached entry is served without a network call.
  pub stale_time: Duration,
  /// How long a cached entry is retained before reclamation.
  /// Invariant: `stale_time <= gc_time`.
  pub gc_time: Duration,
  /// Total fetch attempts before an entry lands in error status.
  /// Zero means no network attempts at all (offline mode).
  pub retry_count: u32,
  /// Base delay for exponential backoff between attempts.
  pub retry_base_delay: Duration,
  /// Upper bound on any single backoff delay.
  pub retry_delay_cap: Duration,
  /// Background auto-refresh interval, if this category polls.
  pub refetch_interval: Option<Duration>,
}

impl CachePolicy {
  /// Backoff delay before retrying after the given zero-based attempt:
  /// `min(base * 2^attempt, cap)`.
  pub fn retry_delay(&self, attempt: u32) -> Duration {
    self
      .retry_base_delay
      .checked_mul(2u32.saturating_pow(attempt.min(16)))
      .unwrap_or(self.retry_delay_cap)
      .min(self.retry_delay_cap)
  }
}

const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(1000);
const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(30);

/// Static lookup table of baseline policies.
///
/// `lookup` is total: unrecognized categories get a conservative default
/// rather than an error.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable;

impl PolicyTable {
  pub fn new() -> Self {
    Self
  }

  /// Baseline policy for a category key segment.
  pub fn lookup(&self, category: &str) -> CachePolicy {
    match Category::parse(category) {
      Some(c) => self.baseline(c),
      None => Self::default_policy(),
    }
  }

  /// Baseline policy for a known category.
  pub fn baseline(&self, category: Category) -> CachePolicy {
    let (stale, gc, retries, refetch) = match category {
      Category::Auth => (Duration::from_secs(5 * 60), Duration::from_secs(60 * 60), 1, None),
      Category::Attendance => (
        Duration::from_secs(30),
        Duration::from_secs(5 * 60),
        3,
        Some(Duration::from_secs(60)),
      ),
      Category::Store => (Duration::from_secs(2 * 60), Duration::from_secs(10 * 60), 2, None),
      Category::Payroll => (Duration::from_secs(10 * 60), Duration::from_secs(60 * 60), 2, None),
      Category::Notice => (Duration::from_secs(5 * 60), Duration::from_secs(30 * 60), 2, None),
      Category::Profile => (Duration::from_secs(10 * 60), Duration::from_secs(60 * 60), 2, None),
      Category::Reference => (
        Duration::from_secs(6 * 60 * 60),
        Duration::from_secs(24 * 60 * 60),
        1,
        None,
      ),
    };

    CachePolicy {
      stale_time: stale,
      gc_time: gc,
      retry_count: retries,
      retry_base_delay: DEFAULT_RETRY_BASE,
      retry_delay_cap: DEFAULT_RETRY_CAP,
      refetch_interval: refetch,
    }
  }

  /// Fallback for unrecognized categories.
  fn default_policy() -> CachePolicy {
    CachePolicy {
      stale_time: Duration::from_secs(5 * 60),
      gc_time: Duration::from_secs(30 * 60),
      retry_count: 2,
      retry_base_delay: DEFAULT_RETRY_BASE,
      retry_delay_cap: DEFAULT_RETRY_CAP,
      refetch_interval: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const ALL: [Category; 7] = [
    Category::Auth,
    Category::Attendance,
    Category::Store,
    Category::Payroll,
    Category::Notice,
    Category::Profile,
    Category::Reference,
  ];

  #[test]
  fn every_baseline_keeps_freshness_within_retention() {
    let table = PolicyTable::new();
    for category in ALL {
      let p = table.baseline(category);
      assert!(
        p.stale_time <= p.gc_time,
        "{} baseline has stale_time > gc_time",
        category
      );
    }
  }

  #[test]
  fn unknown_category_falls_back_to_default() {
    let table = PolicyTable::new();
    let p = table.lookup("definitely-not-a-category");
    assert_eq!(p, PolicyTable::default_policy());
    assert!(p.stale_time <= p.gc_time);
  }

  #[test]
  fn lookup_matches_baseline_for_known_categories() {
    let table = PolicyTable::new();
    for category in ALL {
      assert_eq!(table.lookup(category.as_str()), table.baseline(category));
    }
  }

  #[test]
  fn attendance_is_near_real_time_and_reference_is_not() {
    let table = PolicyTable::new();
    let attendance = table.baseline(Category::Attendance);
    let reference = table.baseline(Category::Reference);

    assert_eq!(attendance.stale_time, Duration::from_secs(30));
    assert_eq!(attendance.refetch_interval, Some(Duration::from_secs(60)));
    assert!(reference.stale_time >= Duration::from_secs(60 * 60));
    assert_eq!(reference.refetch_interval, None);
  }

  #[test]
  fn retry_delay_is_exponential_and_capped() {
    let p = PolicyTable::new().baseline(Category::Attendance);
    assert_eq!(p.retry_delay(0), Duration::from_millis(1000));
    assert_eq!(p.retry_delay(1), Duration::from_millis(2000));
    assert_eq!(p.retry_delay(2), Duration::from_millis(4000));
    assert_eq!(p.retry_delay(10), Duration::from_secs(30));
  }
}
