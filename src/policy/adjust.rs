//! Pure policy adjusters.
//!
//! Three independent transforms over `CachePolicy` (network quality, user
//! role, business hours), composed in a fixed order: network, then role,
//! then business hours. The order matters because the multipliers compound;
//! fixing it keeps the composition deterministic and each axis testable on
//! its own.

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};

use super::table::CachePolicy;

/// Network quality axis for policy adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkQuality {
  Wifi,
  Cellular,
  Offline,
}

/// Role of the signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
  /// Business owner
  Master,
  /// Store manager
  Manager,
  /// Regular employee
  Employee,
  /// Signed in but not attached to a store
  User,
}

impl UserRole {
  /// Owners and managers make operational decisions from this data and get
  /// tighter freshness windows.
  pub fn is_managerial(&self) -> bool {
    matches!(self, UserRole::Master | UserRole::Manager)
  }
}

/// Configurable business-hours window. Weekends are never business hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
  /// Inclusive opening hour, local time (0-23).
  pub start_hour: u32,
  /// Exclusive closing hour, local time (0-23).
  pub end_hour: u32,
}

impl Default for BusinessHours {
  fn default() -> Self {
    Self { start_hour: 9, end_hour: 22 }
  }
}

/// Whether the given local time falls inside the business-hours window.
pub fn is_business_hours(now: NaiveDateTime, window: BusinessHours) -> bool {
  match now.weekday() {
    Weekday::Sat | Weekday::Sun => false,
    _ => now.hour() >= window.start_hour && now.hour() < window.end_hour,
  }
}

/// All three adjustment axes, resolved at the moment of a policy lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyAxes {
  pub network: NetworkQuality,
  pub role: UserRole,
  pub business_hours: bool,
}

/// Adjust for network quality.
///
/// Cellular trades staleness tolerance for reduced radio usage; offline
/// trusts cached data far longer and makes no network attempts at all.
pub fn for_network(policy: &CachePolicy, quality: NetworkQuality) -> CachePolicy {
  let mut p = policy.clone();
  match quality {
    NetworkQuality::Wifi => {}
    NetworkQuality::Cellular => {
      p.stale_time = p.stale_time.mul_f64(1.5);
      p.gc_time = p.gc_time.mul_f64(1.5);
      p.retry_count = p.retry_count.saturating_sub(1).max(1);
    }
    NetworkQuality::Offline => {
      p.stale_time = p.stale_time.mul_f64(10.0);
      p.gc_time = p.gc_time.mul_f64(10.0);
      p.retry_count = 0;
    }
  }
  p
}

/// Adjust for user role: managerial roles get tighter data currency.
pub fn for_role(policy: &CachePolicy, role: UserRole) -> CachePolicy {
  let mut p = policy.clone();
  if role.is_managerial() {
    p.stale_time = p.stale_time.mul_f64(0.7);
    p.refetch_interval = p.refetch_interval.map(|i| i.mul_f64(0.8));
  }
  p
}

/// Adjust for time of day.
///
/// During business hours data is refreshed more eagerly; outside them
/// freshness is relaxed and background polling is disabled entirely.
pub fn for_business_hours(policy: &CachePolicy, in_hours: bool) -> CachePolicy {
  let mut p = policy.clone();
  if in_hours {
    p.stale_time = p.stale_time.mul_f64(0.8);
    p.refetch_interval = p.refetch_interval.map(|i| i.mul_f64(0.8));
  } else {
    p.stale_time = p.stale_time.mul_f64(2.0);
    p.gc_time = p.gc_time.mul_f64(1.5);
    p.refetch_interval = None;
  }
  p
}

/// Compose all three adjusters in the fixed order network → role → business
/// hours, then restore the `stale_time <= gc_time` invariant, which the
/// compounded multipliers can otherwise break.
pub fn effective_policy(baseline: &CachePolicy, axes: PolicyAxes) -> CachePolicy {
  let p = for_network(baseline, axes.network);
  let p = for_role(&p, axes.role);
  let mut p = for_business_hours(&p, axes.business_hours);
  if p.gc_time < p.stale_time {
    p.gc_time = p.stale_time;
  }
  p
}
