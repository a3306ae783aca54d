//! Cache lifetime policies.
//!
//! A static table maps each data category to a baseline policy (freshness
//! window, retention window, retry bound, optional auto-refresh interval).
//! Pure adjusters then derive the effective policy for the current network
//! quality, user role, and time of day. Effective policies are never stored;
//! they are recomputed whenever any input axis changes.

mod adjust;
mod table;

pub use adjust::{
  effective_policy, for_business_hours, for_network, for_role, is_business_hours, BusinessHours,
  NetworkQuality, PolicyAxes, UserRole,
};
pub use table::{CachePolicy, Category, PolicyTable};
