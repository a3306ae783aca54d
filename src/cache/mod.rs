//! Keyed query cache with stale-while-revalidate reads.
//!
//! This module provides the process-wide cache layer:
//! - Structured, prefix-comparable keys (category first)
//! - Per-entry freshness and retention windows from the effective policy
//! - Deduplicated fetches (one in flight per key) with joined waiters
//! - Invalidation by key prefix or predicate, keeping stale data servable

mod key;
mod store;

pub use key::{KeySegment, QueryKey};
pub use store::{CacheSource, EntryStatus, FetchResult, QueryCache, Snapshot};
