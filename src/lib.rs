//! Client-side cache and synchronization layer for the ShiftDesk workforce
//! app.
//!
//! The app's screens are thin CRUD wrappers over a remote API; what this
//! crate provides is the part with actual state: a keyed query cache with
//! stale-while-revalidate reads, cache lifetimes that adapt to network
//! quality, user role, and business hours, a queue for writes issued while
//! offline, and a controller that reconciles cache state with the remote
//! source of truth across connectivity transitions.
//!
//! # Overview
//!
//! - [`policy`]: baseline cache lifetimes per data category, plus the pure
//!   adjusters that derive the effective policy for the current conditions.
//! - [`cache`]: the process-wide query cache with structured keys, fetch
//!   dedupe, and prefix invalidation.
//! - [`mutation`]: writes queued while offline, replayed in order on
//!   reconnect with bounded retry.
//! - [`network`]: connectivity snapshots and deduplicated transition events.
//! - [`sync`]: the orchestrator reacting to reconnect and foreground
//!   transitions with prioritized re-validation.
//! - [`remote`]: the request/response boundary to the API, with the typed
//!   error taxonomy that drives retry decisions.

pub mod cache;
pub mod config;
pub mod mutation;
pub mod network;
pub mod policy;
pub mod remote;
pub mod retry;
pub mod sync;

pub use cache::{CacheSource, FetchResult, QueryCache, QueryKey};
pub use config::SyncConfig;
pub use mutation::{MutationQueue, MutationStatus, SubmitOutcome};
pub use network::{NetworkMonitor, NetworkState, Transition};
pub use policy::{CachePolicy, Category, PolicyTable, UserRole};
pub use remote::{ApiError, ApiRequest, HttpRemote, RemoteSource};
pub use retry::{retry_with_backoff, RetryOutcome, RetryPolicy};
pub use sync::{SyncController, SyncReport, SyncState, SyncTrigger};
