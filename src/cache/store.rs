//! Process-wide keyed store of fetched results.
//!
//! Entries carry freshness and retention windows derived from the effective
//! policy at fetch time. Reads are stale-while-revalidate: a stale entry is
//! served immediately while a background refresh runs. At most one fetch is
//! in flight per key; concurrent callers join it. Completions that arrive
//! after the entry was superseded (by a direct write or a forced refetch)
//! are discarded rather than applied.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::policy::CachePolicy;
use crate::remote::ApiError;
use crate::retry::{retry_with_backoff, RetryOutcome, RetryPolicy};

use super::key::QueryKey;

/// Fetch cycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  Idle,
  Fetching,
  Success,
  Error,
}

/// Where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data straight from the network
  Network,
  /// Cached data still inside its freshness window
  CacheFresh,
  /// Cached data past freshness; a background refresh is in flight
  CacheStale,
  /// Cached data served because the policy forbids network attempts
  Offline,
}

/// Result of a cache fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
  pub data: Value,
  pub source: CacheSource,
  /// True when a background refresh for this key is in flight.
  pub revalidating: bool,
}

/// Point-in-time view of an entry, for pure reads.
#[derive(Debug, Clone)]
pub struct Snapshot {
  pub data: Value,
  pub fetched_at: Option<Instant>,
  pub is_fresh: bool,
  pub status: EntryStatus,
  /// Attempts made in the current fetch cycle.
  pub retry_count: u32,
  pub last_error: Option<String>,
}

type FetchOutcome = Result<Value, ApiError>;

struct InFlight {
  seq: u64,
  done: broadcast::Sender<FetchOutcome>,
}

struct Entry {
  data: Option<Value>,
  fetched_at: Option<Instant>,
  fresh_until: Option<Instant>,
  evict_until: Option<Instant>,
  status: EntryStatus,
  retry_count: u32,
  observers: usize,
  last_error: Option<String>,
  /// Bumped by every started fetch and every direct write. A completion is
  /// applied only when its sequence still matches, so superseded results
  /// never overwrite newer ones.
  fetch_seq: u64,
  in_flight: Option<InFlight>,
}

impl Entry {
  fn empty() -> Self {
    Self {
      data: None,
      fetched_at: None,
      fresh_until: None,
      evict_until: None,
      status: EntryStatus::Idle,
      retry_count: 0,
      observers: 0,
      last_error: None,
      fetch_seq: 0,
      in_flight: None,
    }
  }

  fn is_fresh(&self, now: Instant) -> bool {
    self.fresh_until.is_some_and(|t| now < t)
  }

  fn apply_success(&mut self, data: Value, policy: &CachePolicy) {
    let now = Instant::now();
    self.data = Some(data);
    self.fetched_at = Some(now);
    self.fresh_until = Some(now + policy.stale_time);
    // The adjusters guarantee stale_time <= gc_time, so fresh_until never
    // outlives evict_until.
    self.evict_until = Some(now + policy.gc_time);
    self.status = EntryStatus::Success;
    self.retry_count = 0;
    self.last_error = None;
  }
}

/// The query cache. Cheap to clone; clones share the same store.
///
/// Explicitly constructed and passed by handle to its consumers rather than
/// living in ambient module state, so tests get isolated instances.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Mutex<HashMap<QueryKey, Entry>>>,
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new()
  }
}

impl QueryCache {
  pub fn new() -> Self {
    Self { inner: Arc::new(Mutex::new(HashMap::new())) }
  }

  /// Drop all entries. In-flight fetches complete against fresh entries and
  /// are discarded.
  pub fn clear(&self) {
    self.map().clear();
  }

  fn map(&self) -> MutexGuard<'_, HashMap<QueryKey, Entry>> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Pure read: the current entry, if any data is cached for the key.
  pub fn get(&self, key: &QueryKey) -> Option<Snapshot> {
    let map = self.map();
    let entry = map.get(key)?;
    let data = entry.data.clone()?;
    Some(Snapshot {
      data,
      fetched_at: entry.fetched_at,
      is_fresh: entry.is_fresh(Instant::now()),
      status: entry.status,
      retry_count: entry.retry_count,
      last_error: entry.last_error.clone(),
    })
  }

  /// Direct cache population, used after a successful mutation to avoid an
  /// unnecessary refetch. Supersedes any in-flight fetch for the key.
  pub fn write(&self, key: &QueryKey, data: Value, policy: &CachePolicy) {
    let mut map = self.map();
    let entry = map.entry(key.clone()).or_insert_with(Entry::empty);
    entry.fetch_seq += 1;
    entry.in_flight = None;
    entry.apply_success(data, policy);
  }

  /// Mark all entries under `prefix` stale. Data is kept and remains
  /// servable while the next read refetches.
  pub fn invalidate_prefix(&self, prefix: &QueryKey) {
    self.invalidate_where(|key| key.starts_with(prefix));
  }

  /// Mark all entries matching `predicate` stale.
  pub fn invalidate_where(&self, predicate: impl Fn(&QueryKey) -> bool) {
    let now = Instant::now();
    let mut map = self.map();
    for (key, entry) in map.iter_mut() {
      if predicate(key) && entry.fresh_until.is_some() {
        entry.fresh_until = Some(now);
      }
    }
  }

  /// Delete all entries under `prefix` outright (destructive mutations).
  pub fn remove_prefix(&self, prefix: &QueryKey) {
    self.remove_where(|key| key.starts_with(prefix));
  }

  /// Delete all entries matching `predicate` outright.
  pub fn remove_where(&self, predicate: impl Fn(&QueryKey) -> bool) {
    self.map().retain(|key, _| !predicate(key));
  }

  /// Reclaim entries past their retention window with no observers. Run
  /// periodically rather than on every operation.
  pub fn evict_expired(&self) {
    let now = Instant::now();
    self.map().retain(|_, entry| {
      entry.observers > 0
        || entry.in_flight.is_some()
        || (entry.data.is_some() && entry.evict_until.is_some_and(|t| now < t))
    });
  }

  /// Register an active reader for a key; observed entries are never
  /// reclaimed by `evict_expired`.
  pub fn observe(&self, key: &QueryKey) {
    let mut map = self.map();
    map.entry(key.clone()).or_insert_with(Entry::empty).observers += 1;
  }

  pub fn unobserve(&self, key: &QueryKey) {
    if let Some(entry) = self.map().get_mut(key) {
      entry.observers = entry.observers.saturating_sub(1);
    }
  }

  /// Stale-while-revalidate read.
  ///
  /// Fresh entries are returned without a network call. Stale entries are
  /// returned immediately while a background refresh runs (at most one per
  /// key). Missing entries await the fetch; concurrent callers for the same
  /// key join the single in-flight request and receive the same value.
  ///
  /// A policy with `retry_count == 0` makes no network attempt: a cached
  /// value (however stale) is served, otherwise `ApiError::Offline`.
  pub async fn fetch<F, Fut>(
    &self,
    key: &QueryKey,
    policy: &CachePolicy,
    fetcher: F,
  ) -> Result<FetchResult, ApiError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchOutcome> + Send + 'static,
  {
    let mut rx = {
      let mut map = self.map();
      let entry = map.entry(key.clone()).or_insert_with(Entry::empty);
      let now = Instant::now();

      if let Some(data) = entry.data.clone() {
        if entry.is_fresh(now) {
          return Ok(FetchResult {
            data,
            source: CacheSource::CacheFresh,
            revalidating: entry.in_flight.is_some(),
          });
        }
        if policy.retry_count == 0 {
          return Ok(FetchResult { data, source: CacheSource::Offline, revalidating: false });
        }
        // Stale: serve immediately, refresh in the background.
        if entry.in_flight.is_none() {
          self.begin_fetch(entry, key, policy, fetcher);
        }
        return Ok(FetchResult { data, source: CacheSource::CacheStale, revalidating: true });
      }

      if policy.retry_count == 0 {
        return Err(ApiError::Offline);
      }

      match &entry.in_flight {
        Some(in_flight) => in_flight.done.subscribe(),
        None => self.begin_fetch(entry, key, policy, fetcher),
      }
    };

    match rx.recv().await {
      Ok(Ok(data)) => {
        Ok(FetchResult { data, source: CacheSource::Network, revalidating: false })
      }
      Ok(Err(error)) => Err(error),
      Err(_) => Err(ApiError::Transport("fetch task dropped".into())),
    }
  }

  /// Await a network-fresh value for the key, joining any in-flight fetch.
  /// Used by the sync controller to re-validate categories.
  pub async fn revalidate<F, Fut>(
    &self,
    key: &QueryKey,
    policy: &CachePolicy,
    fetcher: F,
  ) -> Result<Value, ApiError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchOutcome> + Send + 'static,
  {
    if policy.retry_count == 0 {
      return Err(ApiError::Offline);
    }
    let mut rx = {
      let mut map = self.map();
      let entry = map.entry(key.clone()).or_insert_with(Entry::empty);
      match &entry.in_flight {
        Some(in_flight) => in_flight.done.subscribe(),
        None => self.begin_fetch(entry, key, policy, fetcher),
      }
    };
    match rx.recv().await {
      Ok(outcome) => outcome,
      Err(_) => Err(ApiError::Transport("fetch task dropped".into())),
    }
  }

  /// Force a fresh fetch, superseding any in-flight request for the key
  /// (manual pull-to-refresh). The superseded fetch's completion is
  /// discarded when it eventually arrives.
  pub async fn refetch<F, Fut>(
    &self,
    key: &QueryKey,
    policy: &CachePolicy,
    fetcher: F,
  ) -> Result<Value, ApiError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchOutcome> + Send + 'static,
  {
    if policy.retry_count == 0 {
      return Err(ApiError::Offline);
    }
    let mut rx = {
      let mut map = self.map();
      let entry = map.entry(key.clone()).or_insert_with(Entry::empty);
      self.begin_fetch(entry, key, policy, fetcher)
    };
    match rx.recv().await {
      Ok(outcome) => outcome,
      Err(_) => Err(ApiError::Transport("fetch task dropped".into())),
    }
  }

  /// Keep a key polling at the policy's auto-refresh interval. Returns
  /// `None` when the policy has no interval (e.g. outside business hours).
  /// Abort the returned handle to stop polling.
  pub fn spawn_auto_refresh<F, Fut>(
    &self,
    key: QueryKey,
    policy: CachePolicy,
    fetcher: F,
  ) -> Option<tokio::task::JoinHandle<()>>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchOutcome> + Send + 'static,
  {
    let interval = policy.refetch_interval?;
    let cache = self.clone();
    let fetcher = Arc::new(fetcher);
    Some(tokio::spawn(async move {
      loop {
        tokio::time::sleep(interval).await;
        let f = fetcher.clone();
        if let Err(error) = cache.revalidate(&key, &policy, move || f()).await {
          warn!(key = %key, %error, "auto-refresh failed");
        }
      }
    }))
  }

  /// Start a fetch task for the entry. Caller holds the map lock; the entry
  /// must have no in-flight fetch unless it is being superseded on purpose.
  fn begin_fetch<F, Fut>(
    &self,
    entry: &mut Entry,
    key: &QueryKey,
    policy: &CachePolicy,
    fetcher: F,
  ) -> broadcast::Receiver<FetchOutcome>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchOutcome> + Send + 'static,
  {
    entry.fetch_seq += 1;
    let seq = entry.fetch_seq;
    entry.status = EntryStatus::Fetching;
    let (tx, rx) = broadcast::channel(4);
    entry.in_flight = Some(InFlight { seq, done: tx.clone() });

    let cache = self.clone();
    let key = key.clone();
    let policy = policy.clone();
    tokio::spawn(async move {
      let retry = RetryPolicy {
        max_attempts: policy.retry_count.max(1),
        base_delay: policy.retry_base_delay,
        cap: policy.retry_delay_cap,
      };
      let outcome = retry_with_backoff(retry, ApiError::is_retryable, |_| fetcher()).await;
      let result = cache.complete_fetch(&key, &policy, seq, outcome);
      // Applied to the cache before waiters resolve, so a caller awaiting
      // the fetch and then reading the cache observes the applied state.
      let _ = tx.send(result);
    });
    rx
  }

  /// Apply a fetch completion, unless a newer fetch or write superseded it.
  fn complete_fetch(
    &self,
    key: &QueryKey,
    policy: &CachePolicy,
    seq: u64,
    outcome: RetryOutcome<Value, ApiError>,
  ) -> FetchOutcome {
    let result = match outcome {
      RetryOutcome::Success(data) => Ok(data),
      RetryOutcome::Exhausted { attempts, error } => Err((attempts, error)),
    };

    {
      let mut map = self.map();
      if let Some(entry) = map.get_mut(key) {
        if entry.in_flight.as_ref().is_some_and(|f| f.seq == seq) {
          entry.in_flight = None;
          match &result {
            Ok(data) => entry.apply_success(data.clone(), policy),
            Err((attempts, error)) => {
              // Last good value stays servable alongside the error.
              entry.status = EntryStatus::Error;
              entry.retry_count = *attempts;
              entry.last_error = Some(error.to_string());
              warn!(key = %key, attempts, %error, "fetch failed");
            }
          }
        } else {
          debug!(key = %key, seq, "discarding superseded fetch completion");
        }
      }
    }

    let result = result.map_err(|(_, error)| error);
    if let Err(error) = &result {
      if error.is_auth() {
        // 401 invalidates the auth category; re-authentication is the
        // surrounding application's job.
        self.invalidate_prefix(&QueryKey::new("auth"));
      }
    }
    result
  }

  /// Number of live entries, for sync status and diagnostics.
  pub fn len(&self) -> usize {
    self.map().len()
  }

  pub fn is_empty(&self) -> bool {
    self.map().is_empty()
  }

  /// Keys of all live entries. Used by the sync controller to find the
  /// cached categories that need bulk invalidation.
  pub fn keys(&self) -> Vec<QueryKey> {
    self.map().keys().cloned().collect()
  }
}
