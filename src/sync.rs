//! Synchronization controller.
//!
//! Reacts to connectivity and foreground transitions, drives prioritized
//! re-validation of the query cache (critical categories first, then bulk),
//! resumes paused mutations, and exposes the current sync status. At most
//! one sync cycle is in flight at a time; a forced manual sync supersedes a
//! running cycle and discards its outcome.

use chrono::{DateTime, Local, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cache::{QueryCache, QueryKey};
use crate::config::SyncConfig;
use crate::mutation::MutationQueue;
use crate::network::{NetworkMonitor, Transition};
use crate::policy::{effective_policy, is_business_hours, CachePolicy, PolicyAxes, PolicyTable, UserRole};
use crate::remote::ApiError;
use crate::retry::{retry_with_backoff, RetryOutcome};

/// Categories re-validated with priority during a sync cycle, in order.
/// Everything else is bulk.
pub const CRITICAL_CATEGORIES: [&str; 3] = ["auth", "attendance", "store"];

/// Observable sync status, for UI indicators.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
  pub is_online: bool,
  /// True only while a sync cycle is in flight.
  pub is_syncing: bool,
  pub last_sync_time: Option<DateTime<Utc>>,
  /// Failures from the last cycle's re-validation steps, plus mutations in
  /// terminal failed state. The latter stay visible across cycles until
  /// resolved or pruned.
  pub sync_errors: Vec<String>,
  pub pending_mutation_count: usize,
}

/// What initiated a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  Reconnect,
  Foreground,
  Manual { force: bool },
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone)]
pub struct SyncReport {
  /// False when the cycle was refused because one was already running.
  pub ran: bool,
  pub errors: Vec<String>,
  /// At least one error was transient (timeout, transport, 5xx). Only these
  /// make re-running the cycle worthwhile; a terminally failed mutation
  /// stays failed no matter how often the cycle repeats.
  pub has_transient_errors: bool,
}

impl SyncReport {
  fn skipped() -> Self {
    Self { ran: false, errors: Vec::new(), has_transient_errors: false }
  }
}

struct Revalidator {
  category: String,
  key: QueryKey,
  fetch: Arc<dyn Fn() -> BoxFuture<'static, Result<Value, ApiError>> + Send + Sync>,
}

impl Clone for Revalidator {
  fn clone(&self) -> Self {
    Self { category: self.category.clone(), key: self.key.clone(), fetch: self.fetch.clone() }
  }
}

/// The orchestrator tying cache, mutation queue, and network monitor
/// together.
pub struct SyncController {
  cache: QueryCache,
  mutations: MutationQueue,
  network: Arc<NetworkMonitor>,
  table: PolicyTable,
  role: UserRole,
  config: SyncConfig,
  revalidators: Mutex<Vec<Revalidator>>,
  status: watch::Sender<SyncState>,
  /// Id of the most recently started cycle; a superseded cycle must not
  /// stamp the final status.
  cycle: AtomicU64,
  syncing: AtomicBool,
}

impl SyncController {
  pub fn new(
    cache: QueryCache,
    mutations: MutationQueue,
    network: Arc<NetworkMonitor>,
    config: SyncConfig,
    role: UserRole,
  ) -> Self {
    let initial = SyncState {
      is_online: network.current().is_connected,
      is_syncing: false,
      last_sync_time: None,
      sync_errors: Vec::new(),
      pending_mutation_count: mutations.pending_count(),
    };
    let (status, _) = watch::channel(initial);
    Self {
      cache,
      mutations,
      network,
      table: PolicyTable::new(),
      role,
      config,
      revalidators: Mutex::new(Vec::new()),
      status,
      cycle: AtomicU64::new(0),
      syncing: AtomicBool::new(false),
    }
  }

  /// The effective cache policy for a category right now, from the current
  /// network quality, the signed-in role, and the local wall clock. This is
  /// the entry point surrounding service code calls before each fetch.
  pub fn effective_policy(&self, category: &str) -> CachePolicy {
    let axes = PolicyAxes {
      network: self.network.current().quality(),
      role: self.role,
      business_hours: is_business_hours(
        Local::now().naive_local(),
        self.config.business_hours.into(),
      ),
    };
    effective_policy(&self.table.lookup(category), axes)
  }

  /// Register how a category's root query is refetched during sync cycles.
  pub fn register_revalidator<F, Fut>(&self, category: &str, key: QueryKey, fetch: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, ApiError>> + Send + 'static,
  {
    let fetch: Arc<dyn Fn() -> BoxFuture<'static, Result<Value, ApiError>> + Send + Sync> =
      Arc::new(move || Box::pin(fetch()));
    self.revalidators.lock().unwrap_or_else(|p| p.into_inner()).push(Revalidator {
      category: category.to_string(),
      key,
      fetch,
    });
  }

  /// Current sync status snapshot.
  pub fn status(&self) -> SyncState {
    self.status.borrow().clone()
  }

  /// Subscribe to sync status changes (for a "syncing..." banner).
  pub fn subscribe_status(&self) -> watch::Receiver<SyncState> {
    self.status.subscribe()
  }

  /// Manual sync trigger (pull-to-refresh). `force` supersedes a running
  /// cycle instead of being refused.
  pub async fn trigger_sync(&self, force: bool) -> SyncReport {
    self.sync(SyncTrigger::Manual { force }).await
  }

  /// App returned to the foreground.
  pub async fn on_foreground(&self) -> SyncReport {
    if self.config.sync_on_foreground && self.network.current().is_connected {
      self.sync(SyncTrigger::Foreground).await
    } else {
      SyncReport::skipped()
    }
  }

  /// React to a connectivity transition.
  pub async fn handle_transition(&self, transition: Transition) {
    match transition {
      Transition::WentOffline => self.enable_offline_mode(),
      Transition::WentOnline => self.restore_online_mode().await,
    }
  }

  /// Disconnect: hold back writes. Cached reads stretch automatically
  /// because effective policies are recomputed from the current network
  /// state on every fetch.
  fn enable_offline_mode(&self) {
    info!("entering offline mode");
    self.mutations.pause_all();
    let pending = self.mutations.pending_count();
    self.status.send_modify(|s| {
      s.is_online = false;
      s.pending_mutation_count = pending;
    });
  }

  /// Reconnect: queued writes land via the sync cycle's mutation-resume
  /// step; the reconnect cycle itself is retried so the transition is not
  /// lost to a flaky first attempt.
  async fn restore_online_mode(&self) {
    info!("restoring online mode");
    self.status.send_modify(|s| s.is_online = true);

    if self.config.sync_on_reconnect {
      self.sync_with_retry(SyncTrigger::Reconnect).await;
    } else {
      // Reconnect sync disabled: still replay queued writes.
      let errors = self.mutations.resume_all().await;
      let pending = self.mutations.pending_count();
      self.status.send_modify(|s| {
        s.sync_errors.extend(errors);
        s.pending_mutation_count = pending;
      });
    }
  }

  /// One sync cycle, strictly ordered:
  /// 1. re-validate critical categories (failures collected, not aborting),
  /// 2. invalidate and re-validate the remaining cached categories,
  /// 3. resume paused mutations.
  pub async fn sync(&self, trigger: SyncTrigger) -> SyncReport {
    let force = matches!(trigger, SyncTrigger::Manual { force: true });
    if self.syncing.swap(true, Ordering::SeqCst) && !force {
      debug!(?trigger, "sync already in progress, skipping");
      return SyncReport::skipped();
    }
    let my_cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
    info!(?trigger, cycle = my_cycle, "sync cycle started");
    self.status.send_modify(|s| {
      s.is_syncing = true;
      s.sync_errors.clear();
    });

    let revalidators: Vec<Revalidator> =
      self.revalidators.lock().unwrap_or_else(|p| p.into_inner()).clone();
    let mut errors = Vec::new();
    let mut transient = false;

    // Step 1: critical categories, in priority order. Each category is
    // marked stale first, so entries without a registered revalidator
    // refetch on their next read; the registered roots are then refreshed.
    for category in CRITICAL_CATEGORIES {
      self.cache.invalidate_prefix(&QueryKey::new(category));
      for r in revalidators.iter().filter(|r| r.category == category) {
        if let Err(error) = self.run_revalidator(r).await {
          transient |= error.is_retryable();
          errors.push(format!("{}: {}", r.category, error));
        }
      }
    }

    // Step 2: mark everything else stale, then refetch what has a
    // registered revalidator. Unregistered entries refetch lazily on their
    // next read.
    self
      .cache
      .invalidate_where(|key| !CRITICAL_CATEGORIES.contains(&key.category()));
    for r in revalidators.iter().filter(|r| !CRITICAL_CATEGORIES.contains(&r.category.as_str())) {
      if let Err(error) = self.run_revalidator(r).await {
        transient |= error.is_retryable();
        errors.push(format!("{}: {}", r.category, error));
      }
    }

    // Step 3: replay writes queued while offline. Failures here are
    // terminal; the queue already retried them within its own bounds.
    let replay_errors = self.mutations.resume_all().await;

    self.cache.evict_expired();

    // Terminal mutation failures stay in the stamped status until resolved
    // or pruned, including across retried cycles that start with a clean
    // error slate.
    let failed_mutations: Vec<String> = self
      .mutations
      .failed()
      .into_iter()
      .map(|m| format!("mutation '{}' failed: {}", m.label, m.last_error.unwrap_or_default()))
      .collect();

    if self.cycle.load(Ordering::SeqCst) == my_cycle {
      self.syncing.store(false, Ordering::SeqCst);
      let pending = self.mutations.pending_count();
      let mut stamped_errors = errors.clone();
      stamped_errors.extend(failed_mutations);
      self.status.send_modify(move |s| {
        s.is_syncing = false;
        s.last_sync_time = Some(Utc::now());
        s.sync_errors = stamped_errors;
        s.pending_mutation_count = pending;
      });
      info!(cycle = my_cycle, errors = errors.len(), "sync cycle finished");
    } else {
      debug!(cycle = my_cycle, "sync cycle superseded by forced sync, outcome discarded");
    }

    errors.extend(replay_errors);
    SyncReport { ran: true, errors, has_transient_errors: transient }
  }

  /// Wrap a whole sync cycle in bounded exponential backoff, for triggers
  /// that need guaranteed delivery (reconnect). Only cycles with transient
  /// failures are re-run; terminal failures (permanently failed mutations,
  /// non-retryable responses) would repeat identically.
  pub async fn sync_with_retry(&self, trigger: SyncTrigger) -> SyncReport {
    let outcome = retry_with_backoff(self.config.reconnect_retry.into(), |_| true, |attempt| async move {
      if attempt > 0 {
        info!(attempt, "retrying sync cycle");
      }
      let report = self.sync(trigger).await;
      if report.has_transient_errors {
        Err(report)
      } else {
        Ok(report)
      }
    })
    .await;

    match outcome {
      RetryOutcome::Success(report) => report,
      RetryOutcome::Exhausted { error, .. } => error,
    }
  }

  async fn run_revalidator(&self, r: &Revalidator) -> Result<Value, ApiError> {
    let policy = self.effective_policy(&r.category);
    let fetch = r.fetch.clone();
    self.cache.revalidate(&r.key, &policy, move || fetch()).await
  }

  /// Listen for connectivity transitions until the monitor is dropped.
  pub fn spawn_transition_listener(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
    let mut rx = self.network.subscribe();
    tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(transition) => self.handle_transition(transition).await,
          Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
          Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::NetworkState;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  fn quick_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.reconnect_retry = crate::config::RetryConfig { max_attempts: 3, base_delay_ms: 10, cap_ms: 50 };
    config
  }

  fn init_tracing() {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
  }

  fn controller_with(network: Arc<NetworkMonitor>) -> (Arc<SyncController>, QueryCache, MutationQueue) {
    init_tracing();
    let cache = QueryCache::new();
    let mutations = MutationQueue::new(cache.clone());
    let controller = Arc::new(SyncController::new(
      cache.clone(),
      mutations.clone(),
      network,
      quick_config(),
      UserRole::Employee,
    ));
    (controller, cache, mutations)
  }

  #[tokio::test]
  async fn reconnect_flow_resumes_mutations_and_syncs_critical_first() {
    let network = Arc::new(NetworkMonitor::new(NetworkState::offline()));
    let (controller, cache, mutations) = controller_with(network.clone());

    // Execution order across revalidators and resumed mutations.
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let order_auth = order.clone();
    controller.register_revalidator("auth", QueryKey::new("auth").segment("session"), move || {
      let order = order_auth.clone();
      async move {
        order.lock().unwrap().push("auth");
        Ok(json!({"valid": true}))
      }
    });
    let order_notice = order.clone();
    controller.register_revalidator("notice", QueryKey::new("notice"), move || {
      let order = order_notice.clone();
      async move {
        order.lock().unwrap().push("notice");
        Ok(json!([]))
      }
    });

    // Two writes queued while offline.
    for name in ["mutation-1", "mutation-2"] {
      let order = order.clone();
      mutations.enqueue(name, vec![], true, move || {
        let order = order.clone();
        async move {
          order.lock().unwrap().push(name);
          Ok(())
        }
      });
    }

    // An unregistered bulk category that should end up invalidated.
    let payroll_key = QueryKey::new("payroll").segment(7u64);
    cache.write(&payroll_key, json!("cached"), &controller.effective_policy("payroll"));

    let _listener = controller.clone().spawn_transition_listener();
    assert!(!controller.status().is_online);

    network.set_state(NetworkState::online_wifi());

    // Give the listener time to run the full cycle.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = controller.status();
    assert!(status.is_online);
    assert!(!status.is_syncing);
    assert!(status.last_sync_time.is_some());
    assert!(status.sync_errors.is_empty());
    assert_eq!(status.pending_mutation_count, 0);

    // Critical before bulk; mutations resumed last, in enqueue order.
    assert_eq!(*order.lock().unwrap(), vec!["auth", "notice", "mutation-1", "mutation-2"]);

    // Bulk invalidation: the unregistered payroll entry is stale.
    assert!(!cache.get(&payroll_key).unwrap().is_fresh);
    // Critical revalidation repopulated auth fresh.
    assert!(cache.get(&QueryKey::new("auth").segment("session")).unwrap().is_fresh);
  }

  #[tokio::test]
  async fn overlapping_sync_is_refused_unless_forced() {
    let network = Arc::new(NetworkMonitor::new(NetworkState::online_wifi()));
    let (controller, _cache, _mutations) = controller_with(network);

    controller.register_revalidator("store", QueryKey::new("store").segment(1u64), || async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(json!({"id": 1}))
    });

    let background = {
      let controller = controller.clone();
      tokio::spawn(async move { controller.trigger_sync(false).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(controller.status().is_syncing);

    // A plain sync is refused while one is running.
    let second = controller.trigger_sync(false).await;
    assert!(!second.ran);

    // A forced sync runs anyway.
    let forced = controller.trigger_sync(true).await;
    assert!(forced.ran);

    let first = background.await.unwrap();
    assert!(first.ran);
    assert!(!controller.status().is_syncing);
  }

  #[tokio::test]
  async fn going_offline_pauses_mutations() {
    let network = Arc::new(NetworkMonitor::new(NetworkState::online_wifi()));
    let (controller, _cache, mutations) = controller_with(network.clone());

    let id = mutations.enqueue("stranded", vec![], false, || async { Ok(()) });

    let _listener = controller.clone().spawn_transition_listener();
    network.set_state(NetworkState::offline());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let status = controller.status();
    assert!(!status.is_online);
    assert_eq!(status.pending_mutation_count, 1);
    assert_eq!(
      mutations.record(id).unwrap().status,
      crate::mutation::MutationStatus::Paused
    );
  }

  #[tokio::test(start_paused = true)]
  async fn sync_with_retry_recovers_from_a_flaky_cycle() {
    let network = Arc::new(NetworkMonitor::new(NetworkState::online_wifi()));
    let (controller, _cache, _mutations) = controller_with(network);

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();
    controller.register_revalidator("attendance", QueryKey::new("attendance"), move || {
      let attempts = attempts_clone.clone();
      async move {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
          Err(ApiError::Server { status: 502, body: None })
        } else {
          Ok(json!({"status": "checked_in"}))
        }
      }
    });

    let report = controller.sync_with_retry(SyncTrigger::Reconnect).await;
    assert!(report.ran);
    assert!(report.errors.is_empty());
    assert!(attempts.load(Ordering::SeqCst) >= 2);
  }

  #[tokio::test]
  async fn permanently_failed_mutation_stays_in_sync_errors() {
    let network = Arc::new(NetworkMonitor::new(NetworkState::offline()));
    let (controller, _cache, mutations) = controller_with(network.clone());

    // A write the server will always reject.
    mutations.enqueue("rejected-write", vec![], true, || async {
      Err(ApiError::Forbidden { body: None })
    });

    let _listener = controller.clone().spawn_transition_listener();
    network.set_state(NetworkState::online_wifi());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = controller.status();
    assert!(status.last_sync_time.is_some());
    assert_eq!(mutations.failed().len(), 1);
    // The terminal failure is still visible after the reconnect cycle has
    // settled; nothing re-stamped the status clean.
    assert_eq!(status.sync_errors.len(), 1);
    assert!(status.sync_errors[0].contains("rejected-write"));
  }

  #[tokio::test]
  async fn critical_entries_without_revalidators_are_invalidated() {
    let network = Arc::new(NetworkMonitor::new(NetworkState::online_wifi()));
    let (controller, cache, _mutations) = controller_with(network);

    controller.register_revalidator("attendance", QueryKey::new("attendance"), || async {
      Ok(json!({"status": "checked_in"}))
    });
    let sub_key = QueryKey::new("attendance").segment("store").segment(42u64);
    cache.write(&sub_key, json!("cached"), &controller.effective_policy("attendance"));

    let report = controller.trigger_sync(false).await;
    assert!(report.ran);
    assert!(report.errors.is_empty());

    // The registered root came back fresh; the unregistered sub-entry must
    // refetch on its next read instead of surviving the cycle fresh.
    assert!(cache.get(&QueryKey::new("attendance")).unwrap().is_fresh);
    assert!(!cache.get(&sub_key).unwrap().is_fresh);
  }

  #[tokio::test]
  async fn foreground_sync_respects_config_and_connectivity() {
    let network = Arc::new(NetworkMonitor::new(NetworkState::offline()));
    let (controller, _cache, _mutations) = controller_with(network.clone());

    // Offline: no foreground sync.
    let report = controller.on_foreground().await;
    assert!(!report.ran);

    network.set_state(NetworkState::online_wifi());
    let report = controller.on_foreground().await;
    assert!(report.ran);
  }

  #[tokio::test]
  async fn failed_revalidation_is_collected_not_fatal() {
    let network = Arc::new(NetworkMonitor::new(NetworkState::online_wifi()));
    let (controller, cache, _mutations) = controller_with(network);

    controller.register_revalidator("auth", QueryKey::new("auth"), || async {
      Err(ApiError::Server { status: 500, body: None })
    });
    let called = Arc::new(AtomicU32::new(0));
    let called_clone = called.clone();
    controller.register_revalidator("notice", QueryKey::new("notice"), move || {
      let called = called_clone.clone();
      async move {
        called.fetch_add(1, Ordering::SeqCst);
        Ok(json!([]))
      }
    });

    let report = controller.trigger_sync(false).await;
    assert!(report.ran);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("auth:"));
    // The auth failure did not stop the remaining steps.
    assert_eq!(called.load(Ordering::SeqCst), 1);
    assert!(cache.get(&QueryKey::new("notice")).unwrap().is_fresh);
  }
}
