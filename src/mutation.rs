//! Queue of in-flight and paused write operations.
//!
//! Writes issued while offline (or failing retryably) are recorded here,
//! paused on disconnect, and replayed in original enqueue order when
//! connectivity returns. Every mutation ends in `Success` or `Failed`, both
//! observable; nothing is silently dropped.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::cache::{QueryCache, QueryKey};
use crate::remote::ApiError;
use crate::retry::{retry_with_backoff, RetryOutcome, RetryPolicy};

/// Lifecycle state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  /// Waiting to run (or currently running).
  Pending,
  /// Held back until connectivity returns.
  Paused,
  Success,
  /// Retries exhausted; requires manual re-submission.
  Failed,
}

type MutationOp = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ApiError>> + Send + Sync>;

/// Read-only view of one queued mutation.
#[derive(Debug, Clone)]
pub struct MutationRecord {
  pub id: u64,
  pub label: String,
  pub status: MutationStatus,
  pub retry_attempt: u32,
  pub last_error: Option<String>,
}

struct QueuedMutation {
  id: u64,
  label: String,
  status: MutationStatus,
  retry_attempt: u32,
  last_error: Option<String>,
  /// Cache prefixes to invalidate when the mutation succeeds.
  invalidates: Vec<QueryKey>,
  op: MutationOp,
}

/// Outcome of [`MutationQueue::submit`].
#[derive(Debug)]
pub enum SubmitOutcome {
  /// Ran to completion; the listed cache prefixes were invalidated before
  /// this value was returned.
  Completed,
  /// Offline at submission time; queued as paused for the next reconnect.
  Queued(u64),
  /// Retries exhausted.
  Failed { id: u64, error: ApiError },
}

struct QueueInner {
  mutations: Vec<QueuedMutation>,
  next_id: u64,
}

/// The mutation queue. Clones share the same queue.
#[derive(Clone)]
pub struct MutationQueue {
  inner: Arc<Mutex<QueueInner>>,
  cache: QueryCache,
  retry: RetryPolicy,
}

impl MutationQueue {
  pub fn new(cache: QueryCache) -> Self {
    Self::with_retry(cache, RetryPolicy::default())
  }

  pub fn with_retry(cache: QueryCache, retry: RetryPolicy) -> Self {
    Self {
      inner: Arc::new(Mutex::new(QueueInner { mutations: Vec::new(), next_id: 0 })),
      cache,
      retry,
    }
  }

  fn lock(&self) -> MutexGuard<'_, QueueInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Record a mutation without running it. `paused` mutations wait for
  /// `resume_all`; `pending` ones wait for an explicit run.
  pub fn enqueue<F, Fut>(
    &self,
    label: impl Into<String>,
    invalidates: Vec<QueryKey>,
    paused: bool,
    op: F,
  ) -> u64
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), ApiError>> + Send + 'static,
  {
    let mut inner = self.lock();
    inner.next_id += 1;
    let id = inner.next_id;
    inner.mutations.push(QueuedMutation {
      id,
      label: label.into(),
      status: if paused { MutationStatus::Paused } else { MutationStatus::Pending },
      retry_attempt: 0,
      last_error: None,
      invalidates,
      op: Arc::new(move || Box::pin(op())),
    });
    id
  }

  /// Submit a write: run it now with bounded retry when `online`, otherwise
  /// queue it paused for the next reconnect.
  pub async fn submit<F, Fut>(
    &self,
    label: impl Into<String>,
    invalidates: Vec<QueryKey>,
    online: bool,
    op: F,
  ) -> SubmitOutcome
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), ApiError>> + Send + 'static,
  {
    let id = self.enqueue(label, invalidates, !online, op);
    if !online {
      info!(id, "offline, mutation queued for reconnect");
      return SubmitOutcome::Queued(id);
    }
    match self.run_one(id).await {
      Ok(()) => SubmitOutcome::Completed,
      Err(error) => SubmitOutcome::Failed { id, error },
    }
  }

  /// Move all pending mutations to paused. Invoked on disconnect.
  pub fn pause_all(&self) {
    let mut inner = self.lock();
    let mut paused = 0;
    for m in inner.mutations.iter_mut() {
      if m.status == MutationStatus::Pending {
        m.status = MutationStatus::Paused;
        paused += 1;
      }
    }
    if paused > 0 {
      info!(paused, "paused mutations for offline mode");
    }
  }

  /// Replay paused mutations serially in original enqueue order. Invoked on
  /// reconnect. Returns descriptions of the mutations that exhausted their
  /// retries, for the sync error report.
  pub async fn resume_all(&self) -> Vec<String> {
    let ids: Vec<u64> = {
      let mut inner = self.lock();
      inner
        .mutations
        .iter_mut()
        .filter(|m| m.status == MutationStatus::Paused)
        .map(|m| {
          m.status = MutationStatus::Pending;
          m.id
        })
        .collect()
    };

    if !ids.is_empty() {
      info!(count = ids.len(), "resuming paused mutations");
    }

    let mut errors = Vec::new();
    for id in ids {
      if let Err(error) = self.run_one(id).await {
        let label = self.record(id).map(|r| r.label).unwrap_or_default();
        errors.push(format!("mutation '{}' failed: {}", label, error));
      }
    }
    errors
  }

  /// Run one pending mutation with the queue's bounded retry policy.
  ///
  /// On success the mutation's cache prefixes are invalidated before this
  /// returns, so a caller that awaits the mutation and then reads the cache
  /// observes invalidated state, never stale state.
  async fn run_one(&self, id: u64) -> Result<(), ApiError> {
    let (op, invalidates) = {
      let inner = self.lock();
      match inner.mutations.iter().find(|m| m.id == id) {
        Some(m) => (m.op.clone(), m.invalidates.clone()),
        None => return Ok(()),
      }
    };

    let queue = self.clone();
    let outcome = retry_with_backoff(self.retry, ApiError::is_retryable, move |attempt| {
      let op = op.clone();
      let queue = queue.clone();
      async move {
        if let Some(m) = queue.lock().mutations.iter_mut().find(|m| m.id == id) {
          m.retry_attempt = attempt;
        }
        op().await
      }
    })
    .await;

    match outcome {
      RetryOutcome::Success(()) => {
        for prefix in &invalidates {
          self.cache.invalidate_prefix(prefix);
        }
        if let Some(m) = self.lock().mutations.iter_mut().find(|m| m.id == id) {
          m.status = MutationStatus::Success;
        }
        Ok(())
      }
      RetryOutcome::Exhausted { attempts, error } => {
        warn!(id, attempts, %error, "mutation failed permanently");
        if error.is_auth() {
          self.cache.invalidate_prefix(&QueryKey::new("auth"));
        }
        if let Some(m) = self.lock().mutations.iter_mut().find(|m| m.id == id) {
          m.status = MutationStatus::Failed;
          m.retry_attempt = attempts;
          m.last_error = Some(error.to_string());
        }
        Err(error)
      }
    }
  }

  /// Mutations still waiting to run (pending or paused).
  pub fn pending_count(&self) -> usize {
    self
      .lock()
      .mutations
      .iter()
      .filter(|m| matches!(m.status, MutationStatus::Pending | MutationStatus::Paused))
      .count()
  }

  pub fn record(&self, id: u64) -> Option<MutationRecord> {
    self.lock().mutations.iter().find(|m| m.id == id).map(|m| MutationRecord {
      id: m.id,
      label: m.label.clone(),
      status: m.status,
      retry_attempt: m.retry_attempt,
      last_error: m.last_error.clone(),
    })
  }

  /// Failed mutations awaiting manual re-submission.
  pub fn failed(&self) -> Vec<MutationRecord> {
    self
      .lock()
      .mutations
      .iter()
      .filter(|m| m.status == MutationStatus::Failed)
      .map(|m| MutationRecord {
        id: m.id,
        label: m.label.clone(),
        status: m.status,
        retry_attempt: m.retry_attempt,
        last_error: m.last_error.clone(),
      })
      .collect()
  }

  /// Drop completed mutations, keeping failures visible.
  pub fn prune_succeeded(&self) {
    self.lock().mutations.retain(|m| m.status != MutationStatus::Success);
  }
}
