//! Connectivity state and transition events.
//!
//! The monitor is fed by whatever platform mechanism detects connectivity
//! (polling, push callbacks); consumers only rely on two guarantees: the
//! current state is readable synchronously at any time, and a transition
//! event is delivered once per actual connectivity change (setting an equal
//! state emits nothing).

use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::policy::NetworkQuality;

/// Connection medium as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
  Wifi,
  Cellular,
  None,
  Unknown,
}

/// Snapshot of connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
  pub is_connected: bool,
  pub connection_type: ConnectionType,
  /// `None` while reachability probing is still undetermined.
  pub is_internet_reachable: Option<bool>,
}

impl NetworkState {
  pub fn online_wifi() -> Self {
    Self { is_connected: true, connection_type: ConnectionType::Wifi, is_internet_reachable: Some(true) }
  }

  pub fn online_cellular() -> Self {
    Self {
      is_connected: true,
      connection_type: ConnectionType::Cellular,
      is_internet_reachable: Some(true),
    }
  }

  pub fn offline() -> Self {
    Self { is_connected: false, connection_type: ConnectionType::None, is_internet_reachable: Some(false) }
  }

  /// Collapse the snapshot into the policy adjustment axis. An unknown
  /// connection type while connected is treated as wifi rather than
  /// penalized.
  pub fn quality(&self) -> NetworkQuality {
    if !self.is_connected || self.connection_type == ConnectionType::None {
      return NetworkQuality::Offline;
    }
    match self.connection_type {
      ConnectionType::Cellular => NetworkQuality::Cellular,
      _ => NetworkQuality::Wifi,
    }
  }
}

/// Connectivity transition, emitted once per actual flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  WentOnline,
  WentOffline,
}

/// Holds the current [`NetworkState`] and fans out [`Transition`]s.
#[derive(Debug)]
pub struct NetworkMonitor {
  state: watch::Sender<NetworkState>,
  transitions: broadcast::Sender<Transition>,
}

impl NetworkMonitor {
  pub fn new(initial: NetworkState) -> Self {
    let (state, _) = watch::channel(initial);
    let (transitions, _) = broadcast::channel(16);
    Self { state, transitions }
  }

  /// Current state, readable synchronously. Consumers should call this at
  /// the point of use instead of holding a snapshot across an await.
  pub fn current(&self) -> NetworkState {
    *self.state.borrow()
  }

  /// Feed a new platform reading. Equal states are dropped (no duplicate
  /// event storms); a connectivity flip emits exactly one transition.
  pub fn set_state(&self, next: NetworkState) {
    let previous = self.current();
    if previous == next {
      return;
    }
    self.state.send_replace(next);

    if previous.is_connected != next.is_connected {
      let transition =
        if next.is_connected { Transition::WentOnline } else { Transition::WentOffline };
      info!(?transition, ?next, "network transition");
      // Send fails only when no one is subscribed, which is fine.
      let _ = self.transitions.send(transition);
    }
  }

  /// Subscribe to connectivity transitions.
  pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
    self.transitions.subscribe()
  }

  /// Watch the full state, for consumers that care about medium changes
  /// (wifi to cellular) and not just connectivity flips.
  pub fn watch(&self) -> watch::Receiver<NetworkState> {
    self.state.subscribe()
  }
}

impl Default for NetworkMonitor {
  fn default() -> Self {
    Self::new(NetworkState::online_wifi())
  }
}
