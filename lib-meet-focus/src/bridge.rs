use std::{
  collections::HashMap,
  fmt,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// A partial status update from a bridge's presence; missing fields keep
/// their previous values.
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
  pub stress: Option<f64>,
  pub region: Option<String>,
  pub relay_id: Option<String>,
  pub version: Option<String>,
  pub graceful_shutdown: Option<bool>,
  pub drain: Option<bool>,
  pub supports_colibri2: Option<bool>,
}

#[derive(Debug)]
struct BridgeState {
  region: Option<String>,
  relay_id: Option<String>,
  stress: f64,
  version: Option<String>,
  graceful_shutdown: bool,
  drain: bool,
  supports_colibri2: bool,
  failed_at: Option<Instant>,
  last_event: Instant,
}

/// One known media bridge. Stat updates are atomic per bridge; a failure is
/// sticky for the configured reset window.
pub struct Bridge {
  jid: String,
  failure_reset_threshold: Duration,
  state: Mutex<BridgeState>,
}

impl fmt::Debug for Bridge {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Bridge")
      .field("jid", &self.jid)
      .field("stress", &self.stress())
      .field("region", &self.region())
      .finish()
  }
}

impl Bridge {
  fn new(jid: String, failure_reset_threshold: Duration) -> Self {
    Self {
      jid,
      failure_reset_threshold,
      state: Mutex::new(BridgeState {
        region: None,
        relay_id: None,
        stress: 0.0,
        version: None,
        graceful_shutdown: false,
        drain: false,
        supports_colibri2: true,
        failed_at: None,
        last_event: Instant::now(),
      }),
    }
  }

  pub fn jid(&self) -> &str {
    &self.jid
  }

  pub fn region(&self) -> Option<String> {
    self.state.lock().region.clone()
  }

  pub fn relay_id(&self) -> Option<String> {
    self.state.lock().relay_id.clone()
  }

  pub fn version(&self) -> Option<String> {
    self.state.lock().version.clone()
  }

  pub fn stress(&self) -> f64 {
    self.state.lock().stress
  }

  pub fn is_in_graceful_shutdown(&self) -> bool {
    self.state.lock().graceful_shutdown
  }

  pub fn is_draining(&self) -> bool {
    self.state.lock().drain
  }

  pub fn supports_colibri2(&self) -> bool {
    self.state.lock().supports_colibri2
  }

  /// A failure is sticky until the reset window has passed.
  pub fn is_operational(&self) -> bool {
    match self.state.lock().failed_at {
      None => true,
      Some(at) => at.elapsed() >= self.failure_reset_threshold,
    }
  }

  pub fn set_failed(&self) {
    warn!(bridge = %self.jid, "marking bridge failed");
    self.state.lock().failed_at = Some(Instant::now());
  }

  /// A successful round-trip proves the bridge healthy again.
  pub fn set_operational(&self) {
    self.state.lock().failed_at = None;
  }

  pub fn apply_stats(&self, stats: &BridgeStats) {
    let mut state = self.state.lock();
    if let Some(stress) = stats.stress {
      state.stress = stress;
    }
    if let Some(region) = &stats.region {
      state.region = Some(region.clone());
    }
    if let Some(relay_id) = &stats.relay_id {
      state.relay_id = Some(relay_id.clone());
    }
    if let Some(version) = &stats.version {
      state.version = Some(version.clone());
    }
    if let Some(graceful_shutdown) = stats.graceful_shutdown {
      state.graceful_shutdown = graceful_shutdown;
    }
    if let Some(drain) = stats.drain {
      state.drain = drain;
    }
    if let Some(supports_colibri2) = stats.supports_colibri2 {
      state.supports_colibri2 = supports_colibri2;
    }
    state.last_event = Instant::now();
  }

  pub fn last_event_age(&self) -> Duration {
    self.state.lock().last_event.elapsed()
  }
}

/// The live set of bridges. Reads take a snapshot; per-bridge state changes
/// do not block the list.
pub struct BridgeRegistry {
  bridges: RwLock<HashMap<String, Arc<Bridge>>>,
  failure_reset_threshold: Duration,
  lost_bridges: AtomicU64,
}

impl BridgeRegistry {
  pub fn new(failure_reset_threshold: Duration) -> Self {
    Self {
      bridges: RwLock::new(HashMap::new()),
      failure_reset_threshold,
      lost_bridges: AtomicU64::new(0),
    }
  }

  pub fn add_bridge(&self, jid: &str) -> Arc<Bridge> {
    let mut bridges = self.bridges.write();
    bridges
      .entry(jid.to_owned())
      .or_insert_with(|| {
        info!(bridge = %jid, "bridge joined");
        Arc::new(Bridge::new(jid.to_owned(), self.failure_reset_threshold))
      })
      .clone()
  }

  /// Removing a bridge that was not shutting down gracefully counts as lost.
  pub fn remove_bridge(&self, jid: &str) -> Option<Arc<Bridge>> {
    let removed = self.bridges.write().remove(jid);
    if let Some(bridge) = &removed {
      if bridge.is_in_graceful_shutdown() {
        info!(bridge = %jid, "bridge left gracefully");
      }
      else {
        warn!(bridge = %jid, "bridge lost");
        self.lost_bridges.fetch_add(1, Ordering::Relaxed);
      }
    }
    removed
  }

  pub fn get(&self, jid: &str) -> Option<Arc<Bridge>> {
    self.bridges.read().get(jid).cloned()
  }

  /// Status announcements double as registration.
  pub fn on_bridge_stats(&self, jid: &str, stats: &BridgeStats) -> Arc<Bridge> {
    let bridge = self.add_bridge(jid);
    bridge.apply_stats(stats);
    debug!(bridge = %jid, stress = bridge.stress(), "bridge stats");
    bridge
  }

  pub fn list(&self) -> Vec<Arc<Bridge>> {
    self.bridges.read().values().cloned().collect()
  }

  pub fn bridge_count(&self) -> usize {
    self.bridges.read().len()
  }

  pub fn operational_bridge_count(&self) -> usize {
    self
      .bridges
      .read()
      .values()
      .filter(|b| b.is_operational())
      .count()
  }

  pub fn lost_bridge_count(&self) -> u64 {
    self.lost_bridges.load(Ordering::Relaxed)
  }

  /// Drop bridges that have gone silent. Returns the jids removed.
  pub fn expire_stale(&self, presence_timeout: Duration) -> Vec<String> {
    let stale: Vec<String> = self
      .bridges
      .read()
      .values()
      .filter(|b| b.last_event_age() > presence_timeout)
      .map(|b| b.jid().to_owned())
      .collect();
    for jid in &stale {
      warn!(bridge = %jid, "bridge presence timed out");
      self.remove_bridge(jid);
    }
    stale
  }
}
