use std::{
  collections::{HashMap, HashSet},
  fmt,
  sync::Arc,
  time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::FocusConfig;

/// What a request needs a worker to be able to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCapability {
  Recording,
  Sip,
  Transcription,
}

/// A partial status update from a worker's presence; missing keys keep
/// their previous values (absent on first contact means the defaults).
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
  pub region: Option<String>,
  pub supports_sip: Option<bool>,
  pub supports_transcription: Option<bool>,
  pub graceful_shutdown: Option<bool>,
  pub participant_count: Option<usize>,
}

#[derive(Debug)]
struct WorkerState {
  region: Option<String>,
  supports_sip: bool,
  supports_transcription: bool,
  graceful_shutdown: bool,
  participant_count: usize,
  last_event: Instant,
}

/// One recording/streaming/gateway worker announced on the brewery channel.
pub struct Worker {
  jid: String,
  state: Mutex<WorkerState>,
}

impl fmt::Debug for Worker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Worker")
      .field("jid", &self.jid)
      .field("participants", &self.participant_count())
      .finish()
  }
}

impl Worker {
  fn new(jid: String) -> Self {
    Self {
      jid,
      state: Mutex::new(WorkerState {
        region: None,
        supports_sip: false,
        supports_transcription: false,
        graceful_shutdown: false,
        participant_count: 0,
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

  pub fn is_in_graceful_shutdown(&self) -> bool {
    self.state.lock().graceful_shutdown
  }

  pub fn participant_count(&self) -> usize {
    self.state.lock().participant_count
  }

  pub fn supports(&self, capability: WorkerCapability) -> bool {
    let state = self.state.lock();
    match capability {
      WorkerCapability::Recording => true,
      WorkerCapability::Sip => state.supports_sip,
      WorkerCapability::Transcription => state.supports_transcription,
    }
  }

  pub fn apply_stats(&self, stats: &WorkerStats) {
    let mut state = self.state.lock();
    if let Some(region) = &stats.region {
      state.region = Some(region.clone());
    }
    if let Some(supports_sip) = stats.supports_sip {
      state.supports_sip = supports_sip;
    }
    if let Some(supports_transcription) = stats.supports_transcription {
      state.supports_transcription = supports_transcription;
    }
    if let Some(graceful_shutdown) = stats.graceful_shutdown {
      state.graceful_shutdown = graceful_shutdown;
    }
    if let Some(participant_count) = stats.participant_count {
      state.participant_count = participant_count;
    }
    state.last_event = Instant::now();
  }

  pub fn last_event_age(&self) -> Duration {
    self.state.lock().last_event.elapsed()
  }
}

/// The brewery: workers come and go with presence, selection is
/// region-aware and least-loaded.
pub struct WorkerPool {
  workers: RwLock<HashMap<String, Arc<Worker>>>,
  config: Arc<FocusConfig>,
}

impl WorkerPool {
  pub fn new(config: Arc<FocusConfig>) -> Self {
    Self {
      workers: RwLock::new(HashMap::new()),
      config,
    }
  }

  pub fn on_worker_status(&self, jid: &str, stats: &WorkerStats) -> Arc<Worker> {
    let worker = {
      let mut workers = self.workers.write();
      workers
        .entry(jid.to_owned())
        .or_insert_with(|| {
          info!(worker = %jid, "worker joined");
          Arc::new(Worker::new(jid.to_owned()))
        })
        .clone()
    };
    worker.apply_stats(stats);
    worker
  }

  pub fn remove_worker(&self, jid: &str) -> Option<Arc<Worker>> {
    let removed = self.workers.write().remove(jid);
    if removed.is_some() {
      info!(worker = %jid, "worker left");
    }
    removed
  }

  pub fn get(&self, jid: &str) -> Option<Arc<Worker>> {
    self.workers.read().get(jid).cloned()
  }

  pub fn list(&self) -> Vec<Arc<Worker>> {
    self.workers.read().values().cloned().collect()
  }

  pub fn worker_count(&self) -> usize {
    self.workers.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.workers.read().is_empty()
  }

  /// Drop workers that have gone silent.
  pub fn expire_stale(&self, presence_timeout: Duration) -> Vec<String> {
    let stale: Vec<String> = self
      .workers
      .read()
      .values()
      .filter(|w| w.last_event_age() > presence_timeout)
      .map(|w| w.jid().to_owned())
      .collect();
    for jid in &stale {
      warn!(worker = %jid, "worker presence timed out");
      self.remove_worker(jid);
    }
    stale
  }

  /// Pick a worker: skip excluded/shut-down/incapable ones, prefer a
  /// preferred region, then a region grouped with one, then the local
  /// region, then anything; the least-loaded candidate wins each tier.
  pub fn select_worker(
    &self,
    exclude: &HashSet<String>,
    preferred_regions: &[String],
    capability: WorkerCapability,
  ) -> Option<Arc<Worker>> {
    let candidates: Vec<Arc<Worker>> = self
      .workers
      .read()
      .values()
      .filter(|w| {
        !exclude.contains(w.jid()) && !w.is_in_graceful_shutdown() && w.supports(capability)
      })
      .cloned()
      .collect();

    let least_loaded = |workers: Vec<&Arc<Worker>>| {
      workers
        .into_iter()
        .min_by_key(|w| w.participant_count())
        .cloned()
    };

    if !preferred_regions.is_empty() {
      let preferred: Vec<&Arc<Worker>> = candidates
        .iter()
        .filter(|w| {
          w.region()
            .map(|r| preferred_regions.contains(&r))
            .unwrap_or(false)
        })
        .collect();
      if let Some(worker) = least_loaded(preferred) {
        return Some(worker);
      }

      let grouped: HashSet<String> = preferred_regions
        .iter()
        .flat_map(|region| self.config.region_group(region))
        .collect();
      let in_group: Vec<&Arc<Worker>> = candidates
        .iter()
        .filter(|w| w.region().map(|r| grouped.contains(&r)).unwrap_or(false))
        .collect();
      if let Some(worker) = least_loaded(in_group) {
        return Some(worker);
      }
    }

    if let Some(local) = &self.config.local_region {
      let in_local: Vec<&Arc<Worker>> = candidates
        .iter()
        .filter(|w| w.region().as_deref() == Some(local.as_str()))
        .collect();
      if let Some(worker) = least_loaded(in_local) {
        return Some(worker);
      }
    }

    let selected = least_loaded(candidates.iter().collect());
    debug!(
      selected = selected.as_ref().map(|w| w.jid().to_owned()).as_deref(),
      "worker selection"
    );
    selected
  }
}

#[cfg(test)]
mod tests {
  use maplit::hashset;

  use super::*;

  fn pool_with(workers: &[(&str, &str, usize)]) -> WorkerPool {
    let pool = WorkerPool::new(Arc::new(FocusConfig::default()));
    for (jid, region, participants) in workers {
      pool.on_worker_status(
        jid,
        &WorkerStats {
          region: Some((*region).to_owned()),
          participant_count: Some(*participants),
          ..Default::default()
        },
      );
    }
    pool
  }

  #[test]
  fn selection_prefers_region_then_load() {
    let pool = pool_with(&[("w1", "r1", 5), ("w2", "r2", 1), ("w3", "r2", 3)]);
    let selected = pool
      .select_worker(
        &HashSet::new(),
        &["r2".to_owned()],
        WorkerCapability::Recording,
      )
      .unwrap();
    assert_eq!(selected.jid(), "w2");
  }

  #[test]
  fn selection_skips_excluded_and_shut_down() {
    let pool = pool_with(&[("w1", "r1", 0), ("w2", "r1", 1), ("w3", "r1", 2)]);
    pool.on_worker_status(
      "w2",
      &WorkerStats {
        graceful_shutdown: Some(true),
        ..Default::default()
      },
    );
    let selected = pool
      .select_worker(
        &hashset! {"w1".to_owned()},
        &[],
        WorkerCapability::Recording,
      )
      .unwrap();
    assert_eq!(selected.jid(), "w3");
  }

  #[test]
  fn selection_respects_capability() {
    let pool = pool_with(&[("w1", "r1", 0), ("w2", "r1", 5)]);
    pool.on_worker_status(
      "w2",
      &WorkerStats {
        supports_sip: Some(true),
        ..Default::default()
      },
    );
    let selected = pool
      .select_worker(&HashSet::new(), &[], WorkerCapability::Sip)
      .unwrap();
    assert_eq!(selected.jid(), "w2");
    assert!(pool
      .select_worker(&HashSet::new(), &[], WorkerCapability::Transcription)
      .is_none());
  }

  #[test]
  fn selection_returns_none_when_everyone_is_excluded() {
    let pool = pool_with(&[("w1", "r1", 0)]);
    assert!(pool
      .select_worker(
        &hashset! {"w1".to_owned()},
        &[],
        WorkerCapability::Recording,
      )
      .is_none());
  }
}
