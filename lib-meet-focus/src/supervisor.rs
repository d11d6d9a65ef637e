use std::{
  collections::{HashMap, HashSet},
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
  },
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
  conference::ConferenceSession,
  error::RequestError,
  jibri::DialOutCounters,
  services::FocusServices,
  util::FallibleEntry,
};

/// A point-in-time snapshot of the process, serializable for whatever
/// debug/metrics surface embeds the focus.
#[derive(Debug, Clone, Serialize)]
pub struct FocusMetrics {
  pub conferences: usize,
  pub participants: usize,
  pub largest_conference: usize,
  pub conferences_with_multiple_bridges: usize,
  pub conferences_created: u64,
  pub bridges: usize,
  pub operational_bridges: usize,
  pub lost_bridges: u64,
  pub dial_out: DialOutCounters,
}

/// The process-wide conference table: atomic get-or-create, iteration for
/// metrics, graceful shutdown.
pub struct FocusSupervisor {
  services: FocusServices,
  conferences: Mutex<HashMap<String, Arc<ConferenceSession>>>,
  graceful_shutdown: AtomicBool,
  conferences_created: AtomicU64,
}

impl FocusSupervisor {
  pub fn new(services: FocusServices) -> Arc<Self> {
    Arc::new(Self {
      services,
      conferences: Mutex::new(HashMap::new()),
      graceful_shutdown: AtomicBool::new(false),
      conferences_created: AtomicU64::new(0),
    })
  }

  pub fn services(&self) -> &FocusServices {
    &self.services
  }

  pub fn is_shutting_down(&self) -> bool {
    self.graceful_shutdown.load(Ordering::Relaxed)
  }

  pub fn get(&self, room: &str) -> Option<Arc<ConferenceSession>> {
    let mut conferences = self.conferences.lock();
    match conferences.get(room) {
      Some(conference) if conference.is_disposed() => {
        conferences.remove(room);
        None
      },
      other => other.cloned(),
    }
  }

  /// Look up or create the conference for a room. Creation is refused
  /// during graceful shutdown.
  pub fn get_or_create(&self, room: &str) -> Result<Arc<ConferenceSession>, RequestError> {
    let mut conferences = self.conferences.lock();
    if let Some(existing) = conferences.get(room) {
      if existing.is_disposed() {
        conferences.remove(room);
      }
    }
    conferences
      .entry(room.to_owned())
      .or_try_insert_with(|| {
        if self.graceful_shutdown.load(Ordering::Relaxed) {
          return Err(RequestError::ServiceUnavailable(
            "shutting down".to_owned(),
          ));
        }
        self.conferences_created.fetch_add(1, Ordering::Relaxed);
        Ok(ConferenceSession::new(room.to_owned(), self.services.clone()))
      })
      .map(|conference| conference.clone())
  }

  pub fn conference_count(&self) -> usize {
    self.conferences.lock().len()
  }

  pub fn conferences(&self) -> Vec<Arc<ConferenceSession>> {
    self.conferences.lock().values().cloned().collect()
  }

  /// Drop table entries whose conferences have disposed themselves.
  pub fn sweep_disposed(&self) -> usize {
    let mut conferences = self.conferences.lock();
    let before = conferences.len();
    conferences.retain(|_, conference| !conference.is_disposed());
    before - conferences.len()
  }

  pub async fn metrics(&self) -> FocusMetrics {
    let conferences = self.conferences();
    let mut participants = 0;
    let mut largest = 0;
    let mut multi_bridge = 0;
    for conference in &conferences {
      let count = conference.participant_count().await;
      participants += count;
      largest = largest.max(count);
      if conference.bridge_count().await > 1 {
        multi_bridge += 1;
      }
    }
    FocusMetrics {
      conferences: conferences.len(),
      participants,
      largest_conference: largest,
      conferences_with_multiple_bridges: multi_bridge,
      conferences_created: self.conferences_created.load(Ordering::Relaxed),
      bridges: self.services.registry.bridge_count(),
      operational_bridges: self.services.registry.operational_bridge_count(),
      lost_bridges: self.services.registry.lost_bridge_count(),
      dial_out: self.services.jigasi.counters(),
    }
  }

  /// Refuse new conferences and let existing ones drain naturally.
  pub async fn enable_graceful_shutdown(&self) {
    if self.graceful_shutdown.swap(true, Ordering::Relaxed) {
      return;
    }
    info!("graceful shutdown enabled");
    for conference in self.conferences() {
      conference.begin_draining().await;
    }
  }

  /// Tear everything down immediately.
  pub async fn dispose_all(&self) {
    let conferences: Vec<Arc<ConferenceSession>> = {
      let mut table = self.conferences.lock();
      table.drain().map(|(_, c)| c).collect()
    };
    for conference in conferences {
      conference.dispose().await;
    }
  }

  /// Periodic housekeeping: expire bridges and workers that stopped
  /// announcing themselves, and re-invite the participants of lost
  /// bridges.
  pub fn spawn_health_task(self: &Arc<Self>) -> JoinHandle<()> {
    let supervisor = self.clone();
    let period = supervisor.services.config.bridge_presence_timeout / 2;
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      interval.tick().await;
      loop {
        interval.tick().await;
        let timeout = supervisor.services.config.bridge_presence_timeout;
        let stale: HashSet<String> = supervisor
          .services
          .registry
          .expire_stale(timeout)
          .into_iter()
          .collect();
        if !stale.is_empty() {
          warn!(count = stale.len(), "bridges timed out");
          for conference in supervisor.conferences() {
            conference.on_bridges_down(stale.clone()).await;
          }
        }
        supervisor.services.jibri_pool.expire_stale(timeout);
        supervisor.services.gateway_pool.expire_stale(timeout);
        supervisor.sweep_disposed();
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::{test_config, test_services, RecordingSignaling};

  fn supervisor() -> Arc<FocusSupervisor> {
    let signaling = Arc::new(RecordingSignaling::default());
    let services = test_services(test_config(), signaling, &[]);
    FocusSupervisor::new(services)
  }

  #[tokio::test]
  async fn get_or_create_is_idempotent_per_room() {
    let supervisor = supervisor();
    let a = supervisor.get_or_create("room1@muc").unwrap();
    let b = supervisor.get_or_create("room1@muc").unwrap();
    assert_eq!(a.meeting_id(), b.meeting_id());
    assert_eq!(supervisor.conference_count(), 1);
    supervisor.get_or_create("room2@muc").unwrap();
    assert_eq!(supervisor.conference_count(), 2);

    let metrics = supervisor.metrics().await;
    assert_eq!(metrics.conferences, 2);
    assert_eq!(metrics.conferences_created, 2);
  }

  #[tokio::test]
  async fn graceful_shutdown_refuses_new_conferences() {
    let supervisor = supervisor();
    let existing = supervisor.get_or_create("room1@muc").unwrap();
    supervisor.enable_graceful_shutdown().await;

    assert!(matches!(
      supervisor.get_or_create("room2@muc"),
      Err(RequestError::ServiceUnavailable(_))
    ));
    // The existing conference is still reachable while it drains.
    assert!(supervisor.get("room1@muc").is_some());
    assert!(!existing.is_disposed());
  }

  #[tokio::test]
  async fn disposed_conferences_are_swept() {
    let supervisor = supervisor();
    let conference = supervisor.get_or_create("room1@muc").unwrap();
    conference.dispose().await;
    assert!(supervisor.get("room1@muc").is_none());
    // A new conference can take the room's place.
    let replacement = supervisor.get_or_create("room1@muc").unwrap();
    assert_ne!(conference.meeting_id(), replacement.meeting_id());
  }
}
