use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
};

use futures::future::join_all;
use meet_focus_signaling::{Content, IceUdpTransport};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
  bridge_session::BridgeSession,
  colibri::{AllocationRequest, BridgeRpc, ColibriAllocation, EndpointUpdate},
  config::FocusConfig,
  error::{AllocationError, ColibriError},
  selector::BridgeSelector,
  source::EndpointSourceSet,
  source_map::ConferenceSourceMap,
};

/// A successful channel allocation, as handed to the invite task.
#[derive(Debug, Clone)]
pub struct AllocationOutcome {
  pub allocation: ColibriAllocation,
  pub bridge_jid: String,
  pub bridge_session_id: String,
}

struct ManagerState {
  sessions: HashMap<String, Arc<BridgeSession>>,
  participant_bridge: HashMap<String, String>,
}

impl ManagerState {
  fn conference_bridges(&self) -> HashMap<String, usize> {
    let mut bridges: HashMap<String, usize> = self
      .sessions
      .keys()
      .map(|jid| (jid.clone(), 0))
      .collect();
    for bridge in self.participant_bridge.values() {
      *bridges.entry(bridge.clone()).or_insert(0) += 1;
    }
    bridges
  }
}

/// Aggregates the bridge sessions of a single conference: selects bridges,
/// fans out source updates, and keeps the relay mesh consistent with the
/// set of live bridges.
pub struct ColibriSessionManager {
  conference_id: String,
  room: String,
  selector: Arc<BridgeSelector>,
  rpc: Arc<dyn BridgeRpc>,
  config: Arc<FocusConfig>,
  state: Mutex<ManagerState>,
}

impl ColibriSessionManager {
  pub fn new(
    conference_id: String,
    room: String,
    selector: Arc<BridgeSelector>,
    rpc: Arc<dyn BridgeRpc>,
    config: Arc<FocusConfig>,
  ) -> Self {
    Self {
      conference_id,
      room,
      selector,
      rpc,
      config,
      state: Mutex::new(ManagerState {
        sessions: HashMap::new(),
        participant_bridge: HashMap::new(),
      }),
    }
  }

  pub async fn bridge_count(&self) -> usize {
    self.state.lock().await.sessions.len()
  }

  pub async fn bridge_of(&self, endpoint_id: &str) -> Option<String> {
    self
      .state
      .lock()
      .await
      .participant_bridge
      .get(endpoint_id)
      .cloned()
  }

  pub async fn bridge_regions(&self) -> Vec<String> {
    let state = self.state.lock().await;
    state
      .sessions
      .values()
      .filter_map(|s| s.bridge().region())
      .collect()
  }

  async fn session_of(&self, endpoint_id: &str) -> Option<Arc<BridgeSession>> {
    let state = self.state.lock().await;
    let bridge = state.participant_bridge.get(endpoint_id)?;
    state.sessions.get(bridge).cloned()
  }

  /// Allocate channels for a participant: select a bridge, get or create
  /// its session, fire the one-shot colibri request, and sort the outcome
  /// into the error taxonomy. Never retries against the same bridge.
  pub async fn allocate(
    &self,
    endpoint_id: &str,
    region: Option<&str>,
    contents: Vec<Content>,
    use_sctp: bool,
  ) -> Result<AllocationOutcome, AllocationError> {
    let (session, is_new_session) = {
      let mut state = self.state.lock().await;
      let conference_bridges = state.conference_bridges();
      let bridge = self
        .selector
        .select_bridge(&conference_bridges, region, None)
        .ok_or(AllocationError::BridgeSelectionFailed)?;
      let is_new = !state.sessions.contains_key(bridge.jid());
      let session = state
        .sessions
        .entry(bridge.jid().to_owned())
        .or_insert_with(|| {
          info!(conference = %self.room, bridge = %bridge.jid(), "creating bridge session");
          Arc::new(BridgeSession::new(
            self.conference_id.clone(),
            bridge.clone(),
            self.rpc.clone(),
          ))
        })
        .clone();
      (session, is_new)
    };

    let request = AllocationRequest {
      conference_id: self.conference_id.clone(),
      room: self.room.clone(),
      endpoint_id: endpoint_id.to_owned(),
      contents,
      create: is_new_session,
      use_sctp,
    };
    let result = tokio::time::timeout(self.config.allocation_timeout, session.allocate(&request))
      .await
      .unwrap_or(Err(ColibriError::Timeout));

    match result {
      Ok(allocation) => {
        session.bridge().set_operational();
        let mut state = self.state.lock().await;
        state
          .participant_bridge
          .insert(endpoint_id.to_owned(), session.bridge().jid().to_owned());
        if is_new_session {
          self.recompute_relays(&state).await;
        }
        Ok(AllocationOutcome {
          allocation,
          bridge_jid: session.bridge().jid().to_owned(),
          bridge_session_id: session.id().to_owned(),
        })
      },
      Err(ColibriError::ConferenceNotFound) => {
        // The bridge expired us; not its fault. The whole conference needs
        // to be re-invited.
        self.drop_session_if_empty(&session, is_new_session).await;
        Err(AllocationError::ConferenceExpired {
          restart_conference: true,
        })
      },
      Err(ColibriError::BadRequest(message)) => {
        // Retrying would not improve a request the bridge rejected.
        self.drop_session_if_empty(&session, is_new_session).await;
        Err(AllocationError::Rejected(message))
      },
      Err(e) => {
        warn!(conference = %self.room, bridge = %session.bridge().jid(), error = %e, "allocation failed");
        session.bridge().set_failed();
        session.set_failed();
        let mut state = self.state.lock().await;
        state.sessions.remove(session.bridge().jid());
        state
          .participant_bridge
          .retain(|_, bridge| bridge != session.bridge().jid());
        self.recompute_relays(&state).await;
        Err(AllocationError::BridgeFailed {
          restart_conference: false,
        })
      },
    }
  }

  async fn drop_session_if_empty(&self, session: &Arc<BridgeSession>, was_new: bool) {
    if was_new && session.participant_count().await == 0 {
      let mut state = self.state.lock().await;
      state.sessions.remove(session.bridge().jid());
    }
  }

  /// Push a participant's source change to its own bridge (which takes the
  /// full updated set) and advertise the delta to every other bridge
  /// through the relays.
  pub async fn add_sources(
    &self,
    endpoint_id: &str,
    added: &EndpointSourceSet,
    updated: &EndpointSourceSet,
  ) {
    let Some(session) = self.session_of(endpoint_id).await else {
      debug!(endpoint = %endpoint_id, "add_sources for participant without a bridge");
      return;
    };
    if let Err(e) = session
      .update_participant(&EndpointUpdate {
        endpoint_id: endpoint_id.to_owned(),
        sources: Some(updated.clone()),
        ..Default::default()
      })
      .await
    {
      warn!(endpoint = %endpoint_id, error = %e, "failed to push sources to bridge");
    }
    let map = ConferenceSourceMap::from_owner(endpoint_id, added.clone());
    let others = self.other_sessions(session.bridge().jid()).await;
    let results = join_all(others.iter().map(|other| other.add_sources_to_relay(&map))).await;
    for (other, result) in others.iter().zip(results) {
      if let Err(e) = result {
        warn!(bridge = %other.bridge().jid(), error = %e, "failed to add relay sources");
      }
    }
  }

  pub async fn remove_sources(
    &self,
    endpoint_id: &str,
    removed: &EndpointSourceSet,
    updated: &EndpointSourceSet,
  ) {
    let Some(session) = self.session_of(endpoint_id).await else {
      return;
    };
    if let Err(e) = session
      .update_participant(&EndpointUpdate {
        endpoint_id: endpoint_id.to_owned(),
        sources: Some(updated.clone()),
        ..Default::default()
      })
      .await
    {
      warn!(endpoint = %endpoint_id, error = %e, "failed to push source removal to bridge");
    }
    let map = ConferenceSourceMap::from_owner(endpoint_id, removed.clone());
    let others = self.other_sessions(session.bridge().jid()).await;
    let results = join_all(
      others
        .iter()
        .map(|other| other.remove_sources_from_relay(&map)),
    )
    .await;
    for (other, result) in others.iter().zip(results) {
      if let Err(e) = result {
        warn!(bridge = %other.bridge().jid(), error = %e, "failed to remove relay sources");
      }
    }
  }

  async fn other_sessions(&self, bridge_jid: &str) -> Vec<Arc<BridgeSession>> {
    self
      .state
      .lock()
      .await
      .sessions
      .values()
      .filter(|s| s.bridge().jid() != bridge_jid)
      .cloned()
      .collect()
  }

  /// Push a participant's transport to its bridge.
  pub async fn update_transport(&self, endpoint_id: &str, transport: IceUdpTransport) {
    let Some(session) = self.session_of(endpoint_id).await else {
      return;
    };
    if let Err(e) = session
      .update_participant(&EndpointUpdate {
        endpoint_id: endpoint_id.to_owned(),
        transport: Some(transport),
        ..Default::default()
      })
      .await
    {
      warn!(endpoint = %endpoint_id, error = %e, "failed to push transport to bridge");
    }
  }

  pub async fn set_rtp_descriptions(&self, endpoint_id: &str, contents: Vec<Content>) {
    let Some(session) = self.session_of(endpoint_id).await else {
      return;
    };
    if let Err(e) = session
      .update_participant(&EndpointUpdate {
        endpoint_id: endpoint_id.to_owned(),
        rtp_descriptions: Some(contents),
        ..Default::default()
      })
      .await
    {
      warn!(endpoint = %endpoint_id, error = %e, "failed to push rtp descriptions to bridge");
    }
  }

  /// Remove participants across bridge sessions; afterwards expire every
  /// bridge left without a real participant.
  pub async fn remove_participants(&self, endpoint_ids: &[String]) {
    let mut guard = self.state.lock().await;
    let state = &mut *guard;
    for endpoint_id in endpoint_ids {
      let Some(bridge) = state.participant_bridge.remove(endpoint_id) else {
        continue;
      };
      if let Some(session) = state.sessions.get(&bridge) {
        if let Err(e) = session.terminate(endpoint_id).await {
          warn!(endpoint = %endpoint_id, bridge = %bridge, error = %e, "failed to expire endpoint");
        }
      }
    }

    let mut emptied = Vec::new();
    for (jid, session) in &state.sessions {
      if session.participant_count().await == 0 {
        emptied.push(jid.clone());
      }
    }
    for jid in &emptied {
      if let Some(session) = state.sessions.remove(jid) {
        info!(bridge = %jid, "expiring bridge session with no participants left");
        session.dispose(false).await;
      }
    }
    if !emptied.is_empty() {
      self.recompute_relays(state).await;
    }
  }

  /// Some bridges died. Cut their sessions without expiring (the peer is
  /// gone), mark them failed, and hand back the participants that now need
  /// re-invitation.
  pub async fn bridges_down(&self, bridges: &HashSet<String>) -> Vec<String> {
    let mut guard = self.state.lock().await;
    let state = &mut *guard;
    let mut affected = Vec::new();
    for jid in bridges {
      let Some(session) = state.sessions.remove(jid) else {
        continue;
      };
      warn!(conference = %self.room, bridge = %jid, "bridge went down");
      session.bridge().set_failed();
      session.set_failed();
      let orphaned = session.terminate_all().await;
      session.dispose(true).await;
      for endpoint_id in orphaned {
        state.participant_bridge.remove(&endpoint_id);
        affected.push(endpoint_id);
      }
    }
    self.recompute_relays(state).await;
    affected
  }

  /// End the conference on every bridge.
  pub async fn expire_all(&self) {
    let mut guard = self.state.lock().await;
    let state = &mut *guard;
    for (_, session) in state.sessions.drain() {
      session.dispose(false).await;
    }
    state.participant_bridge.clear();
  }

  /// Relays are every operational bridge except self; with fewer than two
  /// bridges there is nothing to mesh.
  async fn recompute_relays(&self, state: &ManagerState) {
    let relay_of = |session: &Arc<BridgeSession>| {
      session
        .bridge()
        .relay_id()
        .unwrap_or_else(|| session.bridge().jid().to_owned())
    };
    let mesh = state.sessions.len() >= 2;
    for session in state.sessions.values() {
      let relays: Vec<String> = if mesh {
        state
          .sessions
          .values()
          .filter(|other| other.bridge().jid() != session.bridge().jid())
          .map(relay_of)
          .collect()
      }
      else {
        vec![]
      };
      if let Err(e) = session.set_relays(relays).await {
        warn!(bridge = %session.bridge().jid(), error = %e, "failed to update relays");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use async_trait::async_trait;
  use maplit::hashset;
  use parking_lot::Mutex as SyncMutex;

  use super::*;
  use crate::{
    bridge::{BridgeRegistry, BridgeStats},
    selector::{BridgeSelector, RegionBasedStrategy},
    source::{MediaType, Source},
  };

  #[derive(Default)]
  struct MockRpc {
    /// Scripted allocate failures by bridge jid.
    allocate_errors: SyncMutex<HashMap<String, ColibriError>>,
    /// Bridges whose allocate never answers.
    hangs: HashSet<String>,
    relay_calls: SyncMutex<Vec<(String, Vec<String>)>>,
    expired_conferences: SyncMutex<Vec<String>>,
  }

  #[async_trait]
  impl BridgeRpc for MockRpc {
    async fn allocate(
      &self,
      bridge: &str,
      _request: &AllocationRequest,
    ) -> Result<ColibriAllocation, ColibriError> {
      if self.hangs.contains(bridge) {
        tokio::time::sleep(Duration::from_secs(3600)).await;
      }
      if let Some(e) = self.allocate_errors.lock().get(bridge) {
        return Err(e.clone());
      }
      Ok(ColibriAllocation {
        transport: IceUdpTransport::default(),
        feedback_sources: EndpointSourceSet::from_parts(
          [
            Source::new(0xabcd, MediaType::Audio),
            Source::new(0xabce, MediaType::Video),
          ],
          [],
        ),
      })
    }

    async fn update_endpoint(
      &self,
      _bridge: &str,
      _conference_id: &str,
      _update: &EndpointUpdate,
    ) -> Result<(), ColibriError> {
      Ok(())
    }

    async fn set_relays(
      &self,
      bridge: &str,
      _conference_id: &str,
      relays: &[String],
    ) -> Result<(), ColibriError> {
      self
        .relay_calls
        .lock()
        .push((bridge.to_owned(), relays.to_vec()));
      Ok(())
    }

    async fn update_relay_sources(
      &self,
      _bridge: &str,
      _conference_id: &str,
      _sources: &ConferenceSourceMap,
      _remove: bool,
    ) -> Result<(), ColibriError> {
      Ok(())
    }

    async fn expire_endpoint(
      &self,
      _bridge: &str,
      _conference_id: &str,
      _endpoint_id: &str,
    ) -> Result<(), ColibriError> {
      Ok(())
    }

    async fn expire_conference(
      &self,
      bridge: &str,
      _conference_id: &str,
    ) -> Result<(), ColibriError> {
      self.expired_conferences.lock().push(bridge.to_owned());
      Ok(())
    }
  }

  fn manager_with(
    rpc: Arc<MockRpc>,
    bridges: &[(&str, &str)],
  ) -> (ColibriSessionManager, Arc<BridgeRegistry>) {
    let config = Arc::new(FocusConfig {
      allocation_timeout: Duration::from_millis(50),
      ..Default::default()
    });
    let registry = Arc::new(BridgeRegistry::new(Duration::from_secs(60)));
    for (jid, region) in bridges {
      registry.on_bridge_stats(
        jid,
        &BridgeStats {
          region: Some((*region).to_owned()),
          ..Default::default()
        },
      );
    }
    let selector = Arc::new(BridgeSelector::new(
      registry.clone(),
      Arc::new(RegionBasedStrategy::new(config.clone())),
    ));
    let manager = ColibriSessionManager::new(
      "gid-1".to_owned(),
      "room@muc".to_owned(),
      selector,
      rpc,
      config,
    );
    (manager, registry)
  }

  #[tokio::test]
  async fn bridge_failure_returns_affected_participants_for_reinvite() {
    let rpc = Arc::new(MockRpc::default());
    let (manager, registry) = manager_with(rpc.clone(), &[("b1", "r1"), ("b2", "r2")]);

    manager.allocate("p1", Some("r1"), vec![], false).await.unwrap();
    manager.allocate("p2", Some("r1"), vec![], false).await.unwrap();
    manager.allocate("p3", Some("r2"), vec![], false).await.unwrap();
    assert_eq!(manager.bridge_count().await, 2);

    let mut affected = manager.bridges_down(&hashset! {"b1".to_owned()}).await;
    affected.sort();
    assert_eq!(affected, vec!["p1".to_owned(), "p2".to_owned()]);
    assert_eq!(manager.bridge_count().await, 1);
    assert!(!registry.get("b1").unwrap().is_operational());
    // The failed bridge is not expired (it is gone), and the survivor's
    // relay list no longer contains it.
    assert!(!rpc.expired_conferences.lock().contains(&"b1".to_owned()));
    let last_b2_relays = rpc
      .relay_calls
      .lock()
      .iter()
      .rev()
      .find(|(bridge, _)| bridge == "b2")
      .map(|(_, relays)| relays.clone())
      .unwrap();
    assert!(last_b2_relays.is_empty());

    // A re-invited participant lands on the surviving bridge.
    let outcome = manager.allocate("p1", Some("r1"), vec![], false).await.unwrap();
    assert_eq!(outcome.bridge_jid, "b2");
  }

  #[tokio::test]
  async fn relay_mesh_appears_at_two_bridges() {
    let rpc = Arc::new(MockRpc::default());
    let (manager, _registry) = manager_with(rpc.clone(), &[("b1", "r1"), ("b2", "r2")]);

    manager.allocate("p1", Some("r1"), vec![], false).await.unwrap();
    assert!(rpc.relay_calls.lock().is_empty());

    manager.allocate("p2", Some("r2"), vec![], false).await.unwrap();
    let calls = rpc.relay_calls.lock().clone();
    let b1_relays = calls.iter().find(|(b, _)| b == "b1").map(|(_, r)| r.clone());
    let b2_relays = calls.iter().find(|(b, _)| b == "b2").map(|(_, r)| r.clone());
    assert_eq!(b1_relays, Some(vec!["b2".to_owned()]));
    assert_eq!(b2_relays, Some(vec!["b1".to_owned()]));
  }

  #[tokio::test]
  async fn conference_not_found_does_not_blame_the_bridge() {
    let rpc = Arc::new(MockRpc::default());
    rpc
      .allocate_errors
      .lock()
      .insert("b1".to_owned(), ColibriError::ConferenceNotFound);
    let (manager, registry) = manager_with(rpc, &[("b1", "r1")]);

    let error = manager
      .allocate("p1", Some("r1"), vec![], false)
      .await
      .unwrap_err();
    assert_eq!(
      error,
      AllocationError::ConferenceExpired {
        restart_conference: true
      }
    );
    assert!(registry.get("b1").unwrap().is_operational());
  }

  #[tokio::test]
  async fn bad_request_does_not_blame_the_bridge_or_retry() {
    let rpc = Arc::new(MockRpc::default());
    rpc
      .allocate_errors
      .lock()
      .insert("b1".to_owned(), ColibriError::BadRequest("bad".to_owned()));
    let (manager, registry) = manager_with(rpc, &[("b1", "r1")]);

    let error = manager
      .allocate("p1", Some("r1"), vec![], false)
      .await
      .unwrap_err();
    assert_eq!(error, AllocationError::Rejected("bad".to_owned()));
    assert!(registry.get("b1").unwrap().is_operational());
  }

  #[tokio::test]
  async fn timeout_marks_the_bridge_failed() {
    let rpc = Arc::new(MockRpc {
      hangs: hashset! {"b1".to_owned()},
      ..Default::default()
    });
    let (manager, registry) = manager_with(rpc, &[("b1", "r1")]);

    let error = manager
      .allocate("p1", Some("r1"), vec![], false)
      .await
      .unwrap_err();
    assert_eq!(
      error,
      AllocationError::BridgeFailed {
        restart_conference: false
      }
    );
    assert!(!registry.get("b1").unwrap().is_operational());

    // With the only bridge failed, the next allocation has nowhere to go.
    assert_eq!(
      manager.allocate("p2", Some("r1"), vec![], false).await.unwrap_err(),
      AllocationError::BridgeSelectionFailed
    );
  }

  #[tokio::test]
  async fn empty_bridges_are_expired_after_participant_removal() {
    let rpc = Arc::new(MockRpc::default());
    let (manager, _registry) = manager_with(rpc.clone(), &[("b1", "r1"), ("b2", "r2")]);
    manager.allocate("p1", Some("r1"), vec![], false).await.unwrap();
    manager.allocate("p2", Some("r2"), vec![], false).await.unwrap();

    manager.remove_participants(&["p2".to_owned()]).await;
    assert_eq!(manager.bridge_count().await, 1);
    assert_eq!(rpc.expired_conferences.lock().clone(), vec!["b2".to_owned()]);
    // Back to one bridge: the survivor's relays are torn down.
    let last_b1_relays = rpc
      .relay_calls
      .lock()
      .iter()
      .rev()
      .find(|(bridge, _)| bridge == "b1")
      .map(|(_, relays)| relays.clone())
      .unwrap();
    assert!(last_b1_relays.is_empty());
  }
}
