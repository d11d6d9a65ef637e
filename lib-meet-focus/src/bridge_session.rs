use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
  bridge::Bridge,
  colibri::{AllocationRequest, BridgeRpc, ColibriAllocation, EndpointUpdate},
  error::ColibriError,
  source_map::ConferenceSourceMap,
  util::generate_session_id,
};

struct SessionState {
  /// Endpoint ids pinned to this bridge, in allocation order. The relay is
  /// not a member of this list.
  participants: Vec<String>,
  relays: Vec<String>,
  relay_established: bool,
  queued_relay_adds: ConferenceSourceMap,
  queued_relay_removes: ConferenceSourceMap,
}

/// The allocation of one conference on one bridge. All writes to the bridge
/// go through this session's lock, so they never interleave.
pub struct BridgeSession {
  id: String,
  conference_id: String,
  bridge: Arc<Bridge>,
  rpc: Arc<dyn BridgeRpc>,
  has_failed: AtomicBool,
  state: Mutex<SessionState>,
}

impl BridgeSession {
  pub fn new(conference_id: String, bridge: Arc<Bridge>, rpc: Arc<dyn BridgeRpc>) -> Self {
    Self {
      id: generate_session_id(),
      conference_id,
      bridge,
      rpc,
      has_failed: AtomicBool::new(false),
      state: Mutex::new(SessionState {
        participants: Vec::new(),
        relays: Vec::new(),
        relay_established: false,
        queued_relay_adds: ConferenceSourceMap::new(),
        queued_relay_removes: ConferenceSourceMap::new(),
      }),
    }
  }

  /// The 24-bit id clients echo back, so stale ICE-failure reports can be
  /// told apart from current ones.
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn bridge(&self) -> &Arc<Bridge> {
    &self.bridge
  }

  pub fn has_failed(&self) -> bool {
    self.has_failed.load(Ordering::Relaxed)
  }

  pub fn set_failed(&self) {
    self.has_failed.store(true, Ordering::Relaxed);
  }

  pub async fn participants(&self) -> Vec<String> {
    self.state.lock().await.participants.clone()
  }

  pub async fn participant_count(&self) -> usize {
    self.state.lock().await.participants.len()
  }

  pub async fn has_participant(&self, endpoint_id: &str) -> bool {
    self
      .state
      .lock()
      .await
      .participants
      .iter()
      .any(|p| p == endpoint_id)
  }

  /// One-shot channel allocation for an endpoint on this bridge. On success
  /// the endpoint is pinned to this session.
  pub async fn allocate(
    &self,
    request: &AllocationRequest,
  ) -> Result<ColibriAllocation, ColibriError> {
    let mut state = self.state.lock().await;
    let allocation = self.rpc.allocate(self.bridge.jid(), request).await?;
    if !state.participants.iter().any(|p| p == &request.endpoint_id) {
      state.participants.push(request.endpoint_id.clone());
    }
    Ok(allocation)
  }

  /// Push an endpoint's RTP description, sources, or transport to the
  /// bridge.
  pub async fn update_participant(&self, update: &EndpointUpdate) -> Result<(), ColibriError> {
    let _state = self.state.lock().await;
    self
      .rpc
      .update_endpoint(self.bridge.jid(), &self.conference_id, update)
      .await
  }

  /// Expire one endpoint's channels and forget it.
  pub async fn terminate(&self, endpoint_id: &str) -> Result<(), ColibriError> {
    let mut state = self.state.lock().await;
    state.participants.retain(|p| p != endpoint_id);
    if self.has_failed() {
      return Ok(());
    }
    self
      .rpc
      .expire_endpoint(self.bridge.jid(), &self.conference_id, endpoint_id)
      .await
  }

  /// Abort every real participant's allocation. Returns the endpoints whose
  /// sessions were cut.
  pub async fn terminate_all(&self) -> Vec<String> {
    let mut state = self.state.lock().await;
    std::mem::take(&mut state.participants)
  }

  /// Point this bridge's relay at the given remote relays. An empty list
  /// tears the relay down. Once the relay exists, queued source updates are
  /// flushed to it.
  pub async fn set_relays(&self, relays: Vec<String>) -> Result<(), ColibriError> {
    let mut state = self.state.lock().await;
    if state.relays == relays && (state.relay_established || relays.is_empty()) {
      return Ok(());
    }
    state.relays = relays.clone();
    if relays.is_empty() {
      state.relay_established = false;
      debug!(bridge = %self.bridge.jid(), "tearing down relay");
      return self
        .rpc
        .set_relays(self.bridge.jid(), &self.conference_id, &[])
        .await;
    }
    self
      .rpc
      .set_relays(self.bridge.jid(), &self.conference_id, &relays)
      .await?;
    state.relay_established = true;

    let adds = std::mem::take(&mut state.queued_relay_adds);
    let removes = std::mem::take(&mut state.queued_relay_removes);
    if !adds.is_empty() {
      self
        .rpc
        .update_relay_sources(self.bridge.jid(), &self.conference_id, &adds, false)
        .await?;
    }
    if !removes.is_empty() {
      self
        .rpc
        .update_relay_sources(self.bridge.jid(), &self.conference_id, &removes, true)
        .await?;
    }
    Ok(())
  }

  /// Advertise remote participants' sources through the relay; queued until
  /// the relay is established.
  pub async fn add_sources_to_relay(
    &self,
    sources: &ConferenceSourceMap,
  ) -> Result<(), ColibriError> {
    let mut state = self.state.lock().await;
    if !state.relay_established {
      state.queued_relay_removes = std::mem::take(&mut state.queued_relay_removes) - sources;
      state.queued_relay_adds = std::mem::take(&mut state.queued_relay_adds) + sources;
      return Ok(());
    }
    self
      .rpc
      .update_relay_sources(self.bridge.jid(), &self.conference_id, sources, false)
      .await
  }

  pub async fn remove_sources_from_relay(
    &self,
    sources: &ConferenceSourceMap,
  ) -> Result<(), ColibriError> {
    let mut state = self.state.lock().await;
    if !state.relay_established {
      state.queued_relay_adds = std::mem::take(&mut state.queued_relay_adds) - sources;
      state.queued_relay_removes = std::mem::take(&mut state.queued_relay_removes) + sources;
      return Ok(());
    }
    self
      .rpc
      .update_relay_sources(self.bridge.jid(), &self.conference_id, sources, true)
      .await
  }

  /// End this session. A healthy bridge gets a conference expire; a faulty
  /// one does not, to avoid blocking on a dead peer.
  pub async fn dispose(&self, faulty: bool) {
    let _state = self.state.lock().await;
    if faulty || self.has_failed() {
      debug!(bridge = %self.bridge.jid(), "disposing failed bridge session without expire");
      return;
    }
    if let Err(e) = self
      .rpc
      .expire_conference(self.bridge.jid(), &self.conference_id)
      .await
    {
      warn!(bridge = %self.bridge.jid(), error = %e, "conference expire failed");
    }
  }
}
