use std::{
  collections::{HashMap, HashSet},
  future::Future,
  pin::Pin,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use meet_focus_signaling::{
  Content, DialRequest, DialResponse, IceUdpTransport, JibriMode, JibriStatus, SessionAction,
  SessionMessage,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
  allocator::{source_contents, CancelHandle, InviteError, ParticipantChannelAllocator},
  error::{AllocationError, RequestError},
  events::{ConferenceEvent, FocusEvent},
  jibri::JibriManager,
  moderation::AvModerationState,
  roles::{MemberRole, MemberSnapshot},
  services::FocusServices,
  session_manager::ColibriSessionManager,
  signaling_queue::{SignalingQueue, SourceUpdate},
  source::{EndpointSourceSet, MediaType},
  source_map::{SharedSourceMap, SourceLimits},
  util::generate_id,
  worker::WorkerCapability,
};

const MAX_INVITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConferenceState {
  Joining,
  Running,
  Draining,
  Disposed,
}

/// Presence-level facts about a room member, as folded into the
/// participant table.
#[derive(Debug, Clone)]
pub struct ChatMember {
  pub endpoint_id: String,
  /// The member's real jid, used for authorization decisions.
  pub jid: String,
  /// Where session messages for this member are sent.
  pub address: String,
  pub region: Option<String>,
  pub robot: bool,
  pub authenticated: bool,
}

struct Participant {
  member: ChatMember,
  role: MemberRole,
  muted_audio: bool,
  muted_video: bool,
  join_order: u64,
  invite: Option<CancelHandle>,
  invite_attempts: u32,
  session_established: bool,
  supports_audio: bool,
  supports_video: bool,
  queue: SignalingQueue,
}

struct ConferenceInner {
  state: ConferenceState,
  participants: HashMap<String, Participant>,
  join_counter: u64,
  moderation: AvModerationState,
  /// Guards the linger and lone-participant timers against stale firings.
  timer_generation: u64,
}

impl ConferenceInner {
  fn human_count(&self) -> usize {
    self.participants.values().filter(|p| !p.member.robot).count()
  }

  fn members_in_join_order(&self) -> Vec<MemberSnapshot> {
    let mut members: Vec<&Participant> = self.participants.values().collect();
    members.sort_by_key(|p| p.join_order);
    members
      .into_iter()
      .map(|p| MemberSnapshot {
        endpoint_id: p.member.endpoint_id.clone(),
        robot: p.member.robot,
        authenticated: p.member.authenticated,
      })
      .collect()
  }

  /// Apply the role policy; returns (endpoint, owner?) for every change.
  fn recompute_roles(&mut self, services: &FocusServices) -> Vec<(String, bool)> {
    let owners: HashSet<String> = services
      .role_manager
      .owners(&self.members_in_join_order())
      .into_iter()
      .collect();
    let mut changes = Vec::new();
    for participant in self.participants.values_mut() {
      let should_own = owners.contains(&participant.member.endpoint_id);
      let owns = participant.role == MemberRole::Owner;
      if should_own != owns {
        participant.role = if should_own {
          MemberRole::Owner
        }
        else {
          MemberRole::Member
        };
        changes.push((participant.member.endpoint_id.clone(), should_own));
      }
    }
    changes
  }
}

/// The per-room state machine: membership, invites, source signaling,
/// moderation, and recovery when bridges die under the conference.
pub struct ConferenceSession {
  room: String,
  meeting_id: String,
  services: FocusServices,
  colibri: Arc<ColibriSessionManager>,
  jibri: Arc<JibriManager>,
  sources: SharedSourceMap,
  disposed: AtomicBool,
  inner: Mutex<ConferenceInner>,
}

impl ConferenceSession {
  pub fn new(room: String, services: FocusServices) -> Arc<Self> {
    let meeting_id = generate_id();
    info!(room = %room, meeting_id = %meeting_id, "conference created");
    let colibri = Arc::new(ColibriSessionManager::new(
      meeting_id.clone(),
      room.clone(),
      services.selector.clone(),
      services.bridge_rpc.clone(),
      services.config.clone(),
    ));
    let jibri = Arc::new(JibriManager::new(
      room.clone(),
      services.jibri_pool.clone(),
      services.worker_rpc.clone(),
      services.config.clone(),
      services.events.clone(),
    ));
    let sources = SharedSourceMap::new(SourceLimits {
      max_ssrcs_per_user: services.config.max_ssrcs_per_user,
      max_ssrc_groups_per_user: services.config.max_ssrc_groups_per_user,
    });
    let conference = Arc::new(Self {
      room,
      meeting_id: meeting_id.clone(),
      services,
      colibri,
      jibri,
      sources,
      disposed: AtomicBool::new(false),
      inner: Mutex::new(ConferenceInner {
        state: ConferenceState::Joining,
        participants: HashMap::new(),
        join_counter: 0,
        moderation: AvModerationState::default(),
        timer_generation: 0,
      }),
    });
    conference.emit_sync(ConferenceEvent::Started { meeting_id });
    conference
  }

  pub fn room(&self) -> &str {
    &self.room
  }

  pub fn meeting_id(&self) -> &str {
    &self.meeting_id
  }

  pub fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::Relaxed)
  }

  pub async fn state(&self) -> ConferenceState {
    self.inner.lock().await.state
  }

  pub async fn participant_count(&self) -> usize {
    self.inner.lock().await.participants.len()
  }

  pub async fn is_owner(&self, endpoint_id: &str) -> bool {
    self
      .inner
      .lock()
      .await
      .participants
      .get(endpoint_id)
      .map(|p| p.role == MemberRole::Owner)
      .unwrap_or(false)
  }

  pub async fn bridge_count(&self) -> usize {
    self.colibri.bridge_count().await
  }

  pub fn jibri(&self) -> &Arc<JibriManager> {
    &self.jibri
  }

  fn emit_sync(&self, event: ConferenceEvent) {
    let _ = self.services.events.try_send(FocusEvent {
      room: self.room.clone(),
      event,
    });
  }

  async fn emit(&self, event: ConferenceEvent) {
    let _ = self
      .services
      .events
      .send(FocusEvent {
        room: self.room.clone(),
        event,
      })
      .await;
  }

  /// Presence says somebody joined: fold them in, assign roles, and fire
  /// the allocate-and-invite task.
  pub async fn on_member_joined(self: &Arc<Self>, member: ChatMember) {
    let endpoint_id = member.endpoint_id.clone();
    let (mute_on_join, role_changes, lone_timer) = {
      let mut inner = self.inner.lock().await;
      if inner.state == ConferenceState::Disposed {
        return;
      }
      if let Some(existing) = inner.participants.get_mut(&endpoint_id) {
        existing.member = member;
        let changes = inner.recompute_roles(&self.services);
        drop(inner);
        self.apply_role_changes(changes).await;
        return;
      }

      inner.join_counter += 1;
      inner.timer_generation += 1;
      let join_order = inner.join_counter;

      let mut mute_on_join = Vec::new();
      let human_count = inner.human_count() + usize::from(!member.robot);
      for media_type in [MediaType::Audio, MediaType::Video] {
        let threshold = match media_type {
          MediaType::Audio => self.services.config.start_audio_muted_after,
          MediaType::Video => self.services.config.start_video_muted_after,
        };
        let start_muted = threshold.map(|n| human_count > n).unwrap_or(false);
        let moderated = inner.moderation.is_enabled(media_type)
          && !inner.moderation.is_whitelisted(media_type, &member.jid);
        if start_muted || moderated {
          mute_on_join.push(media_type);
        }
      }

      inner.participants.insert(
        endpoint_id.clone(),
        Participant {
          muted_audio: mute_on_join.contains(&MediaType::Audio),
          muted_video: mute_on_join.contains(&MediaType::Video),
          member,
          role: MemberRole::Member,
          join_order,
          invite: None,
          invite_attempts: 0,
          session_established: false,
          supports_audio: true,
          supports_video: true,
          queue: SignalingQueue::new(),
        },
      );
      if inner.state == ConferenceState::Joining {
        inner.state = ConferenceState::Running;
      }
      let role_changes = inner.recompute_roles(&self.services);
      let lone_timer = (inner.human_count() == 1).then_some(inner.timer_generation);
      (mute_on_join, role_changes, lone_timer)
    };

    self
      .emit(ConferenceEvent::ParticipantJoined {
        endpoint_id: endpoint_id.clone(),
      })
      .await;
    self.apply_role_changes(role_changes).await;
    if let Some(generation) = lone_timer {
      self.spawn_lone_participant_timer(generation);
    }
    self.spawn_invite(&endpoint_id, false, mute_on_join).await;
  }

  async fn apply_role_changes(&self, changes: Vec<(String, bool)>) {
    for (endpoint_id, owner) in changes {
      debug!(endpoint = %endpoint_id, owner, "role changed");
      self
        .emit(ConferenceEvent::RoleChanged { endpoint_id, owner })
        .await;
    }
  }

  async fn spawn_invite(self: &Arc<Self>, endpoint_id: &str, re_invite: bool, mute_on_join: Vec<MediaType>) {
    let (address, region, snapshot) = {
      let mut inner = self.inner.lock().await;
      let Some(participant) = inner.participants.get_mut(endpoint_id) else {
        return;
      };
      if let Some(previous) = participant.invite.take() {
        previous.cancel();
      }
      participant.session_established = false;
      // Everything queued so far is covered by the snapshot the offer will
      // carry; updates queued from here on are flushed after the invite.
      participant.queue.clear();
      (
        participant.member.address.clone(),
        participant.member.region.clone(),
        self.sources.snapshot(),
      )
    };

    let (allocator, handle) = ParticipantChannelAllocator::new(
      endpoint_id.to_owned(),
      address,
      region,
      re_invite,
      mute_on_join,
      self.colibri.clone(),
      self.services.signaling.clone(),
      snapshot,
      self.services.config.clone(),
    );
    {
      let mut inner = self.inner.lock().await;
      if let Some(participant) = inner.participants.get_mut(endpoint_id) {
        participant.invite = Some(handle);
      }
    }

    let conference = self.clone();
    let endpoint_id = endpoint_id.to_owned();
    tokio::spawn(async move {
      let result = allocator.run().await;
      conference.on_invite_finished(&endpoint_id, result).await;
    });
  }

  async fn on_invite_finished(
    self: &Arc<Self>,
    endpoint_id: &str,
    result: Result<crate::allocator::InviteSuccess, InviteError>,
  ) {
    match result {
      Ok(success) => {
        let still_here = {
          let mut inner = self.inner.lock().await;
          match inner.participants.get_mut(endpoint_id) {
            Some(participant) => {
              participant.invite = None;
              participant.invite_attempts = 0;
              participant.session_established = true;
              participant.supports_audio = success.supports_audio;
              participant.supports_video = success.supports_video;
              true
            },
            None => false,
          }
        };
        if still_here {
          self.flush_signaling(endpoint_id).await;
        }
        else {
          // They left while the invite was in flight; reclaim the channels.
          self
            .colibri
            .remove_participants(&[endpoint_id.to_owned()])
            .await;
        }
      },
      Err(InviteError::Cancelled) => {},
      Err(InviteError::Allocation(e)) if e.restart_conference() => {
        warn!(room = %self.room, error = %e, "bridge forgot the conference, re-inviting everyone");
        let endpoints: Vec<String> = {
          let inner = self.inner.lock().await;
          inner.participants.keys().cloned().collect()
        };
        for endpoint in endpoints {
          self.re_invite(&endpoint).await;
        }
      },
      Err(InviteError::Allocation(AllocationError::BridgeFailed { .. })) => {
        self.re_invite(endpoint_id).await;
      },
      Err(InviteError::Allocation(AllocationError::BridgeSelectionFailed)) => {
        warn!(room = %self.room, endpoint = %endpoint_id, "no bridge available");
        self
          .terminate_participant_session(endpoint_id, "no bridge available")
          .await;
      },
      Err(e) => {
        warn!(room = %self.room, endpoint = %endpoint_id, error = %e, "invite failed");
        self
          .emit(ConferenceEvent::InviteFailed {
            endpoint_id: endpoint_id.to_owned(),
          })
          .await;
      },
    }
  }

  /// Re-invite with a cap so a persistently failing participant cannot keep
  /// the conference busy forever.
  fn re_invite<'a>(
    self: &'a Arc<Self>,
    endpoint_id: &'a str,
  ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
      let allowed = {
        let mut inner = self.inner.lock().await;
        match inner.participants.get_mut(endpoint_id) {
          Some(participant) => {
            participant.invite_attempts += 1;
            participant.invite_attempts < MAX_INVITE_ATTEMPTS
          },
          None => false,
        }
      };
      if allowed {
        self.spawn_invite(endpoint_id, true, vec![]).await;
      }
      else if self.inner.lock().await.participants.contains_key(endpoint_id) {
        self
          .emit(ConferenceEvent::InviteFailed {
            endpoint_id: endpoint_id.to_owned(),
          })
          .await;
      }
    })
  }

  async fn terminate_participant_session(&self, endpoint_id: &str, reason: &str) {
    let address = {
      let inner = self.inner.lock().await;
      inner
        .participants
        .get(endpoint_id)
        .map(|p| p.member.address.clone())
    };
    if let Some(address) = address {
      let message = SessionMessage::new(SessionAction::SessionTerminate, generate_id());
      if let Err(e) = self
        .services
        .signaling
        .send_session_message(&address, &message)
        .await
      {
        debug!(endpoint = %endpoint_id, error = %e, "session-terminate not delivered");
      }
    }
    self
      .emit(ConferenceEvent::SessionTerminated {
        endpoint_id: endpoint_id.to_owned(),
        reason: reason.to_owned(),
      })
      .await;
  }

  /// Presence says somebody left: tear down their channels, withdraw their
  /// sources from the room, and elect a new owner if needed.
  pub async fn on_member_left(self: &Arc<Self>, endpoint_id: &str) {
    let (role_changes, linger, recipients) = {
      let mut inner = self.inner.lock().await;
      let Some(mut participant) = inner.participants.remove(endpoint_id) else {
        return;
      };
      if let Some(invite) = participant.invite.take() {
        invite.cancel();
      }
      let recipients = match self.sources.remove_owner(endpoint_id) {
        Some(removed) => Self::queue_to_peers(
          &mut inner,
          Some(endpoint_id),
          SourceUpdate::Remove(crate::source_map::ConferenceSourceMap::from_owner(
            endpoint_id,
            removed,
          )),
        ),
        None => vec![],
      };
      let role_changes = inner.recompute_roles(&self.services);
      inner.timer_generation += 1;
      let linger = (inner.human_count() == 0).then_some(inner.timer_generation);
      (role_changes, linger, recipients)
    };

    self.colibri.remove_participants(&[endpoint_id.to_owned()]).await;
    for recipient in recipients {
      self.flush_signaling(&recipient).await;
    }
    self
      .emit(ConferenceEvent::ParticipantLeft {
        endpoint_id: endpoint_id.to_owned(),
      })
      .await;
    self.apply_role_changes(role_changes).await;

    if let Some(generation) = linger {
      self.spawn_linger_timer(generation);
    }
  }

  fn spawn_linger_timer(self: &Arc<Self>, generation: u64) {
    let conference = self.clone();
    let linger = self.services.config.conference_linger;
    tokio::spawn(async move {
      tokio::time::sleep(linger).await;
      let expired = {
        let inner = conference.inner.lock().await;
        inner.timer_generation == generation && inner.human_count() == 0
      };
      if expired {
        info!(room = %conference.room, "conference empty after linger");
        conference.dispose().await;
      }
    });
  }

  fn spawn_lone_participant_timer(self: &Arc<Self>, generation: u64) {
    let conference = self.clone();
    let start_timeout = self.services.config.conference_start_timeout;
    tokio::spawn(async move {
      tokio::time::sleep(start_timeout).await;
      let lone = {
        let inner = conference.inner.lock().await;
        if inner.timer_generation != generation || inner.human_count() != 1 {
          None
        }
        else {
          inner
            .participants
            .values()
            .find(|p| !p.member.robot)
            .map(|p| p.member.endpoint_id.clone())
        }
      };
      if let Some(endpoint_id) = lone {
        info!(room = %conference.room, endpoint = %endpoint_id, "nobody else joined");
        conference
          .terminate_participant_session(&endpoint_id, "nobody else joined")
          .await;
      }
    });
  }

  /// The participant accepted the offer and advertised its sources.
  pub async fn on_session_accept(
    self: &Arc<Self>,
    endpoint_id: &str,
    contents: &[Content],
  ) -> Result<(), RequestError> {
    {
      let mut inner = self.inner.lock().await;
      if let Some(participant) = inner.participants.get_mut(endpoint_id) {
        participant.session_established = true;
      }
    }
    self.add_participant_sources(endpoint_id, contents).await
  }

  pub async fn on_source_add(
    self: &Arc<Self>,
    endpoint_id: &str,
    contents: &[Content],
  ) -> Result<(), RequestError> {
    self.add_participant_sources(endpoint_id, contents).await
  }

  async fn add_participant_sources(
    self: &Arc<Self>,
    endpoint_id: &str,
    contents: &[Content],
  ) -> Result<(), RequestError> {
    let set = EndpointSourceSet::parse(contents).map_err(RequestError::from)?;
    if set.is_empty() {
      return Ok(());
    }
    // Map mutation and peer queueing happen in one critical section, so an
    // invite snapshot can never half-see an update.
    let (accepted, updated, recipients) = {
      let mut inner = self.inner.lock().await;
      let accepted = self
        .sources
        .try_to_add(endpoint_id, &set)
        .map_err(RequestError::from)?;
      if accepted.is_empty() {
        return Ok(());
      }
      let update = SourceUpdate::Add(crate::source_map::ConferenceSourceMap::from_owner(
        endpoint_id,
        accepted.clone(),
      ));
      let recipients = Self::queue_to_peers(&mut inner, Some(endpoint_id), update);
      let updated = self.sources.reader().get(endpoint_id).unwrap_or_default();
      (accepted, updated, recipients)
    };
    self.colibri.add_sources(endpoint_id, &accepted, &updated).await;
    for recipient in recipients {
      self.flush_signaling(&recipient).await;
    }
    Ok(())
  }

  pub async fn on_source_remove(
    self: &Arc<Self>,
    endpoint_id: &str,
    contents: &[Content],
  ) -> Result<(), RequestError> {
    let set = EndpointSourceSet::parse(contents).map_err(RequestError::from)?;
    let (removed, updated, recipients) = {
      let mut inner = self.inner.lock().await;
      let removed = self
        .sources
        .try_to_remove(endpoint_id, &set)
        .map_err(RequestError::from)?;
      if removed.is_empty() {
        return Ok(());
      }
      let update = SourceUpdate::Remove(crate::source_map::ConferenceSourceMap::from_owner(
        endpoint_id,
        removed.clone(),
      ));
      let recipients = Self::queue_to_peers(&mut inner, Some(endpoint_id), update);
      let updated = self.sources.reader().get(endpoint_id).unwrap_or_default();
      (removed, updated, recipients)
    };
    self.colibri.remove_sources(endpoint_id, &removed, &updated).await;
    for recipient in recipients {
      self.flush_signaling(&recipient).await;
    }
    Ok(())
  }

  pub async fn on_transport_info(&self, endpoint_id: &str, transport: IceUdpTransport) {
    self.colibri.update_transport(endpoint_id, transport).await;
  }

  /// Queue an update to every participant except its origin; returns the
  /// established ones, whose queues should be flushed.
  fn queue_to_peers(
    inner: &mut ConferenceInner,
    from: Option<&str>,
    update: SourceUpdate,
  ) -> Vec<String> {
    let mut recipients = Vec::new();
    for participant in inner.participants.values_mut() {
      if Some(participant.member.endpoint_id.as_str()) == from {
        continue;
      }
      match &update {
        SourceUpdate::Add(map) => participant.queue.queue_add(map.clone()),
        SourceUpdate::Remove(map) => participant.queue.queue_remove(map.clone()),
      }
      if participant.session_established {
        recipients.push(participant.member.endpoint_id.clone());
      }
    }
    recipients
  }

  /// Drain a participant's queue and send the coalesced updates, filtered
  /// to what that participant can receive.
  async fn flush_signaling(self: &Arc<Self>, endpoint_id: &str) {
    let (address, audio, video, updates) = {
      let mut inner = self.inner.lock().await;
      let Some(participant) = inner.participants.get_mut(endpoint_id) else {
        return;
      };
      if !participant.session_established || participant.queue.is_empty() {
        return;
      }
      (
        participant.member.address.clone(),
        participant.supports_audio,
        participant.supports_video,
        participant.queue.flush(),
      )
    };

    for update in updates {
      let (action, map) = match update {
        SourceUpdate::Add(map) => (SessionAction::SourceAdd, map),
        SourceUpdate::Remove(map) => (SessionAction::SourceRemove, map),
      };
      let map = if self.services.config.strip_simulcast {
        match map.strip_simulcast() {
          Ok(stripped) => stripped,
          Err(e) => {
            warn!(endpoint = %endpoint_id, error = %e, "skipping malformed source update");
            continue;
          },
        }
      }
      else {
        map
      };
      let contents = source_contents(&map, audio, video);
      if contents.is_empty() {
        continue;
      }
      let mut message = SessionMessage::new(action, generate_id());
      message.initiator = Some(self.services.config.focus_jid.clone());
      message.contents = contents;
      if let Err(e) = self
        .services
        .signaling
        .send_session_message(&address, &message)
        .await
      {
        warn!(endpoint = %endpoint_id, error = %e, "source update not delivered");
      }
    }
  }

  /// Muting rules: moderators may mute others, nobody may unmute others,
  /// and self-unmute is governed by the moderation state.
  pub async fn mute(
    self: &Arc<Self>,
    actor_endpoint: &str,
    target_endpoint: &str,
    media_type: MediaType,
    mute: bool,
  ) -> Result<(), RequestError> {
    let (address, notify) = {
      let mut inner = self.inner.lock().await;
      let actor = inner
        .participants
        .get(actor_endpoint)
        .ok_or_else(|| RequestError::ItemNotFound(actor_endpoint.to_owned()))?;
      let actor_role = actor.role;
      let actor_jid = actor.member.jid.clone();

      if actor_endpoint != target_endpoint {
        if !mute {
          return Err(RequestError::Forbidden);
        }
        if actor_role != MemberRole::Owner {
          return Err(RequestError::Forbidden);
        }
      }
      else if !mute
        && inner.moderation.is_enabled(media_type)
        && actor_role != MemberRole::Owner
        && !inner.moderation.is_whitelisted(media_type, &actor_jid)
      {
        return Err(RequestError::Forbidden);
      }

      let target = inner
        .participants
        .get_mut(target_endpoint)
        .ok_or_else(|| RequestError::ItemNotFound(target_endpoint.to_owned()))?;
      match media_type {
        MediaType::Audio => target.muted_audio = mute,
        MediaType::Video => target.muted_video = mute,
      }
      (
        target.member.address.clone(),
        actor_endpoint != target_endpoint,
      )
    };

    if notify {
      self
        .services
        .signaling
        .send_mute(&address, media_type, mute)
        .await
        .map_err(|e| RequestError::UndefinedCondition(e.to_string()))?;
    }
    if mute {
      self
        .emit(ConferenceEvent::ParticipantMuted {
          endpoint_id: target_endpoint.to_owned(),
          media_type,
        })
        .await;
    }
    Ok(())
  }

  /// Flip A/V moderation; switching a media type on mutes every non-owner
  /// not on the whitelist.
  pub async fn set_av_moderation(
    self: &Arc<Self>,
    media_type: MediaType,
    enable: bool,
    whitelist: Option<Vec<String>>,
  ) {
    let to_mute: Vec<(String, String)> = {
      let mut inner = self.inner.lock().await;
      if let Some(whitelist) = whitelist {
        inner.moderation.set_whitelist(media_type, whitelist);
      }
      if !inner.moderation.set_enabled(media_type, enable) {
        vec![]
      }
      else {
        let exempt: Vec<String> = inner
          .participants
          .values()
          .filter(|p| {
            p.role == MemberRole::Owner
              || inner.moderation.is_whitelisted(media_type, &p.member.jid)
          })
          .map(|p| p.member.endpoint_id.clone())
          .collect();
        inner
          .participants
          .values_mut()
          .filter(|p| !exempt.contains(&p.member.endpoint_id))
          .map(|p| {
            match media_type {
              MediaType::Audio => p.muted_audio = true,
              MediaType::Video => p.muted_video = true,
            }
            (p.member.endpoint_id.clone(), p.member.address.clone())
          })
          .collect()
      }
    };

    for (endpoint_id, address) in &to_mute {
      if let Err(e) = self
        .services
        .signaling
        .send_mute(address, media_type, true)
        .await
      {
        warn!(endpoint = %endpoint_id, error = %e, "moderation mute not delivered");
      }
      self
        .emit(ConferenceEvent::ParticipantMuted {
          endpoint_id: endpoint_id.clone(),
          media_type,
        })
        .await;
    }
    self
      .emit(ConferenceEvent::ModerationChanged {
        media_type,
        enabled: enable,
      })
      .await;
  }

  /// Bridges died under us. Their participants keep their signaling
  /// sessions; only the bridge side is replaced.
  pub async fn on_bridges_down(self: &Arc<Self>, bridges: HashSet<String>) {
    let affected = self.colibri.bridges_down(&bridges).await;
    if affected.is_empty() {
      return;
    }
    info!(room = %self.room, count = affected.len(), "re-inviting participants of failed bridges");
    for endpoint_id in affected {
      self.spawn_invite(&endpoint_id, true, vec![]).await;
    }
  }

  fn is_trusted_domain(&self, jid: &str) -> bool {
    jid
      .split('@')
      .nth(1)
      .map(|rest| rest.split('/').next().unwrap_or(rest))
      .map(|domain| {
        self
          .services
          .config
          .trusted_domains
          .iter()
          .any(|d| d == domain)
      })
      .unwrap_or(false)
  }

  async fn authorize_external_service(&self, endpoint_id: &str) -> Result<String, RequestError> {
    let inner = self.inner.lock().await;
    let participant = inner
      .participants
      .get(endpoint_id)
      .ok_or(RequestError::Forbidden)?;
    if participant.role == MemberRole::Owner || self.is_trusted_domain(&participant.member.jid) {
      Ok(participant.member.jid.clone())
    }
    else {
      Err(RequestError::Forbidden)
    }
  }

  /// Start a recording/stream/SIP leg, if the requester is allowed to.
  pub async fn start_jibri(
    self: &Arc<Self>,
    from_endpoint: &str,
    mode: JibriMode,
    stream_id: Option<String>,
    sip_address: Option<String>,
    app_data: Option<serde_json::Value>,
  ) -> Result<JibriStatus, RequestError> {
    let initiator = self.authorize_external_service(from_endpoint).await?;
    let regions = self.colibri.bridge_regions().await;
    self
      .jibri
      .start(mode, initiator, stream_id, sip_address, app_data, regions)
      .await
      .map_err(RequestError::from)
  }

  pub async fn stop_jibri(
    self: &Arc<Self>,
    from_endpoint: &str,
    session_id: &str,
  ) -> Result<JibriStatus, RequestError> {
    let terminator = self.authorize_external_service(from_endpoint).await?;
    Ok(self.jibri.stop(session_id, terminator).await)
  }

  /// Invite a SIP participant through a gateway. Any member may dial out
  /// when the deployment has a gateway.
  pub async fn dial_out(
    self: &Arc<Self>,
    from_endpoint: &str,
    request: &DialRequest,
  ) -> Result<DialResponse, RequestError> {
    {
      let inner = self.inner.lock().await;
      if !inner.participants.contains_key(from_endpoint) {
        return Err(RequestError::Forbidden);
      }
    }
    if !self.services.config.sip_gateway_enabled {
      return Err(RequestError::ServiceUnavailable(
        "no sip gateway configured".to_owned(),
      ));
    }
    // The reserved destination asks for a transcriber instead of a SIP leg.
    let capability = if request.destination == "jitsi_meet_transcribe" {
      WorkerCapability::Transcription
    }
    else {
      WorkerCapability::Sip
    };
    let regions = self.colibri.bridge_regions().await;
    self
      .services
      .jigasi
      .dial_out(request, capability, &regions)
      .await
  }

  /// Graceful shutdown: keep running, accept no new life, dispose once
  /// everyone is gone.
  pub async fn begin_draining(self: &Arc<Self>) {
    let empty = {
      let mut inner = self.inner.lock().await;
      if matches!(inner.state, ConferenceState::Disposed) {
        return;
      }
      inner.state = ConferenceState::Draining;
      inner.human_count() == 0
    };
    if empty {
      self.dispose().await;
    }
  }

  /// Tear everything down: cancel invites, terminate signaling sessions,
  /// expire the conference on every bridge.
  pub async fn dispose(self: &Arc<Self>) {
    if self.disposed.swap(true, Ordering::Relaxed) {
      return;
    }
    info!(room = %self.room, "disposing conference");
    let addresses: Vec<String> = {
      let mut inner = self.inner.lock().await;
      inner.state = ConferenceState::Disposed;
      inner.timer_generation += 1;
      for participant in inner.participants.values_mut() {
        if let Some(invite) = participant.invite.take() {
          invite.cancel();
        }
        participant.queue.clear();
      }
      inner
        .participants
        .values()
        .map(|p| p.member.address.clone())
        .collect()
    };
    for address in addresses {
      let message = SessionMessage::new(SessionAction::SessionTerminate, generate_id());
      let _ = self
        .services
        .signaling
        .send_session_message(&address, &message)
        .await;
    }
    self.colibri.expire_all().await;
    self.emit(ConferenceEvent::Disposed).await;
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use maplit::hashset;

  use super::*;
  use crate::test_support::{test_config, test_services, RecordingSignaling};
  use meet_focus_signaling::{RtpDescription, SourceElement};

  struct TestHarness {
    services: FocusServices,
    signaling: Arc<RecordingSignaling>,
  }

  fn harness(bridges: &[(&str, &str)]) -> TestHarness {
    let signaling = Arc::new(RecordingSignaling::default());
    let services = test_services(test_config(), signaling.clone(), bridges);
    TestHarness {
      services,
      signaling,
    }
  }

  fn member(endpoint_id: &str) -> ChatMember {
    ChatMember {
      endpoint_id: endpoint_id.to_owned(),
      jid: format!("{endpoint_id}@example.com/res"),
      address: format!("room@muc/{endpoint_id}"),
      region: None,
      robot: false,
      authenticated: false,
    }
  }

  fn sources_content(ssrc: u32, msid: &str) -> Vec<Content> {
    let mut description = RtpDescription::new("audio");
    let mut element = SourceElement::new(ssrc);
    element.msid = Some(msid.to_owned());
    description.ssrcs.push(element);
    vec![Content::new("audio").with_description(description)]
  }

  #[tokio::test]
  async fn joining_member_is_invited() {
    let h = harness(&[("b1", "r1")]);
    let conference = ConferenceSession::new("room@muc".to_owned(), h.services.clone());
    conference.on_member_joined(member("alice")).await;
    assert_eq!(conference.state().await, ConferenceState::Running);

    let offer = h
      .signaling
      .wait_for_message("room@muc/alice", SessionAction::SessionInitiate)
      .await;
    // The offer carries the bridge's feedback sources with their
    // deterministic names.
    let names: Vec<String> = offer
      .contents
      .iter()
      .filter_map(|c| c.description.as_ref())
      .flat_map(|d| d.ssrcs.iter())
      .filter_map(|s| s.name.clone())
      .collect();
    assert!(names.contains(&"jvb-a0".to_owned()));
    assert!(names.contains(&"jvb-v0".to_owned()));
  }

  #[tokio::test]
  async fn accepted_sources_are_signaled_to_peers() {
    let h = harness(&[("b1", "r1")]);
    let conference = ConferenceSession::new("room@muc".to_owned(), h.services.clone());
    conference.on_member_joined(member("alice")).await;
    conference.on_member_joined(member("bob")).await;
    h.signaling
      .wait_for_message("room@muc/alice", SessionAction::SessionInitiate)
      .await;
    h.signaling
      .wait_for_message("room@muc/bob", SessionAction::SessionInitiate)
      .await;

    conference
      .on_session_accept("alice", &sources_content(101, "m-alice"))
      .await
      .unwrap();

    let add = h
      .signaling
      .wait_for_message("room@muc/bob", SessionAction::SourceAdd)
      .await;
    let ssrcs: Vec<u32> = add
      .contents
      .iter()
      .filter_map(|c| c.description.as_ref())
      .flat_map(|d| d.ssrcs.iter())
      .map(|s| s.id)
      .collect();
    assert_eq!(ssrcs, vec![101]);
    // Alice must not be told about her own sources.
    assert!(h
      .signaling
      .messages_for("room@muc/alice")
      .iter()
      .all(|m| m.action != SessionAction::SourceAdd));
  }

  #[tokio::test]
  async fn duplicate_ssrc_from_second_member_is_rejected() {
    let h = harness(&[("b1", "r1")]);
    let conference = ConferenceSession::new("room@muc".to_owned(), h.services.clone());
    conference.on_member_joined(member("alice")).await;
    conference.on_member_joined(member("bob")).await;
    h.signaling
      .wait_for_message("room@muc/alice", SessionAction::SessionInitiate)
      .await;
    h.signaling
      .wait_for_message("room@muc/bob", SessionAction::SessionInitiate)
      .await;

    conference
      .on_session_accept("alice", &sources_content(101, "m-alice"))
      .await
      .unwrap();
    let error = conference
      .on_session_accept("bob", &sources_content(101, "m-bob"))
      .await
      .unwrap_err();
    assert!(matches!(error, RequestError::BadRequest(_)));
  }

  #[tokio::test]
  async fn bridge_down_re_invites_with_transport_replace() {
    let h = harness(&[("b1", "r1"), ("b2", "r2")]);
    let conference = ConferenceSession::new("room@muc".to_owned(), h.services.clone());
    let mut alice = member("alice");
    alice.region = Some("r1".to_owned());
    conference.on_member_joined(alice).await;
    h.signaling
      .wait_for_message("room@muc/alice", SessionAction::SessionInitiate)
      .await;

    conference
      .on_bridges_down(hashset! {"b1".to_owned()})
      .await;
    let replace = h
      .signaling
      .wait_for_message("room@muc/alice", SessionAction::TransportReplace)
      .await;
    assert_eq!(replace.action, SessionAction::TransportReplace);
  }

  #[tokio::test]
  async fn mute_rules_are_enforced() {
    let h = harness(&[("b1", "r1")]);
    let conference = ConferenceSession::new("room@muc".to_owned(), h.services.clone());
    conference.on_member_joined(member("alice")).await;
    conference.on_member_joined(member("bob")).await;

    // Alice joined first: auto-owner makes her the moderator.
    conference
      .mute("alice", "bob", MediaType::Audio, true)
      .await
      .unwrap();
    // Un-muting someone else is never allowed, even for the owner.
    assert_eq!(
      conference
        .mute("alice", "bob", MediaType::Audio, false)
        .await
        .unwrap_err(),
      RequestError::Forbidden
    );
    // A plain member cannot mute others.
    assert_eq!(
      conference
        .mute("bob", "alice", MediaType::Audio, true)
        .await
        .unwrap_err(),
      RequestError::Forbidden
    );
    // Self-mute and self-unmute are fine while moderation is off.
    conference
      .mute("bob", "bob", MediaType::Audio, true)
      .await
      .unwrap();
    conference
      .mute("bob", "bob", MediaType::Audio, false)
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn enabling_moderation_mutes_non_owners() {
    let h = harness(&[("b1", "r1")]);
    let conference = ConferenceSession::new("room@muc".to_owned(), h.services.clone());
    conference.on_member_joined(member("alice")).await;
    conference.on_member_joined(member("bob")).await;

    conference
      .set_av_moderation(MediaType::Audio, true, None)
      .await;
    let mutes = h.signaling.mutes.lock().clone();
    // Bob (non-owner) was muted; Alice (owner) was not.
    assert!(mutes.contains(&("room@muc/bob".to_owned(), MediaType::Audio, true)));
    assert!(!mutes.iter().any(|(to, _, _)| to == "room@muc/alice"));

    // Bob may not unmute himself while moderation is on.
    assert_eq!(
      conference
        .mute("bob", "bob", MediaType::Audio, false)
        .await
        .unwrap_err(),
      RequestError::Forbidden
    );
  }

  #[tokio::test]
  async fn conference_disposes_after_linger() {
    let h = harness(&[("b1", "r1")]);
    let conference = ConferenceSession::new("room@muc".to_owned(), h.services.clone());
    conference.on_member_joined(member("alice")).await;
    h.signaling
      .wait_for_message("room@muc/alice", SessionAction::SessionInitiate)
      .await;
    conference.on_member_left("alice").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(conference.is_disposed());
    assert_eq!(conference.state().await, ConferenceState::Disposed);
  }

  #[tokio::test]
  async fn leaving_member_sources_are_withdrawn() {
    let h = harness(&[("b1", "r1")]);
    let conference = ConferenceSession::new("room@muc".to_owned(), h.services.clone());
    conference.on_member_joined(member("alice")).await;
    conference.on_member_joined(member("bob")).await;
    h.signaling
      .wait_for_message("room@muc/alice", SessionAction::SessionInitiate)
      .await;
    h.signaling
      .wait_for_message("room@muc/bob", SessionAction::SessionInitiate)
      .await;
    conference
      .on_session_accept("alice", &sources_content(101, "m-alice"))
      .await
      .unwrap();
    h.signaling
      .wait_for_message("room@muc/bob", SessionAction::SourceAdd)
      .await;

    conference.on_member_left("alice").await;
    let remove = h
      .signaling
      .wait_for_message("room@muc/bob", SessionAction::SourceRemove)
      .await;
    let ssrcs: Vec<u32> = remove
      .contents
      .iter()
      .filter_map(|c| c.description.as_ref())
      .flat_map(|d| d.ssrcs.iter())
      .map(|s| s.id)
      .collect();
    assert_eq!(ssrcs, vec![101]);
  }
}
