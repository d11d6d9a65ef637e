use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use meet_focus_signaling::{
  Content, PayloadType, RtpDescription, SctpMap, SessionAction, SessionMessage, SourceElement,
  SsrcGroupElement,
};
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  config::FocusConfig,
  error::AllocationError,
  session_manager::ColibriSessionManager,
  signaling::{features, SignalingSender},
  source::MediaType,
  source_map::ConferenceSourceMap,
};

/// What the conference learns from a completed invite.
#[derive(Debug, Clone, Copy)]
pub struct InviteSuccess {
  pub supports_audio: bool,
  pub supports_video: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InviteError {
  #[error(transparent)]
  Allocation(#[from] AllocationError),
  #[error("signaling to the participant failed: {0}")]
  Signaling(String),
  #[error("the invite was cancelled")]
  Cancelled,
}

/// Raised by the conference to abort an in-flight invite; checked at the
/// task's step boundaries.
#[derive(Debug, Clone)]
pub struct CancelHandle {
  cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::Relaxed);
  }
}

/// The one-shot invite (or re-invite) handshake for one participant:
/// discover features, build the offer, allocate channels, decorate the
/// offer with bridge transport and everyone's sources, send it, and apply
/// moderation.
pub struct ParticipantChannelAllocator {
  endpoint_id: String,
  address: String,
  region: Option<String>,
  re_invite: bool,
  mute_on_join: Vec<MediaType>,
  cancelled: Arc<AtomicBool>,
  manager: Arc<ColibriSessionManager>,
  signaling: Arc<dyn SignalingSender>,
  /// Snapshot of the room's sources taken when the invite was scheduled;
  /// changes after that point reach the participant as queued updates.
  sources: ConferenceSourceMap,
  config: Arc<FocusConfig>,
}

impl ParticipantChannelAllocator {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    endpoint_id: String,
    address: String,
    region: Option<String>,
    re_invite: bool,
    mute_on_join: Vec<MediaType>,
    manager: Arc<ColibriSessionManager>,
    signaling: Arc<dyn SignalingSender>,
    sources: ConferenceSourceMap,
    config: Arc<FocusConfig>,
  ) -> (Self, CancelHandle) {
    let cancelled = Arc::new(AtomicBool::new(false));
    let handle = CancelHandle {
      cancelled: cancelled.clone(),
    };
    (
      Self {
        endpoint_id,
        address,
        region,
        re_invite,
        mute_on_join,
        cancelled,
        manager,
        signaling,
        sources,
        config,
      },
      handle,
    )
  }

  fn check_cancelled(&self) -> Result<(), InviteError> {
    if self.cancelled.load(Ordering::Relaxed) {
      Err(InviteError::Cancelled)
    }
    else {
      Ok(())
    }
  }

  pub async fn run(self) -> Result<InviteSuccess, InviteError> {
    self.check_cancelled()?;

    let features = match self.signaling.discover_features(&self.address).await {
      Ok(features) => Some(features),
      Err(e) => {
        debug!(endpoint = %self.endpoint_id, error = %e, "feature discovery failed, assuming defaults");
        None
      },
    };
    let supports = |var: &str| {
      features
        .as_ref()
        .map(|f| f.iter().any(|v| v == var))
        .unwrap_or(true)
    };
    let supports_audio = supports(features::AUDIO);
    let supports_video = supports(features::VIDEO);
    let use_sctp = self.config.enable_sctp && supports(features::SCTP);
    self.check_cancelled()?;

    let mut contents = base_offer(&self.config, supports_audio, supports_video);
    self.check_cancelled()?;

    let outcome = self
      .manager
      .allocate(
        &self.endpoint_id,
        self.region.as_deref(),
        contents.clone(),
        use_sctp,
      )
      .await
      .map_err(InviteError::Allocation)?;

    if self.cancelled.load(Ordering::Relaxed) {
      // Channels exist by now; reclaim them.
      self.manager.remove_participants(&[self.endpoint_id.clone()]).await;
      return Err(InviteError::Cancelled);
    }

    let mut transport = outcome.allocation.transport.clone();
    if use_sctp && transport.sctp.is_none() {
      transport.sctp = Some(SctpMap::web_rtc_channel());
    }
    for content in &mut contents {
      content.transport = Some(transport.clone());
    }

    let mut peer_sources = self.sources.without_owner(&self.endpoint_id);
    if self.config.strip_simulcast {
      peer_sources = peer_sources
        .strip_simulcast()
        .map_err(|e| InviteError::Signaling(e.to_string()))?;
    }
    add_sources_to_contents(&mut contents, &peer_sources, supports_audio, supports_video);

    let feedback = feedback_sources(&outcome.allocation.feedback_sources);
    add_sources_to_contents(&mut contents, &feedback, supports_audio, supports_video);

    let action = if self.re_invite {
      SessionAction::TransportReplace
    }
    else {
      SessionAction::SessionInitiate
    };
    let mut message = SessionMessage::new(action, outcome.bridge_session_id.clone());
    message.initiator = Some(self.config.focus_jid.clone());
    message.contents = contents;

    debug!(
      endpoint = %self.endpoint_id,
      bridge = %outcome.bridge_jid,
      action = message.action.as_str(),
      "sending offer"
    );
    if let Err(e) = self
      .signaling
      .send_session_message(&self.address, &message)
      .await
    {
      warn!(endpoint = %self.endpoint_id, error = %e, "offer was not acknowledged");
      self.manager.remove_participants(&[self.endpoint_id.clone()]).await;
      return Err(InviteError::Signaling(e.to_string()));
    }

    for media_type in &self.mute_on_join {
      if let Err(e) = self
        .signaling
        .send_mute(&self.address, *media_type, true)
        .await
      {
        warn!(endpoint = %self.endpoint_id, error = %e, "failed to mute on join");
      }
    }
    Ok(InviteSuccess {
      supports_audio,
      supports_video,
    })
  }
}

/// Contents carrying only sources, for incremental source signaling.
pub(crate) fn source_contents(
  sources: &ConferenceSourceMap,
  audio: bool,
  video: bool,
) -> Vec<Content> {
  let mut contents = vec![
    Content::new("audio").with_description(RtpDescription::new("audio")),
    Content::new("video").with_description(RtpDescription::new("video")),
  ];
  add_sources_to_contents(&mut contents, sources, audio, video);
  contents.retain(|content| {
    content
      .description
      .as_ref()
      .map(|d| !d.ssrcs.is_empty() || !d.ssrc_groups.is_empty())
      .unwrap_or(false)
  });
  contents
}

static AUDIO_PAYLOAD_TYPES: Lazy<Vec<PayloadType>> =
  Lazy::new(|| vec![PayloadType::new(111, "opus", 48000, 2)]);

/// The media descriptions offered to every participant, before transport
/// and source decoration.
fn base_offer(config: &FocusConfig, audio: bool, video: bool) -> Vec<Content> {
  let mut contents = Vec::new();
  if audio {
    let mut description = RtpDescription::new("audio");
    description.payload_types = AUDIO_PAYLOAD_TYPES.clone();
    contents.push(Content::new("audio").with_description(description));
  }
  if video {
    let mut description = RtpDescription::new("video");
    let payload_type = match config.video_codec.as_str() {
      "vp8" => PayloadType::new(100, "VP8", 90000, 1),
      "h264" => PayloadType::new(107, "H264", 90000, 1),
      _ => PayloadType::new(101, "VP9", 90000, 1),
    };
    description.payload_types = vec![payload_type];
    contents.push(Content::new("video").with_description(description));
  }
  contents
}

/// The bridge's own sources, under the reserved owner with deterministic
/// names.
fn feedback_sources(sources: &crate::source::EndpointSourceSet) -> ConferenceSourceMap {
  let mut named = crate::source::EndpointSourceSet::new();
  for source in sources.sources() {
    let mut source = source.clone();
    source.name = Some(match source.media_type {
      MediaType::Audio => "jvb-a0".to_owned(),
      MediaType::Video => "jvb-v0".to_owned(),
    });
    named.insert_source(source);
  }
  ConferenceSourceMap::from_owner("jvb", named)
}

/// Merge everyone's sources into the offer's media descriptions, each
/// annotated with its owner.
fn add_sources_to_contents(
  contents: &mut [Content],
  sources: &ConferenceSourceMap,
  audio: bool,
  video: bool,
) {
  for content in contents.iter_mut() {
    let Some(description) = content.description.as_mut() else {
      continue;
    };
    let media_type = match description.media.as_str() {
      "audio" if audio => MediaType::Audio,
      "video" if video => MediaType::Video,
      _ => continue,
    };
    for (owner, set) in sources.entries() {
      for source in set.sources().filter(|s| s.media_type == media_type) {
        description.ssrcs.push(SourceElement {
          id: source.ssrc,
          name: source.name.clone(),
          msid: source.msid.clone(),
          video_type: source.video_type.map(|vt| vt.as_str().to_owned()),
          owner: Some(owner.clone()),
          injected: source.injected,
        });
      }
      for group in set.groups().iter().filter(|g| g.media_type == media_type) {
        description.ssrc_groups.push(SsrcGroupElement {
          semantics: group.semantics,
          sources: group.ssrcs.clone(),
        });
      }
    }
  }
}
