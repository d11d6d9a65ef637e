use meet_focus_signaling::JibriStatus;

use crate::source::MediaType;

/// What happened inside a conference. The embedding process consumes these
/// for its own surfaces (metrics, webhooks, admin tooling).
#[derive(Debug, Clone)]
pub enum ConferenceEvent {
  Started {
    meeting_id: String,
  },
  ParticipantJoined {
    endpoint_id: String,
  },
  ParticipantLeft {
    endpoint_id: String,
  },
  RoleChanged {
    endpoint_id: String,
    owner: bool,
  },
  ParticipantMuted {
    endpoint_id: String,
    media_type: MediaType,
  },
  ModerationChanged {
    media_type: MediaType,
    enabled: bool,
  },
  InviteFailed {
    endpoint_id: String,
  },
  SessionTerminated {
    endpoint_id: String,
    reason: String,
  },
  JibriStateChanged {
    status: JibriStatus,
  },
  Disposed,
}

/// A conference event stamped with its room.
#[derive(Debug, Clone)]
pub struct FocusEvent {
  pub room: String,
  pub event: ConferenceEvent,
}
