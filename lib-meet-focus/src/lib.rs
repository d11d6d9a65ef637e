mod allocator;
mod auth;
mod bridge;
mod bridge_session;
mod colibri;
mod conference;
mod config;
mod dispatcher;
mod error;
mod events;
mod jibri;
mod moderation;
mod roles;
mod selector;
mod services;
mod session_manager;
mod signaling;
mod signaling_queue;
mod source;
mod source_map;
mod supervisor;
#[cfg(test)]
mod test_support;
mod util;
mod worker;

pub use crate::{
  allocator::{CancelHandle, InviteError, InviteSuccess, ParticipantChannelAllocator},
  auth::{AuthenticationAuthority, NoAuthentication},
  bridge::{Bridge, BridgeRegistry, BridgeStats},
  bridge_session::BridgeSession,
  colibri::{AllocationRequest, BridgeRpc, ColibriAllocation, EndpointUpdate},
  conference::{ChatMember, ConferenceSession, ConferenceState},
  config::{FocusConfig, SelectionStrategy},
  dispatcher::RequestDispatcher,
  error::{AllocationError, ColibriError, JibriError, RequestError, SourceError},
  events::{ConferenceEvent, FocusEvent},
  jibri::{
    DialOutCounters, JibriManager, JibriSession, JibriSessionState, JibriStartRequest,
    JigasiManager, WorkerRpc,
  },
  moderation::AvModerationState,
  roles::{AuthenticatedRoleManager, AutoOwnerRoleManager, MemberRole, MemberSnapshot, RoleManager},
  selector::{
    BridgeSelectionStrategy, BridgeSelector, RegionBasedStrategy, SingleBridgeStrategy,
    SplitBridgeStrategy,
  },
  services::FocusServices,
  session_manager::{AllocationOutcome, ColibriSessionManager},
  signaling::{features, SignalingSender},
  signaling_queue::{SignalingQueue, SourceUpdate},
  source::{EndpointSourceSet, MediaType, Source, SsrcGroup, VideoType},
  source_map::{ConferenceSourceMap, SharedSourceMap, SourceLimits, SourceMapReader},
  supervisor::{FocusMetrics, FocusSupervisor},
  worker::{Worker, WorkerCapability, WorkerPool, WorkerStats},
};

#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing(level: tracing::Level) {
  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
    .with_target(false)
    .init();
}
