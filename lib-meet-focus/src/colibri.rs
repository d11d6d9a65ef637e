use async_trait::async_trait;
use meet_focus_signaling::{Content, IceUdpTransport};

use crate::{
  error::ColibriError,
  source::EndpointSourceSet,
  source_map::ConferenceSourceMap,
};

/// Ask a bridge for channels for one endpoint. One-shot: the caller never
/// retries against the same bridge.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
  /// The focus-wide conference id, stable across bridges.
  pub conference_id: String,
  pub room: String,
  pub endpoint_id: String,
  /// The media descriptions being offered to the endpoint.
  pub contents: Vec<Content>,
  /// Create the conference on the bridge if it does not exist yet.
  pub create: bool,
  /// Ask for an SCTP association for data channels.
  pub use_sctp: bool,
}

/// What a bridge hands back for an allocated endpoint.
#[derive(Debug, Clone)]
pub struct ColibriAllocation {
  /// ICE candidates, DTLS fingerprint, and optionally a colibri websocket
  /// and SCTP association.
  pub transport: IceUdpTransport,
  /// Sources owned by the bridge itself (the feedback sources).
  pub feedback_sources: EndpointSourceSet,
}

/// An update pushed to a bridge about one of its endpoints.
#[derive(Debug, Clone, Default)]
pub struct EndpointUpdate {
  pub endpoint_id: String,
  pub transport: Option<IceUdpTransport>,
  /// The endpoint's full source set after the change.
  pub sources: Option<EndpointSourceSet>,
  pub rtp_descriptions: Option<Vec<Content>>,
}

/// The focus side of the colibri protocol. Implementations do the wire
/// work; all calls may block and are invoked with the per-bridge session
/// lock held so writes to one bridge never interleave.
#[async_trait]
pub trait BridgeRpc: Send + Sync {
  async fn allocate(
    &self,
    bridge: &str,
    request: &AllocationRequest,
  ) -> Result<ColibriAllocation, ColibriError>;

  async fn update_endpoint(
    &self,
    bridge: &str,
    conference_id: &str,
    update: &EndpointUpdate,
  ) -> Result<(), ColibriError>;

  /// Create, update, or (with an empty list) tear down the relay on this
  /// bridge, pointing it at the given remote relays.
  async fn set_relays(
    &self,
    bridge: &str,
    conference_id: &str,
    relays: &[String],
  ) -> Result<(), ColibriError>;

  /// Advertise (or withdraw) remote participants' sources to this bridge's
  /// relay.
  async fn update_relay_sources(
    &self,
    bridge: &str,
    conference_id: &str,
    sources: &ConferenceSourceMap,
    remove: bool,
  ) -> Result<(), ColibriError>;

  async fn expire_endpoint(
    &self,
    bridge: &str,
    conference_id: &str,
    endpoint_id: &str,
  ) -> Result<(), ColibriError>;

  async fn expire_conference(&self, bridge: &str, conference_id: &str)
    -> Result<(), ColibriError>;
}
