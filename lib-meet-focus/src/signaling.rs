use anyhow::Result;
use async_trait::async_trait;
use meet_focus_signaling::{ResponseStanza, SessionMessage};

use crate::source::MediaType;

/// Feature vars participants advertise through service discovery.
pub mod features {
  pub const AUDIO: &str = "urn:xmpp:jingle:apps:rtp:audio";
  pub const VIDEO: &str = "urn:xmpp:jingle:apps:rtp:video";
  pub const SCTP: &str = "http://jitsi.org/protocol/colibri#sctp";
  pub const SOURCE_NAMES: &str = "http://jitsi.org/source-name";
  pub const JSON_SOURCES: &str = "http://jitsi.org/json-encoded-sources";
}

/// Outbound signaling towards participants. The wire encoding and framing
/// live behind this seam; every call may block on the round-trip.
#[async_trait]
pub trait SignalingSender: Send + Sync {
  /// Send a session message to a participant and await its ack.
  async fn send_session_message(&self, to: &str, message: &SessionMessage) -> Result<()>;

  /// Deliver a response stanza to its addressee.
  async fn send_response(&self, response: &ResponseStanza) -> Result<()>;

  /// Tell a participant a moderator muted it.
  async fn send_mute(&self, to: &str, media_type: MediaType, mute: bool) -> Result<()>;

  /// Discover the feature vars a participant supports.
  async fn discover_features(&self, address: &str) -> Result<Vec<String>>;
}
