use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The requests the focus recognizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FocusRequest {
  Conference(ConferenceRequest),
  Mute(MuteRequest),
  DialOut(DialRequest),
  Jibri(JibriRequest),
  AvModeration(AvModerationRequest),
  LoginUrl(LoginUrlRequest),
  Logout(LogoutRequest),
}

/// Ask the focus to create (or confirm) a conference for a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConferenceRequest {
  pub machine_uid: String,
  pub room: String,
  #[serde(default)]
  pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConferenceResponse {
  pub ready: bool,
  pub focus_jid: String,
  pub meeting_id: String,
  pub authentication: bool,
  pub external_auth: bool,
  pub sip_gateway_enabled: bool,
  #[serde(default)]
  pub properties: HashMap<String, String>,
}

/// Mute (never unmute) another participant, or report own mute state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuteRequest {
  pub room: String,
  /// Endpoint to act on; the actor is the stanza sender.
  pub endpoint: String,
  /// "audio" or "video".
  pub media: String,
  pub mute: bool,
}

/// Invite a SIP participant via a gateway worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialRequest {
  pub room: String,
  pub destination: String,
  #[serde(default)]
  pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialResponse {
  pub session_id: String,
  pub gateway: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JibriAction {
  Start,
  Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JibriMode {
  File,
  Stream,
  SipCall,
}

/// Start or stop a recording, stream, or SIP call leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JibriRequest {
  pub room: String,
  pub action: JibriAction,
  pub mode: JibriMode,
  pub session_id: Option<String>,
  pub stream_id: Option<String>,
  pub sip_address: Option<String>,
  pub app_data: Option<serde_json::Value>,
}

/// Session state reported back to the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JibriStatus {
  pub session_id: String,
  pub mode: JibriMode,
  /// "pending", "on", or "off".
  pub state: String,
  pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvModerationRequest {
  pub room: String,
  /// "audio" or "video".
  pub media: String,
  pub enable: bool,
  /// Replaces the exempt-jid whitelist for the media type when present.
  pub whitelist: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginUrlRequest {
  pub machine_uid: String,
  pub room: String,
  pub popup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutRequest {
  pub session_id: String,
}

/// The success payloads the focus returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FocusResponse {
  Conference(ConferenceResponse),
  Dial(DialResponse),
  Jibri(JibriStatus),
  LoginUrl { url: String },
  Logout { url: Option<String> },
}
