use serde::{Deserialize, Serialize};

use crate::content::Content;

/// Session-level actions the focus sends to a participant. The non-standard
/// source-add/source-remove values carry incremental source signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionAction {
  SessionInitiate,
  SessionTerminate,
  TransportReplace,
  SourceAdd,
  SourceRemove,
}

impl SessionAction {
  pub fn as_str(&self) -> &'static str {
    match self {
      SessionAction::SessionInitiate => "session-initiate",
      SessionAction::SessionTerminate => "session-terminate",
      SessionAction::TransportReplace => "transport-replace",
      SessionAction::SourceAdd => "source-add",
      SessionAction::SourceRemove => "source-remove",
    }
  }
}

/// A session message addressed to one participant's signaling session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
  pub action: SessionAction,
  pub sid: String,
  pub initiator: Option<String>,
  pub contents: Vec<Content>,
}

impl SessionMessage {
  pub fn new(action: SessionAction, sid: impl Into<String>) -> Self {
    Self {
      action,
      sid: sid.into(),
      initiator: None,
      contents: vec![],
    }
  }
}
