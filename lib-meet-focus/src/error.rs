use meet_focus_signaling::{DefinedCondition, ErrorType, StanzaError};
use thiserror::Error;

/// Produced only by the validated source-map mutators; the map is left
/// unchanged whenever one of these is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
  #[error("invalid ssrc: {0}")]
  InvalidSsrc(u64),
  #[error("ssrc {ssrc} is already used by {owner}")]
  SsrcAlreadyUsed { ssrc: u32, owner: String },
  #[error("ssrc limit of {0} exceeded")]
  SsrcLimitExceeded(usize),
  #[error("ssrc-group limit of {0} exceeded")]
  SsrcGroupLimitExceeded(usize),
  #[error("msid {msid} is already used by {owner}")]
  MsidConflict { msid: String, owner: String },
  #[error("group {group} references ssrc {ssrc} which has no source")]
  GroupReferencesUnknownSource { group: String, ssrc: u32 },
  #[error("FID group must contain exactly 2 ssrcs, found {0}")]
  InvalidFidGroup(usize),
  #[error("required parameter missing: {0}")]
  RequiredParameterMissing(&'static str),
  #[error("sources in group {group} do not share an msid")]
  GroupMsidMismatch { group: String },
  #[error("no source with ssrc {0}")]
  SourceDoesNotExist(u32),
  #[error("no such group: {0}")]
  SourceGroupDoesNotExist(String),
  #[error("unrecognized media type: {0}")]
  InvalidMediaType(String),
  #[error("unrecognized video type: {0}")]
  InvalidVideoType(String),
  #[error("malformed compact source description: {0}")]
  MalformedCompact(String),
}

/// Outcomes of a colibri round-trip with a bridge. Only some of these count
/// against the bridge itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ColibriError {
  #[error("the bridge does not know the conference")]
  ConferenceNotFound,
  #[error("the bridge rejected the request: {0}")]
  BadRequest(String),
  #[error("timed out waiting for the bridge")]
  Timeout,
  #[error("unexpected response type from the bridge")]
  WrongResponseType,
  #[error("colibri error: {0}")]
  Other(String),
}

impl ColibriError {
  /// ConferenceNotFound means the bridge expired us; BadRequest means we
  /// sent something wrong. Neither is the bridge's fault.
  pub fn marks_bridge_faulty(&self) -> bool {
    !matches!(
      self,
      ColibriError::ConferenceNotFound | ColibriError::BadRequest(_)
    )
  }
}

/// Failure of a participant channel allocation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AllocationError {
  #[error("no bridge could be selected")]
  BridgeSelectionFailed,
  #[error("the bridge failed")]
  BridgeFailed { restart_conference: bool },
  #[error("the colibri conference was already disposed")]
  ConferenceDisposed,
  #[error("the colibri conference expired on the bridge")]
  ConferenceExpired { restart_conference: bool },
  #[error("the bridge rejected the allocation: {0}")]
  Rejected(String),
  #[error("failed to interpret the bridge response: {0}")]
  Parsing(String),
  #[error("the allocation was cancelled")]
  Cancelled,
}

impl AllocationError {
  pub fn restart_conference(&self) -> bool {
    matches!(
      self,
      AllocationError::BridgeFailed {
        restart_conference: true
      } | AllocationError::ConferenceExpired {
        restart_conference: true
      }
    )
  }
}

/// Failure to start a recording/streaming/SIP worker session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JibriError {
  #[error("no workers are available")]
  NotAvailable,
  #[error("all workers reported busy")]
  AllBusy,
  #[error("the selected worker was busy")]
  OneBusy,
  #[error("worker internal error: {0}")]
  InternalServerError(String),
  #[error("unexpected response from the worker")]
  UnexpectedResponse,
  #[error("timed out waiting for the worker")]
  Timeout,
}

/// Request-level failures, mapped onto wire error conditions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
  #[error("bad request: {0}")]
  BadRequest(String),
  #[error("no such conference: {0}")]
  ItemNotFound(String),
  #[error("not allowed")]
  Forbidden,
  #[error("service unavailable: {0}")]
  ServiceUnavailable(String),
  #[error("remote server timeout")]
  RemoteServerTimeout,
  #[error("internal error: {0}")]
  UndefinedCondition(String),
}

impl RequestError {
  pub fn to_stanza_error(&self) -> StanzaError {
    let (type_, condition) = match self {
      RequestError::BadRequest(_) => (ErrorType::Modify, DefinedCondition::BadRequest),
      RequestError::ItemNotFound(_) => (ErrorType::Cancel, DefinedCondition::ItemNotFound),
      RequestError::Forbidden => (ErrorType::Auth, DefinedCondition::Forbidden),
      RequestError::ServiceUnavailable(_) => (ErrorType::Wait, DefinedCondition::ServiceUnavailable),
      RequestError::RemoteServerTimeout => (ErrorType::Wait, DefinedCondition::RemoteServerTimeout),
      RequestError::UndefinedCondition(_) => {
        (ErrorType::Cancel, DefinedCondition::UndefinedCondition)
      },
    };
    StanzaError::new(type_, condition, Some(self.to_string()))
  }
}

impl From<SourceError> for RequestError {
  fn from(e: SourceError) -> Self {
    RequestError::BadRequest(e.to_string())
  }
}

impl From<JibriError> for RequestError {
  fn from(e: JibriError) -> Self {
    match e {
      JibriError::NotAvailable | JibriError::AllBusy => {
        RequestError::ServiceUnavailable(e.to_string())
      },
      JibriError::Timeout => RequestError::RemoteServerTimeout,
      other => RequestError::UndefinedCondition(other.to_string()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bridge_fault_policy() {
    assert!(!ColibriError::ConferenceNotFound.marks_bridge_faulty());
    assert!(!ColibriError::BadRequest("nope".into()).marks_bridge_faulty());
    assert!(ColibriError::Timeout.marks_bridge_faulty());
    assert!(ColibriError::WrongResponseType.marks_bridge_faulty());
    assert!(ColibriError::Other("boom".into()).marks_bridge_faulty());
  }

  #[test]
  fn request_errors_map_to_conditions() {
    assert_eq!(
      RequestError::RemoteServerTimeout.to_stanza_error().condition,
      DefinedCondition::RemoteServerTimeout
    );
    assert_eq!(
      RequestError::Forbidden.to_stanza_error().condition,
      DefinedCondition::Forbidden
    );
  }
}
