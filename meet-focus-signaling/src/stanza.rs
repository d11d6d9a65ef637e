use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::{FocusRequest, FocusResponse};

/// The four request/response kinds carried by the signaling transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IqType {
  Get,
  Set,
  Result,
  Error,
}

/// An inbound request as handed to the focus by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStanza {
  pub from: String,
  pub to: String,
  pub id: String,
  #[serde(rename = "type")]
  pub type_: IqType,
  pub payload: FocusRequest,
}

/// An outbound response, addressed back to the requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseStanza {
  pub from: String,
  pub to: String,
  pub id: String,
  #[serde(rename = "type")]
  pub type_: IqType,
  pub payload: Option<FocusResponse>,
  pub error: Option<StanzaError>,
}

impl ResponseStanza {
  pub fn result(request: &RequestStanza, payload: FocusResponse) -> Self {
    Self {
      from: request.to.clone(),
      to: request.from.clone(),
      id: request.id.clone(),
      type_: IqType::Result,
      payload: Some(payload),
      error: None,
    }
  }

  pub fn empty_result(request: &RequestStanza) -> Self {
    Self {
      from: request.to.clone(),
      to: request.from.clone(),
      id: request.id.clone(),
      type_: IqType::Result,
      payload: None,
      error: None,
    }
  }

  pub fn error(request: &RequestStanza, error: StanzaError) -> Self {
    Self {
      from: request.to.clone(),
      to: request.from.clone(),
      id: request.id.clone(),
      type_: IqType::Error,
      payload: None,
      error: Some(error),
    }
  }
}

/// Stanza error types from RFC 6120 §8.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
  Auth,
  Cancel,
  Continue,
  Modify,
  Wait,
}

/// The defined error conditions the focus produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefinedCondition {
  BadRequest,
  Conflict,
  FeatureNotImplemented,
  Forbidden,
  InternalServerError,
  ItemNotFound,
  NotAcceptable,
  NotAuthorized,
  RemoteServerTimeout,
  ResourceConstraint,
  ServiceUnavailable,
  UndefinedCondition,
}

impl DefinedCondition {
  pub fn as_str(&self) -> &'static str {
    use DefinedCondition::*;
    match self {
      BadRequest => "bad-request",
      Conflict => "conflict",
      FeatureNotImplemented => "feature-not-implemented",
      Forbidden => "forbidden",
      InternalServerError => "internal-server-error",
      ItemNotFound => "item-not-found",
      NotAcceptable => "not-acceptable",
      NotAuthorized => "not-authorized",
      RemoteServerTimeout => "remote-server-timeout",
      ResourceConstraint => "resource-constraint",
      ServiceUnavailable => "service-unavailable",
      UndefinedCondition => "undefined-condition",
    }
  }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{}: {}", .condition.as_str(), .text.as_deref().unwrap_or("(no text)"))]
pub struct StanzaError {
  #[serde(rename = "type")]
  pub type_: ErrorType,
  pub condition: DefinedCondition,
  pub text: Option<String>,
}

impl StanzaError {
  pub fn new(
    type_: ErrorType,
    condition: DefinedCondition,
    text: impl Into<Option<String>>,
  ) -> Self {
    Self {
      type_,
      condition,
      text: text.into(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn condition_strings_are_kebab_case() {
    assert_eq!(DefinedCondition::BadRequest.as_str(), "bad-request");
    assert_eq!(
      DefinedCondition::RemoteServerTimeout.as_str(),
      "remote-server-timeout"
    );
    assert_eq!(
      serde_json::to_value(DefinedCondition::ServiceUnavailable).unwrap(),
      serde_json::json!("service-unavailable")
    );
  }
}
