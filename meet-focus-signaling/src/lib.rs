//! Structured signaling types exchanged between a conference focus, its
//! clients, and its media bridges. The wire framing (XMPP, JSON-RPC, …) is
//! the transport's concern; these types are the payloads it carries.

mod content;
mod request;
mod session;
mod stanza;

pub use crate::{
  content::{
    Candidate, Content, Fingerprint, IceUdpTransport, PayloadType, RtpDescription, SctpMap,
    Semantics, Senders, Setup, SourceElement, SsrcGroupElement, UnknownSemantics,
  },
  request::{
    AvModerationRequest, ConferenceRequest, ConferenceResponse, DialRequest, DialResponse,
    FocusRequest, FocusResponse, JibriAction, JibriMode, JibriRequest, JibriStatus, LoginUrlRequest,
    LogoutRequest, MuteRequest,
  },
  session::{SessionAction, SessionMessage},
  stanza::{DefinedCondition, ErrorType, IqType, RequestStanza, ResponseStanza, StanzaError},
};
