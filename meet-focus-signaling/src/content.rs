use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown ssrc-group semantics: {0}")]
pub struct UnknownSemantics(String);

/// From RFC 5888, the list of allowed ssrc-group semantics, plus the
/// simulcast extension used by conferencing stacks.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Semantics {
  /// Lip synchronization.
  Ls,
  /// Flow identification (primary + retransmission).
  Fid,
  /// Single reservation flow.
  Srf,
  /// Alternative network address types.
  Anat,
  /// Forward error correction.
  Fec,
  /// Decoding dependency.
  Ddp,
  /// Simulcast layers, lowest first.
  Sim,
}

impl Semantics {
  pub fn as_str(&self) -> &'static str {
    match self {
      Semantics::Ls => "LS",
      Semantics::Fid => "FID",
      Semantics::Srf => "SRF",
      Semantics::Anat => "ANAT",
      Semantics::Fec => "FEC",
      Semantics::Ddp => "DDP",
      Semantics::Sim => "SIM",
    }
  }
}

impl fmt::Display for Semantics {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Semantics {
  type Err = UnknownSemantics;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "LS" => Ok(Semantics::Ls),
      "FID" => Ok(Semantics::Fid),
      "SRF" => Ok(Semantics::Srf),
      "ANAT" => Ok(Semantics::Anat),
      "FEC" => Ok(Semantics::Fec),
      "DDP" => Ok(Semantics::Ddp),
      "SIM" => Ok(Semantics::Sim),
      _ => Err(UnknownSemantics(s.to_owned())),
    }
  }
}

/// Which party may send media for a content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Senders {
  Both,
  Initiator,
  Responder,
  None,
}

/// A source advertised inside an RTP description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceElement {
  pub id: u32,
  pub name: Option<String>,
  pub msid: Option<String>,
  /// "camera" or "desktop"; absent means camera.
  pub video_type: Option<String>,
  /// Owner annotation, present only on sources the focus signals to peers.
  pub owner: Option<String>,
  pub injected: bool,
}

impl SourceElement {
  pub fn new(id: u32) -> Self {
    Self {
      id,
      name: None,
      msid: None,
      video_type: None,
      owner: None,
      injected: false,
    }
  }
}

/// A grouping of sources; order of `sources` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsrcGroupElement {
  pub semantics: Semantics,
  pub sources: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadType {
  pub id: u8,
  pub name: String,
  pub clockrate: u32,
  pub channels: u8,
}

impl PayloadType {
  pub fn new(id: u8, name: impl Into<String>, clockrate: u32, channels: u8) -> Self {
    Self {
      id,
      name: name.into(),
      clockrate,
      channels,
    }
  }
}

/// RTP media description for one content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtpDescription {
  pub media: String,
  pub payload_types: Vec<PayloadType>,
  pub ssrcs: Vec<SourceElement>,
  pub ssrc_groups: Vec<SsrcGroupElement>,
  pub rtcp_mux: bool,
}

impl RtpDescription {
  pub fn new(media: impl Into<String>) -> Self {
    Self {
      media: media.into(),
      payload_types: vec![],
      ssrcs: vec![],
      ssrc_groups: vec![],
      rtcp_mux: true,
    }
  }
}

/// DTLS setup role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Setup {
  Active,
  Passive,
  Actpass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
  pub hash: String,
  pub value: String,
  pub setup: Setup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
  pub id: String,
  pub component: u8,
  pub foundation: String,
  pub generation: u8,
  pub ip: String,
  pub port: u16,
  pub priority: u32,
  pub protocol: String,
  #[serde(rename = "type")]
  pub type_: String,
}

/// SCTP association description for data channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SctpMap {
  pub port: u16,
  pub protocol: String,
  pub streams: u16,
}

impl SctpMap {
  /// The WebRTC data channel association every bridge offers.
  pub fn web_rtc_channel() -> Self {
    Self {
      port: 5000,
      protocol: "webrtc-datachannel".to_owned(),
      streams: 1024,
    }
  }
}

/// ICE-UDP transport description, including the extensions bridges attach.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceUdpTransport {
  pub ufrag: Option<String>,
  pub pwd: Option<String>,
  pub candidates: Vec<Candidate>,
  pub fingerprint: Option<Fingerprint>,
  pub web_socket: Option<String>,
  pub sctp: Option<SctpMap>,
}

/// One negotiated content: a media description and/or a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
  pub name: String,
  pub senders: Senders,
  pub description: Option<RtpDescription>,
  pub transport: Option<IceUdpTransport>,
}

impl Content {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      senders: Senders::Both,
      description: None,
      transport: None,
    }
  }

  pub fn with_description(mut self, description: RtpDescription) -> Self {
    self.description = Some(description);
    self
  }

  pub fn with_transport(mut self, transport: IceUdpTransport) -> Self {
    self.transport = Some(transport);
    self
  }
}
