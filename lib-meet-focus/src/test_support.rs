//! Shared collaborator mocks for the in-crate tests.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use meet_focus_signaling::{
  DialRequest, DialResponse, ResponseStanza, SessionAction, SessionMessage,
};
use parking_lot::Mutex;

use crate::{
  auth::NoAuthentication,
  bridge::BridgeStats,
  colibri::{AllocationRequest, BridgeRpc, ColibriAllocation, EndpointUpdate},
  config::FocusConfig,
  error::{ColibriError, JibriError},
  jibri::{JibriStartRequest, WorkerRpc},
  services::FocusServices,
  signaling::{features, SignalingSender},
  source::{EndpointSourceSet, MediaType, Source},
  source_map::ConferenceSourceMap,
};

pub(crate) struct NullBridgeRpc;

#[async_trait]
impl BridgeRpc for NullBridgeRpc {
  async fn allocate(
    &self,
    _bridge: &str,
    _request: &AllocationRequest,
  ) -> Result<ColibriAllocation, ColibriError> {
    Ok(ColibriAllocation {
      transport: Default::default(),
      feedback_sources: EndpointSourceSet::from_parts(
        [
          Source::new(0xf000_0001, MediaType::Audio),
          Source::new(0xf000_0002, MediaType::Video),
        ],
        [],
      ),
    })
  }

  async fn update_endpoint(
    &self,
    _bridge: &str,
    _conference_id: &str,
    _update: &EndpointUpdate,
  ) -> Result<(), ColibriError> {
    Ok(())
  }

  async fn set_relays(
    &self,
    _bridge: &str,
    _conference_id: &str,
    _relays: &[String],
  ) -> Result<(), ColibriError> {
    Ok(())
  }

  async fn update_relay_sources(
    &self,
    _bridge: &str,
    _conference_id: &str,
    _sources: &ConferenceSourceMap,
    _remove: bool,
  ) -> Result<(), ColibriError> {
    Ok(())
  }

  async fn expire_endpoint(
    &self,
    _bridge: &str,
    _conference_id: &str,
    _endpoint_id: &str,
  ) -> Result<(), ColibriError> {
    Ok(())
  }

  async fn expire_conference(
    &self,
    _bridge: &str,
    _conference_id: &str,
  ) -> Result<(), ColibriError> {
    Ok(())
  }
}

pub(crate) struct NullWorkerRpc;

#[async_trait]
impl WorkerRpc for NullWorkerRpc {
  async fn send_start(&self, _worker: &str, _request: &JibriStartRequest) -> Result<(), JibriError> {
    Ok(())
  }

  async fn send_stop(&self, _worker: &str, _session_id: &str) -> Result<(), JibriError> {
    Ok(())
  }

  async fn dial(
    &self,
    worker: &str,
    session_id: &str,
    _request: &DialRequest,
  ) -> Result<DialResponse, JibriError> {
    Ok(DialResponse {
      session_id: session_id.to_owned(),
      gateway: worker.to_owned(),
    })
  }
}

/// Records everything the focus tries to send.
#[derive(Default)]
pub(crate) struct RecordingSignaling {
  pub messages: Mutex<Vec<(String, SessionMessage)>>,
  pub mutes: Mutex<Vec<(String, MediaType, bool)>>,
  pub responses: Mutex<Vec<ResponseStanza>>,
}

impl RecordingSignaling {
  pub fn messages_for(&self, address: &str) -> Vec<SessionMessage> {
    self
      .messages
      .lock()
      .iter()
      .filter(|(to, _)| to == address)
      .map(|(_, m)| m.clone())
      .collect()
  }

  pub async fn wait_for_message(&self, address: &str, action: SessionAction) -> SessionMessage {
    for _ in 0..200 {
      if let Some(message) = self
        .messages_for(address)
        .into_iter()
        .find(|m| m.action == action)
      {
        return message;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no {action:?} for {address}");
  }

  pub async fn wait_for_response(&self) -> ResponseStanza {
    for _ in 0..200 {
      if let Some(response) = self.responses.lock().first().cloned() {
        return response;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no response was sent");
  }
}

#[async_trait]
impl SignalingSender for RecordingSignaling {
  async fn send_session_message(&self, to: &str, message: &SessionMessage) -> anyhow::Result<()> {
    self.messages.lock().push((to.to_owned(), message.clone()));
    Ok(())
  }

  async fn send_response(&self, response: &ResponseStanza) -> anyhow::Result<()> {
    self.responses.lock().push(response.clone());
    Ok(())
  }

  async fn send_mute(&self, to: &str, media_type: MediaType, mute: bool) -> anyhow::Result<()> {
    self.mutes.lock().push((to.to_owned(), media_type, mute));
    Ok(())
  }

  async fn discover_features(&self, _address: &str) -> anyhow::Result<Vec<String>> {
    Ok(vec![
      features::AUDIO.to_owned(),
      features::VIDEO.to_owned(),
      features::SCTP.to_owned(),
    ])
  }
}

/// Service graph over the null collaborators, with bridges registered.
pub(crate) fn test_services(
  config: Arc<FocusConfig>,
  signaling: Arc<RecordingSignaling>,
  bridges: &[(&str, &str)],
) -> FocusServices {
  let (services, _events) = FocusServices::new(
    config,
    Arc::new(NullBridgeRpc),
    Arc::new(NullWorkerRpc),
    signaling,
    Arc::new(NoAuthentication),
  );
  for (jid, region) in bridges {
    services.registry.on_bridge_stats(
      jid,
      &BridgeStats {
        region: Some((*region).to_owned()),
        ..Default::default()
      },
    );
  }
  services
}

pub(crate) fn test_config() -> Arc<FocusConfig> {
  Arc::new(FocusConfig {
    allocation_timeout: Duration::from_millis(100),
    conference_linger: Duration::from_millis(30),
    conference_start_timeout: Duration::from_secs(3600),
    ..Default::default()
  })
}
