use std::{collections::HashMap, sync::Arc};

use meet_focus_signaling::{
  ConferenceResponse, FocusRequest, FocusResponse, JibriAction, RequestStanza, ResponseStanza,
};
use tracing::{debug, warn};

use crate::{
  conference::ConferenceSession,
  error::RequestError,
  source::MediaType,
  supervisor::FocusSupervisor,
};

/// The endpoint id is the resource part of a room address.
fn endpoint_of(address: &str) -> Result<&str, RequestError> {
  address
    .split('/')
    .nth(1)
    .filter(|resource| !resource.is_empty())
    .ok_or_else(|| RequestError::BadRequest(format!("no endpoint in {address}")))
}

enum Handled {
  Response(FocusResponse),
  Empty,
  /// The answer will be delivered asynchronously.
  Deferred,
}

/// Translates inbound requests into calls on the supervisor and the
/// conferences, and failures into wire error conditions.
pub struct RequestDispatcher {
  supervisor: Arc<FocusSupervisor>,
}

impl RequestDispatcher {
  pub fn new(supervisor: Arc<FocusSupervisor>) -> Self {
    Self { supervisor }
  }

  /// Handle one request. `None` means the response will be sent
  /// asynchronously through the signaling sender.
  #[tracing::instrument(level = "debug", skip(self, request), fields(id = %request.id))]
  pub async fn handle(&self, request: RequestStanza) -> Option<ResponseStanza> {
    match self.dispatch(&request).await {
      Ok(Handled::Response(payload)) => Some(ResponseStanza::result(&request, payload)),
      Ok(Handled::Empty) => Some(ResponseStanza::empty_result(&request)),
      Ok(Handled::Deferred) => None,
      Err(e) => {
        debug!(error = %e, "request failed");
        Some(ResponseStanza::error(&request, e.to_stanza_error()))
      },
    }
  }

  fn conference_for(&self, room: &str) -> Result<Arc<ConferenceSession>, RequestError> {
    self
      .supervisor
      .get(room)
      .ok_or_else(|| RequestError::ItemNotFound(room.to_owned()))
  }

  async fn dispatch(&self, request: &RequestStanza) -> Result<Handled, RequestError> {
    let services = self.supervisor.services().clone();
    match &request.payload {
      FocusRequest::Conference(req) => {
        if services.config.authentication_enabled && !services.auth.is_authenticated(&request.from)
        {
          return Err(RequestError::Forbidden);
        }
        let conference = self.supervisor.get_or_create(&req.room)?;
        let mut properties = HashMap::new();
        if let Some(n) = services.config.start_audio_muted_after {
          properties.insert("startAudioMuted".to_owned(), n.to_string());
        }
        if let Some(n) = services.config.start_video_muted_after {
          properties.insert("startVideoMuted".to_owned(), n.to_string());
        }
        Ok(Handled::Response(FocusResponse::Conference(
          ConferenceResponse {
            ready: true,
            focus_jid: services.config.focus_jid.clone(),
            meeting_id: conference.meeting_id().to_owned(),
            authentication: services.config.authentication_enabled,
            external_auth: services.config.external_auth_enabled,
            sip_gateway_enabled: services.config.sip_gateway_enabled,
            properties,
          },
        )))
      },

      FocusRequest::Mute(req) => {
        let conference = self.conference_for(&req.room)?;
        let actor = endpoint_of(&request.from)?;
        let media_type: MediaType = req
          .media
          .parse()
          .map_err(|_| RequestError::BadRequest(format!("unknown media type {}", req.media)))?;
        conference
          .mute(actor, &req.endpoint, media_type, req.mute)
          .await?;
        Ok(Handled::Empty)
      },

      FocusRequest::DialOut(req) => {
        let conference = self.conference_for(&req.room)?;
        let actor = endpoint_of(&request.from)?.to_owned();
        let req = req.clone();
        let request = request.clone();
        tokio::spawn(async move {
          let response = match conference.dial_out(&actor, &req).await {
            Ok(dial) => ResponseStanza::result(&request, FocusResponse::Dial(dial)),
            Err(e) => ResponseStanza::error(&request, e.to_stanza_error()),
          };
          if let Err(e) = services.signaling.send_response(&response).await {
            warn!(error = %e, "dial-out response not delivered");
          }
        });
        Ok(Handled::Deferred)
      },

      FocusRequest::Jibri(req) => {
        let conference = self.conference_for(&req.room)?;
        let actor = endpoint_of(&request.from)?;
        let status = match req.action {
          JibriAction::Start => {
            conference
              .start_jibri(
                actor,
                req.mode,
                req.stream_id.clone(),
                req.sip_address.clone(),
                req.app_data.clone(),
              )
              .await?
          },
          JibriAction::Stop => {
            let session_id = req
              .session_id
              .as_deref()
              .ok_or_else(|| RequestError::BadRequest("stop without session id".to_owned()))?;
            conference.stop_jibri(actor, session_id).await?
          },
        };
        Ok(Handled::Response(FocusResponse::Jibri(status)))
      },

      FocusRequest::AvModeration(req) => {
        let conference = self.conference_for(&req.room)?;
        let actor = endpoint_of(&request.from)?;
        if !conference.is_owner(actor).await {
          return Err(RequestError::Forbidden);
        }
        let media_type: MediaType = req
          .media
          .parse()
          .map_err(|_| RequestError::BadRequest(format!("unknown media type {}", req.media)))?;
        conference
          .set_av_moderation(media_type, req.enable, req.whitelist.clone())
          .await;
        Ok(Handled::Empty)
      },

      FocusRequest::LoginUrl(req) => {
        let url = services
          .auth
          .create_login_url(&req.machine_uid, &request.from, &req.room, req.popup)
          .await
          .map_err(|e| RequestError::ServiceUnavailable(e.to_string()))?;
        Ok(Handled::Response(FocusResponse::LoginUrl { url }))
      },

      FocusRequest::Logout(req) => {
        let url = services
          .auth
          .process_logout(&req.session_id)
          .await
          .map_err(|e| RequestError::ServiceUnavailable(e.to_string()))?;
        Ok(Handled::Response(FocusResponse::Logout { url }))
      },
    }
  }
}
