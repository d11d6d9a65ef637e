use std::collections::HashSet;

use crate::source::MediaType;

#[derive(Debug, Default)]
struct MediaModeration {
  enabled: bool,
  whitelist: HashSet<String>,
}

/// Per-room A/V moderation: when enabled for a media type, only moderators
/// and whitelisted jids may unmute themselves.
#[derive(Debug, Default)]
pub struct AvModerationState {
  audio: MediaModeration,
  video: MediaModeration,
}

impl AvModerationState {
  fn media(&self, media_type: MediaType) -> &MediaModeration {
    match media_type {
      MediaType::Audio => &self.audio,
      MediaType::Video => &self.video,
    }
  }

  fn media_mut(&mut self, media_type: MediaType) -> &mut MediaModeration {
    match media_type {
      MediaType::Audio => &mut self.audio,
      MediaType::Video => &mut self.video,
    }
  }

  /// Returns true when this call switched the media type from off to on
  /// (the moment everyone not exempt gets muted).
  pub fn set_enabled(&mut self, media_type: MediaType, enabled: bool) -> bool {
    let media = self.media_mut(media_type);
    let switched_on = enabled && !media.enabled;
    media.enabled = enabled;
    switched_on
  }

  pub fn is_enabled(&self, media_type: MediaType) -> bool {
    self.media(media_type).enabled
  }

  pub fn set_whitelist(&mut self, media_type: MediaType, jids: impl IntoIterator<Item = String>) {
    self.media_mut(media_type).whitelist = jids.into_iter().collect();
  }

  pub fn is_whitelisted(&self, media_type: MediaType, jid: &str) -> bool {
    self.media(media_type).whitelist.contains(jid)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn enabling_reports_the_off_to_on_edge_once() {
    let mut state = AvModerationState::default();
    assert!(state.set_enabled(MediaType::Audio, true));
    assert!(!state.set_enabled(MediaType::Audio, true));
    assert!(!state.set_enabled(MediaType::Audio, false));
    assert!(state.set_enabled(MediaType::Audio, true));
    // Video is independent.
    assert!(!state.is_enabled(MediaType::Video));
  }

  #[test]
  fn whitelist_is_per_media_type() {
    let mut state = AvModerationState::default();
    state.set_whitelist(MediaType::Video, ["alice@example.com".to_owned()]);
    assert!(state.is_whitelisted(MediaType::Video, "alice@example.com"));
    assert!(!state.is_whitelisted(MediaType::Audio, "alice@example.com"));
  }
}
