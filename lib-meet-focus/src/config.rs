use std::{collections::HashSet, time::Duration};

/// Which bridge selection strategy the focus runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
  /// Keep the whole conference on the least-stressed bridge.
  Single,
  /// Prefer bridges in (a group of) the participant's region.
  RegionBased,
  /// Spread the conference across as many bridges as possible.
  Split,
}

#[derive(Debug, Clone)]
pub struct FocusConfig {
  /// Address the focus answers from, e.g. "focus@auth.example.com/focus".
  pub focus_jid: String,
  /// Region this focus deployment runs in.
  pub local_region: Option<String>,
  /// Regions considered equivalent for selection purposes.
  pub region_groups: Vec<HashSet<String>>,
  pub selection_strategy: SelectionStrategy,

  pub max_ssrcs_per_user: usize,
  pub max_ssrc_groups_per_user: usize,

  /// A bridge whose stress would exceed this is not given new participants.
  pub max_bridge_stress: f64,
  /// Stress each additional participant is assumed to add.
  pub avg_participant_stress: f64,
  /// How long a failed bridge stays non-operational.
  pub bridge_failure_reset_threshold: Duration,
  /// Bridges silent for longer than this are considered lost.
  pub bridge_presence_timeout: Duration,

  pub allocation_timeout: Duration,
  pub dial_out_timeout: Duration,
  /// Additional workers tried after the first dial-out failure.
  pub dial_out_retries: usize,
  pub jibri_pending_timeout: Duration,
  pub jibri_retries: usize,
  /// Round-trip timeout for a single worker request.
  pub worker_request_timeout: Duration,

  /// How long a lone participant may wait for somebody else to join.
  pub conference_start_timeout: Duration,
  /// How long an empty conference lingers before it is disposed.
  pub conference_linger: Duration,

  /// Strip simulcast layers when signaling sources to peers.
  pub strip_simulcast: bool,
  /// Offer an SCTP data channel to participants that support it.
  pub enable_sctp: bool,
  /// The video codec negotiated in offers. One of: vp9, vp8, h264.
  pub video_codec: String,

  /// Participants past this count join with audio muted.
  pub start_audio_muted_after: Option<usize>,
  /// Participants past this count join with video muted.
  pub start_video_muted_after: Option<usize>,

  /// Domains whose members may start recordings without being moderators.
  pub trusted_domains: Vec<String>,
  pub sip_gateway_enabled: bool,
  pub authentication_enabled: bool,
  pub external_auth_enabled: bool,
  /// Grant owner to every authenticated member instead of electing one.
  pub auto_owner: bool,
}

impl Default for FocusConfig {
  fn default() -> Self {
    Self {
      focus_jid: "focus@auth.meet.invalid/focus".to_owned(),
      local_region: None,
      region_groups: vec![],
      selection_strategy: SelectionStrategy::RegionBased,
      max_ssrcs_per_user: 20,
      max_ssrc_groups_per_user: 20,
      max_bridge_stress: 0.8,
      avg_participant_stress: 0.01,
      bridge_failure_reset_threshold: Duration::from_secs(60),
      bridge_presence_timeout: Duration::from_secs(90),
      allocation_timeout: Duration::from_secs(15),
      dial_out_timeout: Duration::from_secs(60),
      dial_out_retries: 2,
      jibri_pending_timeout: Duration::from_secs(90),
      jibri_retries: 2,
      worker_request_timeout: Duration::from_secs(30),
      conference_start_timeout: Duration::from_secs(20),
      conference_linger: Duration::from_secs(15),
      strip_simulcast: true,
      enable_sctp: true,
      video_codec: "vp9".to_owned(),
      start_audio_muted_after: None,
      start_video_muted_after: None,
      trusted_domains: vec![],
      sip_gateway_enabled: false,
      authentication_enabled: false,
      external_auth_enabled: false,
      auto_owner: true,
    }
  }
}

impl FocusConfig {
  /// All regions grouped with `region`, including `region` itself.
  pub fn region_group(&self, region: &str) -> HashSet<String> {
    let mut group: HashSet<String> = self
      .region_groups
      .iter()
      .filter(|g| g.contains(region))
      .flat_map(|g| g.iter().cloned())
      .collect();
    group.insert(region.to_owned());
    group
  }
}

#[cfg(test)]
mod tests {
  use maplit::hashset;

  use super::*;

  #[test]
  fn region_group_includes_self_and_peers() {
    let config = FocusConfig {
      region_groups: vec![
        hashset! {"eu-west".to_owned(), "eu-central".to_owned()},
        hashset! {"us-east".to_owned(), "us-west".to_owned()},
      ],
      ..Default::default()
    };
    let group = config.region_group("eu-west");
    assert!(group.contains("eu-west"));
    assert!(group.contains("eu-central"));
    assert!(!group.contains("us-east"));
    // A region not in any group is its own group.
    assert_eq!(config.region_group("ap-south").len(), 1);
  }
}
