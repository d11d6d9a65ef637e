use std::{
  collections::HashMap,
  ops::{Add, Sub},
  sync::Arc,
};

use parking_lot::RwLock;
use serde_json::Value;

use crate::{
  error::SourceError,
  source::{EndpointSourceSet, MediaType, SsrcGroup},
};

/// Per-endpoint size limits enforced by the validated mutators.
#[derive(Debug, Clone, Copy)]
pub struct SourceLimits {
  pub max_ssrcs_per_user: usize,
  pub max_ssrc_groups_per_user: usize,
}

impl SourceLimits {
  pub fn unlimited() -> Self {
    Self {
      max_ssrcs_per_user: usize::MAX,
      max_ssrc_groups_per_user: usize::MAX,
    }
  }
}

impl Default for SourceLimits {
  fn default() -> Self {
    Self {
      max_ssrcs_per_user: 20,
      max_ssrc_groups_per_user: 20,
    }
  }
}

/// The sources of every endpoint in a conference, with reverse indexes for
/// O(1) conflict checks. This is a plain value; [`SharedSourceMap`] adds the
/// concurrency discipline.
#[derive(Debug, Clone, Default)]
pub struct ConferenceSourceMap {
  entries: HashMap<String, EndpointSourceSet>,
  ssrc_owner: HashMap<u32, String>,
  msid_owner: HashMap<String, String>,
  limits: Option<SourceLimits>,
}

impl PartialEq for ConferenceSourceMap {
  fn eq(&self, other: &Self) -> bool {
    self.entries == other.entries
  }
}

impl ConferenceSourceMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_limits(limits: SourceLimits) -> Self {
    Self {
      limits: Some(limits),
      ..Self::default()
    }
  }

  pub fn from_owner(owner: impl Into<String>, set: EndpointSourceSet) -> Self {
    let mut map = Self::new();
    ConferenceSourceMap::add(&mut map, &owner.into(), &set);
    map
  }

  pub fn is_empty(&self) -> bool {
    self.entries.values().all(EndpointSourceSet::is_empty)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn owners(&self) -> impl Iterator<Item = &String> {
    self.entries.keys()
  }

  pub fn entries(&self) -> impl Iterator<Item = (&String, &EndpointSourceSet)> {
    self.entries.iter()
  }

  pub fn get(&self, owner: &str) -> Option<&EndpointSourceSet> {
    self.entries.get(owner)
  }

  pub fn owner_of_ssrc(&self, ssrc: u32) -> Option<&str> {
    self.ssrc_owner.get(&ssrc).map(String::as_str)
  }

  pub fn owner_of_msid(&self, msid: &str) -> Option<&str> {
    self.msid_owner.get(msid).map(String::as_str)
  }

  fn index_added(&mut self, owner: &str, set: &EndpointSourceSet) {
    for source in set.sources() {
      self.ssrc_owner.insert(source.ssrc, owner.to_owned());
      if let Some(msid) = &source.msid {
        self.msid_owner.insert(msid.clone(), owner.to_owned());
      }
    }
  }

  fn index_removed(&mut self, owner: &str, removed: &EndpointSourceSet) {
    for source in removed.sources() {
      self.ssrc_owner.remove(&source.ssrc);
    }
    let remaining = self.entries.get(owner);
    for source in removed.sources() {
      if let Some(msid) = &source.msid {
        let still_used = remaining
          .map(|set| set.sources().any(|s| s.msid.as_deref() == Some(msid)))
          .unwrap_or(false);
        if !still_used {
          self.msid_owner.remove(msid);
        }
      }
    }
  }

  /// Unvalidated merge, for internal replication only.
  pub(crate) fn add(&mut self, owner: &str, set: &EndpointSourceSet) {
    let entry = self.entries.entry(owner.to_owned()).or_default();
    *entry = std::mem::take(entry) + set;
    self.index_added(owner, set);
  }

  /// Unvalidated removal, for internal replication only. Sources are matched
  /// by ssrc; groups referencing a removed ssrc go with it.
  pub(crate) fn remove(&mut self, owner: &str, set: &EndpointSourceSet) -> EndpointSourceSet {
    let mut removed = EndpointSourceSet::new();
    if let Some(entry) = self.entries.get_mut(owner) {
      for group in set.groups() {
        if entry.remove_group(group) {
          removed.add_group(group.clone());
        }
      }
      for ssrc in set.ssrcs().collect::<Vec<_>>() {
        let (source, groups) = entry.remove_ssrc(ssrc);
        if let Some(source) = source {
          removed.insert_source(source);
        }
        for group in groups {
          removed.add_group(group);
        }
      }
      if entry.is_empty() {
        self.entries.remove(owner);
      }
    }
    self.index_removed(owner, &removed);
    removed
  }

  /// Drop an owner entirely, returning what it had.
  pub fn remove_owner(&mut self, owner: &str) -> Option<EndpointSourceSet> {
    let removed = self.entries.remove(owner)?;
    self.index_removed(owner, &removed);
    Some(removed)
  }

  /// The validated mutator behind every externally driven addition. On any
  /// error the map is left unchanged.
  pub fn try_to_add(
    &mut self,
    owner: &str,
    set: &EndpointSourceSet,
  ) -> Result<EndpointSourceSet, SourceError> {
    if set.is_empty() {
      return Ok(EndpointSourceSet::new());
    }

    for source in set.sources() {
      if source.ssrc == 0 {
        return Err(SourceError::InvalidSsrc(0));
      }
      if let Some(existing) = self.ssrc_owner.get(&source.ssrc) {
        return Err(SourceError::SsrcAlreadyUsed {
          ssrc: source.ssrc,
          owner: existing.clone(),
        });
      }
      if let Some(msid) = &source.msid {
        if let Some(existing) = self.msid_owner.get(msid) {
          if existing != owner {
            return Err(SourceError::MsidConflict {
              msid: msid.clone(),
              owner: existing.clone(),
            });
          }
        }
      }
    }

    let current = self.entries.get(owner).cloned().unwrap_or_default();
    let candidate = current.clone() + set;

    if let Some(limits) = self.limits {
      if candidate.source_count() > limits.max_ssrcs_per_user {
        return Err(SourceError::SsrcLimitExceeded(limits.max_ssrcs_per_user));
      }
      if candidate.group_count() > limits.max_ssrc_groups_per_user {
        return Err(SourceError::SsrcGroupLimitExceeded(
          limits.max_ssrc_groups_per_user,
        ));
      }
    }

    for group in candidate.groups() {
      let mut group_msid: Option<&str> = None;
      for &ssrc in &group.ssrcs {
        let source = candidate
          .get_source(ssrc)
          .ok_or_else(|| SourceError::GroupReferencesUnknownSource {
            group: group.to_string(),
            ssrc,
          })?;
        let msid = source
          .msid
          .as_deref()
          .ok_or(SourceError::RequiredParameterMissing("msid"))?;
        match group_msid {
          None => group_msid = Some(msid),
          Some(expected) if expected != msid => {
            return Err(SourceError::GroupMsidMismatch {
              group: group.to_string(),
            })
          },
          Some(_) => {},
        }
      }
    }

    for media_type in [MediaType::Audio, MediaType::Video] {
      Self::check_extended_group_msids(owner, &candidate, media_type)?;
    }

    // Everything the batch carries that was not already present.
    let accepted = candidate.clone() - &current;
    self.entries.insert(owner.to_owned(), candidate);
    self.index_added(owner, &accepted);
    Ok(accepted)
  }

  /// Every "extended group" (a Sim group fused with the Fid groups hanging
  /// off its layers, any other group, or a lone source carrying an msid)
  /// must have an msid of its own within its media type.
  fn check_extended_group_msids(
    owner: &str,
    set: &EndpointSourceSet,
    media_type: MediaType,
  ) -> Result<(), SourceError> {
    let mut ext_of_ssrc: HashMap<u32, usize> = HashMap::new();
    let mut next_ext = 0usize;

    let groups: Vec<&SsrcGroup> = set
      .groups()
      .iter()
      .filter(|g| g.media_type == media_type)
      .collect();

    for group in groups
      .iter()
      .filter(|g| g.semantics == meet_focus_signaling::Semantics::Sim)
    {
      let ext = next_ext;
      next_ext += 1;
      for &ssrc in &group.ssrcs {
        ext_of_ssrc.insert(ssrc, ext);
      }
    }
    for group in groups
      .iter()
      .filter(|g| g.semantics != meet_focus_signaling::Semantics::Sim)
    {
      let joined = group.ssrcs.iter().find_map(|ssrc| ext_of_ssrc.get(ssrc)).copied();
      let ext = joined.unwrap_or_else(|| {
        let ext = next_ext;
        next_ext += 1;
        ext
      });
      for &ssrc in &group.ssrcs {
        ext_of_ssrc.insert(ssrc, ext);
      }
    }

    let mut ext_of_msid: HashMap<&str, usize> = HashMap::new();
    for source in set.sources().filter(|s| s.media_type == media_type) {
      let msid = match source.msid.as_deref() {
        Some(msid) => msid,
        None => continue,
      };
      let ext = ext_of_ssrc.get(&source.ssrc).copied().unwrap_or_else(|| {
        let ext = next_ext;
        next_ext += 1;
        ext
      });
      ext_of_ssrc.insert(source.ssrc, ext);
      match ext_of_msid.get(msid) {
        None => {
          ext_of_msid.insert(msid, ext);
        },
        Some(&existing) if existing != ext => {
          return Err(SourceError::MsidConflict {
            msid: msid.to_owned(),
            owner: owner.to_owned(),
          })
        },
        Some(_) => {},
      }
    }
    Ok(())
  }

  /// The validated removal. Sources are matched by ssrc only; groups whose
  /// members are being removed go with them. On any error the map is left
  /// unchanged. An empty request is a no-op.
  pub fn try_to_remove(
    &mut self,
    owner: &str,
    set: &EndpointSourceSet,
  ) -> Result<EndpointSourceSet, SourceError> {
    if set.is_empty() {
      return Ok(EndpointSourceSet::new());
    }
    let current = self
      .entries
      .get(owner)
      .ok_or_else(|| match set.ssrcs().next() {
        Some(ssrc) => SourceError::SourceDoesNotExist(ssrc),
        None => SourceError::SourceGroupDoesNotExist(
          set.groups().first().map(|g| g.to_string()).unwrap_or_default(),
        ),
      })?;

    for ssrc in set.ssrcs() {
      if !current.has_ssrc(ssrc) {
        return Err(SourceError::SourceDoesNotExist(ssrc));
      }
    }
    for group in set.groups() {
      if !current.groups().contains(group) {
        return Err(SourceError::SourceGroupDoesNotExist(group.to_string()));
      }
    }

    Ok(self.remove(owner, set))
  }

  /// Entries present in both maps, per owner.
  pub fn intersection(&self, other: &Self) -> Self {
    let mut map = Self::new();
    for (owner, set) in &self.entries {
      if let Some(other_set) = other.get(owner) {
        let shared = set.intersection(other_set);
        if !shared.is_empty() {
          ConferenceSourceMap::add(&mut map, owner, &shared);
        }
      }
    }
    map
  }

  /// Restrict every entry to one media type.
  pub fn media_type(&self, media_type: MediaType) -> Self {
    let mut map = Self::new();
    for (owner, set) in &self.entries {
      let filtered = set.media_type(media_type);
      if !filtered.is_empty() {
        ConferenceSourceMap::add(&mut map, owner, &filtered);
      }
    }
    map
  }

  /// Apply the simulcast projection to every entry.
  pub fn strip_simulcast(&self) -> Result<Self, SourceError> {
    let mut map = Self::new();
    for (owner, set) in &self.entries {
      let stripped = set.strip_simulcast()?;
      if !stripped.is_empty() {
        ConferenceSourceMap::add(&mut map, owner, &stripped);
      }
    }
    Ok(map)
  }

  /// Drop focus-injected sources from every entry.
  pub fn strip_injected(&self) -> Self {
    let mut map = Self::new();
    for (owner, set) in &self.entries {
      let stripped = set.strip_injected();
      if !stripped.is_empty() {
        ConferenceSourceMap::add(&mut map, owner, &stripped);
      }
    }
    map
  }

  /// A copy without `owner`'s own entry, for signaling peers to them.
  pub fn without_owner(&self, owner: &str) -> Self {
    let mut map = self.clone();
    map.remove_owner(owner);
    map
  }

  /// `{ "ownerId": <EndpointSourceSet.compactJson>, … }`
  pub fn compact_json(&self) -> Value {
    Value::Object(
      self
        .entries
        .iter()
        .map(|(owner, set)| (owner.clone(), set.compact_json()))
        .collect(),
    )
  }
}

impl Add<&ConferenceSourceMap> for ConferenceSourceMap {
  type Output = ConferenceSourceMap;

  fn add(mut self, rhs: &ConferenceSourceMap) -> Self::Output {
    for (owner, set) in &rhs.entries {
      ConferenceSourceMap::add(&mut self, owner, set);
    }
    self
  }
}

impl Sub<&ConferenceSourceMap> for ConferenceSourceMap {
  type Output = ConferenceSourceMap;

  fn sub(mut self, rhs: &ConferenceSourceMap) -> Self::Output {
    for (owner, set) in &rhs.entries {
      self.remove(owner, set);
    }
    self
  }
}

/// The conference's authoritative map: concurrent readers, mutations
/// serialized under the map lock so the map is never observed in a
/// partially validated state.
#[derive(Debug, Clone)]
pub struct SharedSourceMap {
  inner: Arc<RwLock<ConferenceSourceMap>>,
}

impl SharedSourceMap {
  pub fn new(limits: SourceLimits) -> Self {
    Self {
      inner: Arc::new(RwLock::new(ConferenceSourceMap::with_limits(limits))),
    }
  }

  /// A read-only capability onto the same map. Mutation through a reader is
  /// not merely an error; it does not typecheck.
  pub fn reader(&self) -> SourceMapReader {
    SourceMapReader {
      inner: self.inner.clone(),
    }
  }

  pub fn try_to_add(
    &self,
    owner: &str,
    set: &EndpointSourceSet,
  ) -> Result<EndpointSourceSet, SourceError> {
    self.inner.write().try_to_add(owner, set)
  }

  pub fn try_to_remove(
    &self,
    owner: &str,
    set: &EndpointSourceSet,
  ) -> Result<EndpointSourceSet, SourceError> {
    self.inner.write().try_to_remove(owner, set)
  }

  pub(crate) fn add(&self, owner: &str, set: &EndpointSourceSet) {
    ConferenceSourceMap::add(&mut self.inner.write(), owner, set);
  }

  pub(crate) fn remove(&self, owner: &str, set: &EndpointSourceSet) -> EndpointSourceSet {
    self.inner.write().remove(owner, set)
  }

  pub fn remove_owner(&self, owner: &str) -> Option<EndpointSourceSet> {
    self.inner.write().remove_owner(owner)
  }

  pub fn snapshot(&self) -> ConferenceSourceMap {
    self.inner.read().clone()
  }
}

#[derive(Debug, Clone)]
pub struct SourceMapReader {
  inner: Arc<RwLock<ConferenceSourceMap>>,
}

impl SourceMapReader {
  pub fn get(&self, owner: &str) -> Option<EndpointSourceSet> {
    self.inner.read().get(owner).cloned()
  }

  pub fn owner_of_ssrc(&self, ssrc: u32) -> Option<String> {
    self.inner.read().owner_of_ssrc(ssrc).map(str::to_owned)
  }

  pub fn snapshot(&self) -> ConferenceSourceMap {
    self.inner.read().clone()
  }

  pub fn compact_json(&self) -> Value {
    self.inner.read().compact_json()
  }
}
