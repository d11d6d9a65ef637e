use std::{
  collections::{BTreeMap, BTreeSet},
  fmt,
  ops::{Add, Sub},
  str::FromStr,
};

use itertools::Itertools;
use meet_focus_signaling::{Content, RtpDescription, Semantics, SourceElement, SsrcGroupElement};
use serde_json::{json, Value};

use crate::error::SourceError;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum MediaType {
  Audio,
  Video,
}

impl MediaType {
  pub fn as_str(&self) -> &'static str {
    match self {
      MediaType::Audio => "audio",
      MediaType::Video => "video",
    }
  }
}

impl fmt::Display for MediaType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for MediaType {
  type Err = SourceError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "audio" => Ok(MediaType::Audio),
      "video" => Ok(MediaType::Video),
      other => Err(SourceError::InvalidMediaType(other.to_owned())),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoType {
  Camera,
  Desktop,
}

impl VideoType {
  pub fn as_str(&self) -> &'static str {
    match self {
      VideoType::Camera => "camera",
      VideoType::Desktop => "desktop",
    }
  }
}

impl FromStr for VideoType {
  type Err = SourceError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "camera" => Ok(VideoType::Camera),
      "desktop" => Ok(VideoType::Desktop),
      other => Err(SourceError::InvalidVideoType(other.to_owned())),
    }
  }
}

/// A single advertised media source. Identity is the ssrc: the conference
/// maps never hold two sources with the same ssrc.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
  pub ssrc: u32,
  pub media_type: MediaType,
  pub name: Option<String>,
  pub msid: Option<String>,
  pub video_type: Option<VideoType>,
  pub injected: bool,
}

impl Source {
  pub fn new(ssrc: u32, media_type: MediaType) -> Self {
    Self {
      ssrc,
      media_type,
      name: None,
      msid: None,
      video_type: None,
      injected: false,
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_msid(mut self, msid: impl Into<String>) -> Self {
    self.msid = Some(msid.into());
    self
  }

  pub fn with_video_type(mut self, video_type: VideoType) -> Self {
    self.video_type = Some(video_type);
    self
  }

  pub fn injected(mut self) -> Self {
    self.injected = true;
    self
  }
}

/// A named association among ssrcs. The order of `ssrcs` is meaningful: for
/// Fid the first is the primary and the second the retransmission, for Sim
/// the first is the lowest simulcast layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcGroup {
  pub semantics: Semantics,
  pub ssrcs: Vec<u32>,
  pub media_type: MediaType,
}

impl SsrcGroup {
  pub fn new(semantics: Semantics, ssrcs: Vec<u32>, media_type: MediaType) -> Self {
    Self {
      semantics,
      ssrcs,
      media_type,
    }
  }

  pub fn sim(ssrcs: Vec<u32>) -> Self {
    Self::new(Semantics::Sim, ssrcs, MediaType::Video)
  }

  pub fn fid(primary: u32, rtx: u32) -> Self {
    Self::new(Semantics::Fid, vec![primary, rtx], MediaType::Video)
  }

  pub fn primary(&self) -> Option<u32> {
    self.ssrcs.first().copied()
  }

  fn compact_tag(&self) -> String {
    match self.semantics {
      Semantics::Sim => "s".to_owned(),
      Semantics::Fid => "f".to_owned(),
      other => other.as_str().to_owned(),
    }
  }

  fn semantics_from_compact_tag(tag: &str) -> Result<Semantics, SourceError> {
    match tag {
      "s" => Ok(Semantics::Sim),
      "f" => Ok(Semantics::Fid),
      other => other
        .parse()
        .map_err(|_| SourceError::MalformedCompact(format!("unknown group tag {other:?}"))),
    }
  }
}

impl fmt::Display for SsrcGroup {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{:?}", self.semantics, self.ssrcs)
  }
}

/// Everything one endpoint advertises: its sources and their groupings.
/// Sources are keyed by ssrc; groups keep insertion order, which carries no
/// meaning (only the order inside each group does).
#[derive(Debug, Clone, Default)]
pub struct EndpointSourceSet {
  sources: BTreeMap<u32, Source>,
  groups: Vec<SsrcGroup>,
}

impl PartialEq for EndpointSourceSet {
  fn eq(&self, other: &Self) -> bool {
    if self.sources != other.sources {
      return false;
    }
    // Cross-group order carries no meaning; compare as multisets.
    let key = |g: &&SsrcGroup| (g.semantics, g.ssrcs.clone(), g.media_type);
    self
      .groups
      .iter()
      .sorted_by_key(key)
      .eq(other.groups.iter().sorted_by_key(key))
  }
}

impl EndpointSourceSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_parts(
    sources: impl IntoIterator<Item = Source>,
    groups: impl IntoIterator<Item = SsrcGroup>,
  ) -> Self {
    let mut set = Self::default();
    for source in sources {
      set.insert_source(source);
    }
    for group in groups {
      set.add_group(group);
    }
    set
  }

  pub fn is_empty(&self) -> bool {
    self.sources.is_empty() && self.groups.is_empty()
  }

  pub fn source_count(&self) -> usize {
    self.sources.len()
  }

  pub fn group_count(&self) -> usize {
    self.groups.len()
  }

  pub fn sources(&self) -> impl Iterator<Item = &Source> {
    self.sources.values()
  }

  pub fn ssrcs(&self) -> impl Iterator<Item = u32> + '_ {
    self.sources.keys().copied()
  }

  pub fn groups(&self) -> &[SsrcGroup] {
    &self.groups
  }

  pub fn get_source(&self, ssrc: u32) -> Option<&Source> {
    self.sources.get(&ssrc)
  }

  pub fn has_ssrc(&self, ssrc: u32) -> bool {
    self.sources.contains_key(&ssrc)
  }

  pub(crate) fn insert_source(&mut self, source: Source) {
    self.sources.insert(source.ssrc, source);
  }

  /// Empty groups and groups already present are accepted as a no-op.
  pub(crate) fn add_group(&mut self, group: SsrcGroup) {
    if group.ssrcs.is_empty() || self.groups.contains(&group) {
      return;
    }
    self.groups.push(group);
  }

  /// Removes the source with this ssrc together with every group that
  /// references it. Returns what was removed.
  pub(crate) fn remove_ssrc(&mut self, ssrc: u32) -> (Option<Source>, Vec<SsrcGroup>) {
    let source = self.sources.remove(&ssrc);
    let mut removed_groups = Vec::new();
    self.groups.retain(|group| {
      if group.ssrcs.contains(&ssrc) {
        removed_groups.push(group.clone());
        false
      }
      else {
        true
      }
    });
    (source, removed_groups)
  }

  pub(crate) fn remove_group(&mut self, group: &SsrcGroup) -> bool {
    let before = self.groups.len();
    self.groups.retain(|g| g != group);
    self.groups.len() != before
  }

  /// Sources (by ssrc) and groups present in both sets.
  pub fn intersection(&self, other: &Self) -> Self {
    Self {
      sources: self
        .sources
        .iter()
        .filter(|(ssrc, _)| other.has_ssrc(**ssrc))
        .map(|(ssrc, s)| (*ssrc, s.clone()))
        .collect(),
      groups: self
        .groups
        .iter()
        .filter(|g| other.groups.contains(g))
        .cloned()
        .collect(),
    }
  }

  /// Restrict to the given media type.
  pub fn media_type(&self, media_type: MediaType) -> Self {
    Self {
      sources: self
        .sources
        .iter()
        .filter(|(_, s)| s.media_type == media_type)
        .map(|(ssrc, s)| (*ssrc, s.clone()))
        .collect(),
      groups: self
        .groups
        .iter()
        .filter(|g| g.media_type == media_type)
        .cloned()
        .collect(),
    }
  }

  /// Drop sources injected by the focus itself.
  pub fn strip_injected(&self) -> Self {
    let injected: BTreeSet<u32> = self
      .sources
      .values()
      .filter(|s| s.injected)
      .map(|s| s.ssrc)
      .collect();
    Self {
      sources: self
        .sources
        .iter()
        .filter(|(ssrc, _)| !injected.contains(ssrc))
        .map(|(ssrc, s)| (*ssrc, s.clone()))
        .collect(),
      groups: self
        .groups
        .iter()
        .filter(|g| g.ssrcs.iter().all(|ssrc| !injected.contains(ssrc)))
        .cloned()
        .collect(),
    }
  }

  /// Simulcast projection: keep only the first ssrc of each Sim group, drop
  /// the retransmission of any Fid group whose primary was dropped, and drop
  /// the affected groups. Fails on a Fid group that does not have exactly
  /// two members, leaving the input untouched.
  pub fn strip_simulcast(&self) -> Result<Self, SourceError> {
    for group in &self.groups {
      if group.semantics == Semantics::Fid && group.ssrcs.len() != 2 {
        return Err(SourceError::InvalidFidGroup(group.ssrcs.len()));
      }
    }

    let mut removed: BTreeSet<u32> = BTreeSet::new();
    for group in &self.groups {
      if group.semantics == Semantics::Sim {
        removed.extend(group.ssrcs.iter().skip(1).copied());
      }
    }

    let mut groups = Vec::new();
    for group in &self.groups {
      match group.semantics {
        Semantics::Sim => {},
        Semantics::Fid => {
          let primary = group.ssrcs[0];
          let rtx = group.ssrcs[1];
          if removed.contains(&primary) {
            removed.insert(rtx);
          }
          else {
            groups.push(group.clone());
          }
        },
        _ => groups.push(group.clone()),
      }
    }

    Ok(Self {
      sources: self
        .sources
        .iter()
        .filter(|(ssrc, _)| !removed.contains(ssrc))
        .map(|(ssrc, s)| (*ssrc, s.clone()))
        .collect(),
      groups,
    })
  }

  /// Read an endpoint's sources out of negotiated contents.
  pub fn parse(contents: &[Content]) -> Result<Self, SourceError> {
    let mut set = Self::default();
    for content in contents {
      let description = match &content.description {
        Some(description) => description,
        None => continue,
      };
      let media_type: MediaType = description.media.parse()?;
      for element in &description.ssrcs {
        let video_type = element
          .video_type
          .as_deref()
          .map(VideoType::from_str)
          .transpose()?;
        set.insert_source(Source {
          ssrc: element.id,
          media_type,
          name: element.name.clone(),
          msid: element.msid.clone(),
          video_type,
          injected: element.injected,
        });
      }
      for group in &description.ssrc_groups {
        set.add_group(SsrcGroup::new(
          group.semantics,
          group.sources.clone(),
          media_type,
        ));
      }
    }
    Ok(set)
  }

  /// Inverse of [`parse`](Self::parse). The owner, when given, is annotated
  /// on every emitted source so peers can attribute it.
  pub fn encode(&self, owner: Option<&str>) -> Vec<Content> {
    let mut contents = Vec::new();
    for media_type in [MediaType::Audio, MediaType::Video] {
      let sources: Vec<&Source> = self
        .sources
        .values()
        .filter(|s| s.media_type == media_type)
        .collect();
      let groups: Vec<&SsrcGroup> = self
        .groups
        .iter()
        .filter(|g| g.media_type == media_type)
        .collect();
      if sources.is_empty() && groups.is_empty() {
        continue;
      }
      let mut description = RtpDescription::new(media_type.as_str());
      description.ssrcs = sources
        .iter()
        .map(|s| SourceElement {
          id: s.ssrc,
          name: s.name.clone(),
          msid: s.msid.clone(),
          video_type: s.video_type.map(|vt| vt.as_str().to_owned()),
          owner: owner.map(str::to_owned),
          injected: s.injected,
        })
        .collect();
      description.ssrc_groups = groups
        .iter()
        .map(|g| SsrcGroupElement {
          semantics: g.semantics,
          sources: g.ssrcs.clone(),
        })
        .collect();
      contents.push(Content::new(media_type.as_str()).with_description(description));
    }
    contents
  }

  fn compact_source(source: &Source) -> Value {
    let mut object = serde_json::Map::new();
    object.insert("s".to_owned(), json!(source.ssrc));
    if let Some(name) = &source.name {
      object.insert("n".to_owned(), json!(name));
    }
    if let Some(msid) = &source.msid {
      object.insert("m".to_owned(), json!(msid));
    }
    if source.video_type == Some(VideoType::Desktop) {
      object.insert("v".to_owned(), json!("d"));
    }
    Value::Object(object)
  }

  fn compact_group(group: &SsrcGroup) -> Value {
    let mut array = vec![json!(group.compact_tag())];
    array.extend(group.ssrcs.iter().map(|ssrc| json!(ssrc)));
    Value::Array(array)
  }

  /// Size-optimized dump: `[[videoSources], [videoGroups], [audioSources],
  /// [audioGroups]]` with trailing empty elements omitted.
  pub fn compact_json(&self) -> Value {
    let collect_sources = |media_type| {
      Value::Array(
        self
          .sources
          .values()
          .filter(|s| s.media_type == media_type)
          .map(Self::compact_source)
          .collect(),
      )
    };
    let collect_groups = |media_type| {
      Value::Array(
        self
          .groups
          .iter()
          .filter(|g| g.media_type == media_type)
          .map(Self::compact_group)
          .collect(),
      )
    };
    let mut parts = vec![
      collect_sources(MediaType::Video),
      collect_groups(MediaType::Video),
      collect_sources(MediaType::Audio),
      collect_groups(MediaType::Audio),
    ];
    while matches!(parts.last(), Some(Value::Array(a)) if a.is_empty()) {
      parts.pop();
    }
    Value::Array(parts)
  }

  fn parse_compact_ssrc(value: &Value) -> Result<u32, SourceError> {
    let raw = value
      .as_u64()
      .ok_or_else(|| SourceError::MalformedCompact(format!("ssrc must be a number, got {value}")))?;
    if raw == 0 || raw > u32::MAX as u64 {
      return Err(SourceError::InvalidSsrc(raw));
    }
    Ok(raw as u32)
  }

  fn parse_compact_source(value: &Value, media_type: MediaType) -> Result<Source, SourceError> {
    let object = value
      .as_object()
      .ok_or_else(|| SourceError::MalformedCompact("source must be an object".to_owned()))?;
    let ssrc = Self::parse_compact_ssrc(
      object
        .get("s")
        .ok_or(SourceError::RequiredParameterMissing("s"))?,
    )?;
    let mut source = Source::new(ssrc, media_type);
    source.name = object.get("n").and_then(Value::as_str).map(str::to_owned);
    source.msid = object.get("m").and_then(Value::as_str).map(str::to_owned);
    if object.get("v").and_then(Value::as_str) == Some("d") {
      source.video_type = Some(VideoType::Desktop);
    }
    Ok(source)
  }

  fn parse_compact_group(value: &Value, media_type: MediaType) -> Result<SsrcGroup, SourceError> {
    let array = value
      .as_array()
      .ok_or_else(|| SourceError::MalformedCompact("group must be an array".to_owned()))?;
    let tag = array
      .first()
      .and_then(Value::as_str)
      .ok_or_else(|| SourceError::MalformedCompact("group missing semantics tag".to_owned()))?;
    let semantics = SsrcGroup::semantics_from_compact_tag(tag)?;
    let ssrcs = array[1..]
      .iter()
      .map(Self::parse_compact_ssrc)
      .collect::<Result<Vec<_>, _>>()?;
    Ok(SsrcGroup::new(semantics, ssrcs, media_type))
  }

  /// Inverse of [`compact_json`](Self::compact_json).
  pub fn from_compact_json(value: &Value) -> Result<Self, SourceError> {
    let parts = value
      .as_array()
      .ok_or_else(|| SourceError::MalformedCompact("expected an array".to_owned()))?;
    let empty = Value::Array(vec![]);
    let part = |i: usize| parts.get(i).unwrap_or(&empty);
    let mut set = Self::default();
    for source in part(0)
      .as_array()
      .ok_or_else(|| SourceError::MalformedCompact("expected a source array".to_owned()))?
    {
      set.insert_source(Self::parse_compact_source(source, MediaType::Video)?);
    }
    for group in part(1)
      .as_array()
      .ok_or_else(|| SourceError::MalformedCompact("expected a group array".to_owned()))?
    {
      set.add_group(Self::parse_compact_group(group, MediaType::Video)?);
    }
    for source in part(2)
      .as_array()
      .ok_or_else(|| SourceError::MalformedCompact("expected a source array".to_owned()))?
    {
      set.insert_source(Self::parse_compact_source(source, MediaType::Audio)?);
    }
    for group in part(3)
      .as_array()
      .ok_or_else(|| SourceError::MalformedCompact("expected a group array".to_owned()))?
    {
      set.add_group(Self::parse_compact_group(group, MediaType::Audio)?);
    }
    Ok(set)
  }
}

impl Add<&EndpointSourceSet> for EndpointSourceSet {
  type Output = EndpointSourceSet;

  fn add(mut self, rhs: &EndpointSourceSet) -> Self::Output {
    for source in rhs.sources.values() {
      self.sources.entry(source.ssrc).or_insert_with(|| source.clone());
    }
    for group in &rhs.groups {
      self.add_group(group.clone());
    }
    self
  }
}

impl Sub<&EndpointSourceSet> for EndpointSourceSet {
  type Output = EndpointSourceSet;

  fn sub(mut self, rhs: &EndpointSourceSet) -> Self::Output {
    for ssrc in rhs.sources.keys() {
      self.sources.remove(ssrc);
    }
    for group in &rhs.groups {
      self.remove_group(group);
    }
    self
  }
}
