use crate::source_map::ConferenceSourceMap;

/// One pending batch of source signaling towards a participant.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceUpdate {
  Add(ConferenceSourceMap),
  Remove(ConferenceSourceMap),
}

impl SourceUpdate {
  pub fn sources(&self) -> &ConferenceSourceMap {
    match self {
      SourceUpdate::Add(map) | SourceUpdate::Remove(map) => map,
    }
  }

  fn is_empty(&self) -> bool {
    self.sources().is_empty()
  }
}

/// Pending source-add/source-remove batches for one participant, coalesced
/// at flush time so the wire carries the fewest messages that still replay
/// to the same state: consecutive adds merge into one, a remove cancels
/// what an earlier add would have announced, and an add after a surviving
/// remove stays separate.
#[derive(Debug, Default)]
pub struct SignalingQueue {
  pending: Vec<SourceUpdate>,
}

impl SignalingQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  pub fn queue_add(&mut self, sources: ConferenceSourceMap) {
    if !sources.is_empty() {
      self.pending.push(SourceUpdate::Add(sources));
    }
  }

  pub fn queue_remove(&mut self, sources: ConferenceSourceMap) {
    if !sources.is_empty() {
      self.pending.push(SourceUpdate::Remove(sources));
    }
  }

  pub fn clear(&mut self) {
    self.pending.clear();
  }

  /// Drain and coalesce.
  pub fn flush(&mut self) -> Vec<SourceUpdate> {
    let mut out: Vec<SourceUpdate> = Vec::new();
    for update in self.pending.drain(..) {
      match update {
        SourceUpdate::Add(map) => match out.last_mut() {
          Some(SourceUpdate::Add(prev)) => {
            *prev = std::mem::take(prev) + &map;
          },
          _ => out.push(SourceUpdate::Add(map)),
        },
        SourceUpdate::Remove(map) => {
          // Cancel against anything an earlier queued add would announce.
          let mut remaining = map;
          for earlier in out.iter_mut() {
            if let SourceUpdate::Add(added) = earlier {
              let cancelled = added.intersection(&remaining);
              if !cancelled.is_empty() {
                *added = std::mem::take(added) - &cancelled;
                remaining = remaining - &cancelled;
              }
            }
          }
          out.retain(|update| !update.is_empty());
          if !remaining.is_empty() {
            match out.last_mut() {
              Some(SourceUpdate::Remove(prev)) => {
                *prev = std::mem::take(prev) + &remaining;
              },
              _ => out.push(SourceUpdate::Remove(remaining)),
            }
          }
        },
      }
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::{EndpointSourceSet, MediaType, Source};

  fn owned(owner: &str, ssrcs: &[u32]) -> ConferenceSourceMap {
    ConferenceSourceMap::from_owner(
      owner,
      EndpointSourceSet::from_parts(
        ssrcs.iter().map(|&ssrc| Source::new(ssrc, MediaType::Audio)),
        [],
      ),
    )
  }

  #[test]
  fn add_add_remove_coalesces_to_one_add() {
    let mut queue = SignalingQueue::new();
    queue.queue_add(owned("A", &[1]));
    queue.queue_add(owned("B", &[2]));
    queue.queue_remove(owned("B", &[2]));

    let flushed = queue.flush();
    assert_eq!(flushed, vec![SourceUpdate::Add(owned("A", &[1]))]);
    assert!(queue.flush().is_empty());
  }

  #[test]
  fn remove_of_already_signaled_sources_survives() {
    let mut queue = SignalingQueue::new();
    queue.queue_remove(owned("A", &[1]));
    let flushed = queue.flush();
    assert_eq!(flushed, vec![SourceUpdate::Remove(owned("A", &[1]))]);
  }

  #[test]
  fn add_after_remove_stays_separate() {
    let mut queue = SignalingQueue::new();
    queue.queue_remove(owned("A", &[1]));
    queue.queue_add(owned("A", &[1]));
    let flushed = queue.flush();
    assert_eq!(
      flushed,
      vec![
        SourceUpdate::Remove(owned("A", &[1])),
        SourceUpdate::Add(owned("A", &[1])),
      ]
    );
  }

  #[test]
  fn consecutive_removes_merge() {
    let mut queue = SignalingQueue::new();
    queue.queue_remove(owned("A", &[1]));
    queue.queue_remove(owned("B", &[2]));
    let flushed = queue.flush();
    assert_eq!(flushed.len(), 1);
    match &flushed[0] {
      SourceUpdate::Remove(map) => assert_eq!(map.len(), 2),
      other => panic!("unexpected update: {other:?}"),
    }
  }

  #[test]
  fn partial_cancel_keeps_the_rest_of_the_add() {
    let mut queue = SignalingQueue::new();
    queue.queue_add(owned("A", &[1, 2]));
    queue.queue_remove(owned("A", &[2]));
    let flushed = queue.flush();
    assert_eq!(flushed, vec![SourceUpdate::Add(owned("A", &[1]))]);
  }

  #[test]
  fn replaying_a_flush_reproduces_the_net_change() {
    // Whatever the queue saw, applying its output to the peer's last-known
    // state must land on the same map as applying the raw sequence.
    let mut queue = SignalingQueue::new();
    let mut reference = ConferenceSourceMap::new();

    let steps: Vec<(bool, ConferenceSourceMap)> = vec![
      (true, owned("A", &[1, 2])),
      (true, owned("B", &[3])),
      (false, owned("A", &[2])),
      (true, owned("A", &[4])),
      (false, owned("B", &[3])),
    ];
    for (add, map) in steps {
      if add {
        reference = reference + &map;
        queue.queue_add(map);
      }
      else {
        reference = reference - &map;
        queue.queue_remove(map);
      }
    }

    let mut replayed = ConferenceSourceMap::new();
    for update in queue.flush() {
      match update {
        SourceUpdate::Add(map) => replayed = replayed + &map,
        SourceUpdate::Remove(map) => replayed = replayed - &map,
      }
    }
    assert_eq!(replayed, reference);
  }
}
