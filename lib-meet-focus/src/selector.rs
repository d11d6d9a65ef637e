use std::{collections::HashMap, sync::Arc};

use tracing::debug;

use crate::{
  bridge::{Bridge, BridgeRegistry},
  config::{FocusConfig, SelectionStrategy},
};

/// Picks one bridge from an already-filtered candidate list. The selector
/// has applied operational/drain/version filtering before a strategy runs.
pub trait BridgeSelectionStrategy: Send + Sync {
  fn select(
    &self,
    candidates: &[Arc<Bridge>],
    conference_bridges: &HashMap<String, usize>,
    participant_region: Option<&str>,
  ) -> Option<Arc<Bridge>>;
}

fn least_stressed<'a>(
  bridges: impl IntoIterator<Item = &'a Arc<Bridge>>,
) -> Option<Arc<Bridge>> {
  bridges
    .into_iter()
    .min_by(|a, b| a.stress().total_cmp(&b.stress()))
    .cloned()
}

/// Keep the whole conference on one bridge for as long as it can take it.
pub struct SingleBridgeStrategy {
  pub max_bridge_stress: f64,
  pub avg_participant_stress: f64,
}

impl BridgeSelectionStrategy for SingleBridgeStrategy {
  fn select(
    &self,
    candidates: &[Arc<Bridge>],
    conference_bridges: &HashMap<String, usize>,
    _participant_region: Option<&str>,
  ) -> Option<Arc<Bridge>> {
    if let Some(existing) = candidates
      .iter()
      .find(|b| conference_bridges.contains_key(b.jid()))
    {
      if existing.stress() + self.avg_participant_stress <= self.max_bridge_stress {
        return Some(existing.clone());
      }
    }
    least_stressed(candidates)
  }
}

/// Prefer a bridge close to the participant: own region, then a grouped
/// region, then the focus's region, then a bridge the conference already
/// uses, then anything.
pub struct RegionBasedStrategy {
  config: Arc<FocusConfig>,
}

impl RegionBasedStrategy {
  pub fn new(config: Arc<FocusConfig>) -> Self {
    Self { config }
  }
}

impl BridgeSelectionStrategy for RegionBasedStrategy {
  fn select(
    &self,
    candidates: &[Arc<Bridge>],
    conference_bridges: &HashMap<String, usize>,
    participant_region: Option<&str>,
  ) -> Option<Arc<Bridge>> {
    if let Some(region) = participant_region {
      let in_region: Vec<&Arc<Bridge>> = candidates
        .iter()
        .filter(|b| b.region().as_deref() == Some(region))
        .collect();
      if let Some(bridge) = least_stressed(in_region) {
        return Some(bridge);
      }
      let group = self.config.region_group(region);
      let in_group: Vec<&Arc<Bridge>> = candidates
        .iter()
        .filter(|b| b.region().map(|r| group.contains(&r)).unwrap_or(false))
        .collect();
      if let Some(bridge) = least_stressed(in_group) {
        return Some(bridge);
      }
    }
    if let Some(local) = &self.config.local_region {
      let in_local: Vec<&Arc<Bridge>> = candidates
        .iter()
        .filter(|b| b.region().as_deref() == Some(local.as_str()))
        .collect();
      if let Some(bridge) = least_stressed(in_local) {
        return Some(bridge);
      }
    }
    let in_conference: Vec<&Arc<Bridge>> = candidates
      .iter()
      .filter(|b| conference_bridges.contains_key(b.jid()))
      .collect();
    if let Some(bridge) = least_stressed(in_conference) {
      return Some(bridge);
    }
    least_stressed(candidates)
  }
}

/// Spread the conference over as many bridges as possible: a bridge the
/// conference does not use yet always wins; ties go to the lower stress.
pub struct SplitBridgeStrategy;

impl BridgeSelectionStrategy for SplitBridgeStrategy {
  fn select(
    &self,
    candidates: &[Arc<Bridge>],
    conference_bridges: &HashMap<String, usize>,
    _participant_region: Option<&str>,
  ) -> Option<Arc<Bridge>> {
    let unused: Vec<&Arc<Bridge>> = candidates
      .iter()
      .filter(|b| !conference_bridges.contains_key(b.jid()))
      .collect();
    if let Some(bridge) = least_stressed(unused) {
      return Some(bridge);
    }
    candidates
      .iter()
      .min_by(|a, b| {
        let a_count = conference_bridges.get(a.jid()).copied().unwrap_or(0);
        let b_count = conference_bridges.get(b.jid()).copied().unwrap_or(0);
        a_count.cmp(&b_count).then(a.stress().total_cmp(&b.stress()))
      })
      .cloned()
  }
}

pub fn strategy_from_config(config: &Arc<FocusConfig>) -> Arc<dyn BridgeSelectionStrategy> {
  match config.selection_strategy {
    SelectionStrategy::Single => Arc::new(SingleBridgeStrategy {
      max_bridge_stress: config.max_bridge_stress,
      avg_participant_stress: config.avg_participant_stress,
    }),
    SelectionStrategy::RegionBased => Arc::new(RegionBasedStrategy::new(config.clone())),
    SelectionStrategy::Split => Arc::new(SplitBridgeStrategy),
  }
}

/// Applies the hard constraints (operational, not draining for new use,
/// version pin) and hands the survivors to the configured strategy.
pub struct BridgeSelector {
  registry: Arc<BridgeRegistry>,
  strategy: Arc<dyn BridgeSelectionStrategy>,
}

impl BridgeSelector {
  pub fn new(registry: Arc<BridgeRegistry>, strategy: Arc<dyn BridgeSelectionStrategy>) -> Self {
    Self { registry, strategy }
  }

  pub fn registry(&self) -> &Arc<BridgeRegistry> {
    &self.registry
  }

  /// Returns None when no bridge satisfies the constraints; a caller with a
  /// version pin must not fall back to a different version on its own.
  pub fn select_bridge(
    &self,
    conference_bridges: &HashMap<String, usize>,
    participant_region: Option<&str>,
    version: Option<&str>,
  ) -> Option<Arc<Bridge>> {
    // A conference that already runs on version V stays pinned to V.
    let pinned: Option<String> = version.map(str::to_owned).or_else(|| {
      conference_bridges
        .keys()
        .filter_map(|jid| self.registry.get(jid))
        .find_map(|bridge| bridge.version())
    });

    let candidates: Vec<Arc<Bridge>> = self
      .registry
      .list()
      .into_iter()
      .filter(|bridge| {
        if !bridge.is_operational() {
          return false;
        }
        let in_conference = conference_bridges.contains_key(bridge.jid());
        if !in_conference && (bridge.is_in_graceful_shutdown() || bridge.is_draining()) {
          return false;
        }
        match &pinned {
          Some(version) => bridge.version().as_deref() == Some(version.as_str()),
          None => true,
        }
      })
      .collect();

    let selected = self
      .strategy
      .select(&candidates, conference_bridges, participant_region);
    debug!(
      participant_region,
      selected = selected.as_ref().map(|b| b.jid().to_owned()).as_deref(),
      "bridge selection"
    );
    selected
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use maplit::hashmap;

  use super::*;
  use crate::bridge::BridgeStats;

  fn registry_with(bridges: &[(&str, &str, f64)]) -> Arc<BridgeRegistry> {
    let registry = Arc::new(BridgeRegistry::new(Duration::from_secs(60)));
    for (jid, region, stress) in bridges {
      registry.on_bridge_stats(
        jid,
        &BridgeStats {
          stress: Some(*stress),
          region: Some((*region).to_owned()),
          ..Default::default()
        },
      );
    }
    registry
  }

  fn region_selector(registry: Arc<BridgeRegistry>) -> BridgeSelector {
    let config = Arc::new(FocusConfig::default());
    BridgeSelector::new(registry, Arc::new(RegionBasedStrategy::new(config)))
  }

  #[test]
  fn region_match_beats_lower_stress_elsewhere() {
    let registry = registry_with(&[("b1", "r1", 0.2), ("b2", "r2", 0.5), ("b3", "r3", 0.1)]);
    let selector = region_selector(registry);
    let selected = selector
      .select_bridge(&HashMap::new(), Some("r2"), None)
      .unwrap();
    assert_eq!(selected.jid(), "b2");
  }

  #[test]
  fn region_match_wins_even_when_conference_is_elsewhere() {
    let registry = registry_with(&[("b1", "r1", 0.2), ("b2", "r2", 0.5), ("b3", "r3", 0.1)]);
    registry.get("b2").unwrap().apply_stats(&BridgeStats {
      stress: Some(0.9),
      ..Default::default()
    });
    let selector = region_selector(registry);
    let selected = selector
      .select_bridge(&hashmap! {"b1".to_owned() => 1}, Some("r2"), None)
      .unwrap();
    assert_eq!(selected.jid(), "b2");
  }

  #[test]
  fn no_region_match_falls_back_to_conference_bridge() {
    let registry = registry_with(&[("b1", "r1", 0.4), ("b2", "r2", 0.1)]);
    let selector = region_selector(registry);
    let selected = selector
      .select_bridge(&hashmap! {"b1".to_owned() => 2}, Some("nowhere"), None)
      .unwrap();
    assert_eq!(selected.jid(), "b1");
  }

  #[test]
  fn split_prefers_a_bridge_the_conference_does_not_use() {
    let registry = registry_with(&[("b1", "r1", 0.1), ("b2", "r2", 0.2), ("b3", "r3", 0.9)]);
    let selector = BridgeSelector::new(registry, Arc::new(SplitBridgeStrategy));
    let selected = selector
      .select_bridge(
        &hashmap! {"b1".to_owned() => 1, "b2".to_owned() => 1},
        None,
        None,
      )
      .unwrap();
    assert_eq!(selected.jid(), "b3");
  }

  #[test]
  fn split_balances_within_the_conference_when_all_are_used() {
    let registry = registry_with(&[("b1", "r1", 0.1), ("b2", "r2", 0.2)]);
    let selector = BridgeSelector::new(registry, Arc::new(SplitBridgeStrategy));
    let selected = selector
      .select_bridge(
        &hashmap! {"b1".to_owned() => 5, "b2".to_owned() => 2},
        None,
        None,
      )
      .unwrap();
    assert_eq!(selected.jid(), "b2");
  }

  #[test]
  fn single_sticks_to_the_conference_bridge_until_stressed() {
    let registry = registry_with(&[("b1", "r1", 0.5), ("b2", "r1", 0.1)]);
    let strategy = SingleBridgeStrategy {
      max_bridge_stress: 0.8,
      avg_participant_stress: 0.01,
    };
    let selector = BridgeSelector::new(registry.clone(), Arc::new(strategy));
    let conference = hashmap! {"b1".to_owned() => 3};
    assert_eq!(
      selector.select_bridge(&conference, None, None).unwrap().jid(),
      "b1"
    );

    registry.get("b1").unwrap().apply_stats(&BridgeStats {
      stress: Some(0.85),
      ..Default::default()
    });
    assert_eq!(
      selector.select_bridge(&conference, None, None).unwrap().jid(),
      "b2"
    );
  }

  #[test]
  fn failed_drained_and_shutdown_bridges_are_skipped_for_new_use() {
    let registry = registry_with(&[("b1", "r1", 0.1), ("b2", "r1", 0.2), ("b3", "r1", 0.3)]);
    registry.get("b1").unwrap().set_failed();
    registry.get("b2").unwrap().apply_stats(&BridgeStats {
      drain: Some(true),
      ..Default::default()
    });
    let selector = region_selector(registry.clone());
    let selected = selector
      .select_bridge(&HashMap::new(), Some("r1"), None)
      .unwrap();
    assert_eq!(selected.jid(), "b3");

    // A draining bridge is still usable by a conference already on it.
    let selected = selector
      .select_bridge(&hashmap! {"b2".to_owned() => 1}, Some("r1"), None)
      .unwrap();
    assert_eq!(selected.jid(), "b2");
  }

  #[test]
  fn version_pin_returns_none_rather_than_switching() {
    let registry = registry_with(&[("b1", "r1", 0.1)]);
    registry.get("b1").unwrap().apply_stats(&BridgeStats {
      version: Some("2.1".to_owned()),
      ..Default::default()
    });
    let selector = region_selector(registry);
    assert!(selector
      .select_bridge(&HashMap::new(), None, Some("9.9"))
      .is_none());
    assert!(selector
      .select_bridge(&HashMap::new(), None, Some("2.1"))
      .is_some());
  }

  #[test]
  fn conference_version_pins_implicitly() {
    let registry = registry_with(&[("b1", "r1", 0.5), ("b2", "r2", 0.1)]);
    registry.get("b1").unwrap().apply_stats(&BridgeStats {
      version: Some("2.1".to_owned()),
      ..Default::default()
    });
    registry.get("b2").unwrap().apply_stats(&BridgeStats {
      version: Some("3.0".to_owned()),
      ..Default::default()
    });
    let selector = region_selector(registry);
    // The conference already runs on b1's version, so b2 is out, even for a
    // participant in b2's region.
    let selected = selector
      .select_bridge(&hashmap! {"b1".to_owned() => 1}, Some("r2"), None)
      .unwrap();
    assert_eq!(selected.jid(), "b1");
  }
}
