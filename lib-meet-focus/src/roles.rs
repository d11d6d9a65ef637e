#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
  Owner,
  Member,
}

/// The fields role policies look at, in join order.
#[derive(Debug, Clone)]
pub struct MemberSnapshot {
  pub endpoint_id: String,
  pub robot: bool,
  pub authenticated: bool,
}

/// Decides which members hold the owner role. Pure: the conference applies
/// the returned grants and revocations itself.
pub trait RoleManager: Send + Sync {
  /// The endpoints that should be owners, given the members in join order.
  fn owners(&self, members: &[MemberSnapshot]) -> Vec<String>;
}

/// Always keep exactly one human owner; when the owner leaves, the
/// earliest-joined non-robot member is elected.
pub struct AutoOwnerRoleManager;

impl RoleManager for AutoOwnerRoleManager {
  fn owners(&self, members: &[MemberSnapshot]) -> Vec<String> {
    members
      .iter()
      .find(|m| !m.robot)
      .map(|m| vec![m.endpoint_id.clone()])
      .unwrap_or_default()
  }
}

/// Grant owner to every authenticated member.
pub struct AuthenticatedRoleManager;

impl RoleManager for AuthenticatedRoleManager {
  fn owners(&self, members: &[MemberSnapshot]) -> Vec<String> {
    members
      .iter()
      .filter(|m| m.authenticated)
      .map(|m| m.endpoint_id.clone())
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn member(endpoint_id: &str, robot: bool, authenticated: bool) -> MemberSnapshot {
    MemberSnapshot {
      endpoint_id: endpoint_id.to_owned(),
      robot,
      authenticated,
    }
  }

  #[test]
  fn auto_owner_elects_earliest_human() {
    let manager = AutoOwnerRoleManager;
    let members = vec![
      member("recorder", true, false),
      member("alice", false, false),
      member("bob", false, false),
    ];
    assert_eq!(manager.owners(&members), vec!["alice".to_owned()]);

    // Owner leaves; the next human in join order is elected.
    let members = vec![member("recorder", true, false), member("bob", false, false)];
    assert_eq!(manager.owners(&members), vec!["bob".to_owned()]);

    // Only robots left: nobody to own the room.
    let members = vec![member("recorder", true, false)];
    assert!(manager.owners(&members).is_empty());
  }

  #[test]
  fn authenticated_policy_grants_every_authenticated_member() {
    let manager = AuthenticatedRoleManager;
    let members = vec![
      member("alice", false, true),
      member("bob", false, false),
      member("carol", false, true),
    ];
    assert_eq!(
      manager.owners(&members),
      vec!["alice".to_owned(), "carol".to_owned()]
    );
  }
}
