use anyhow::{bail, Result};
use async_trait::async_trait;

/// The authentication authority the focus consults. The focus never touches
/// credentials; it only asks yes/no questions and relays URLs.
#[async_trait]
pub trait AuthenticationAuthority: Send + Sync {
  async fn create_login_url(
    &self,
    machine_uid: &str,
    peer: &str,
    room: &str,
    popup: bool,
  ) -> Result<String>;

  /// Ends the session; may return a logout URL for the client to visit.
  async fn process_logout(&self, session_id: &str) -> Result<Option<String>>;

  fn is_authenticated(&self, jid: &str) -> bool;
}

/// Deployments without authentication.
pub struct NoAuthentication;

#[async_trait]
impl AuthenticationAuthority for NoAuthentication {
  async fn create_login_url(
    &self,
    _machine_uid: &str,
    _peer: &str,
    _room: &str,
    _popup: bool,
  ) -> Result<String> {
    bail!("authentication is not configured")
  }

  async fn process_logout(&self, _session_id: &str) -> Result<Option<String>> {
    bail!("authentication is not configured")
  }

  fn is_authenticated(&self, _jid: &str) -> bool {
    false
  }
}
