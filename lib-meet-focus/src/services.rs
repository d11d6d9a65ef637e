use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
  auth::AuthenticationAuthority,
  bridge::BridgeRegistry,
  colibri::BridgeRpc,
  config::FocusConfig,
  events::FocusEvent,
  jibri::{JigasiManager, WorkerRpc},
  roles::{AuthenticatedRoleManager, AutoOwnerRoleManager, RoleManager},
  selector::{strategy_from_config, BridgeSelector},
  signaling::SignalingSender,
  worker::WorkerPool,
};

/// Everything a conference needs from the process, passed explicitly
/// instead of living in module-level singletons.
#[derive(Clone)]
pub struct FocusServices {
  pub config: Arc<FocusConfig>,
  pub registry: Arc<BridgeRegistry>,
  pub selector: Arc<BridgeSelector>,
  pub bridge_rpc: Arc<dyn BridgeRpc>,
  pub jibri_pool: Arc<WorkerPool>,
  pub gateway_pool: Arc<WorkerPool>,
  pub worker_rpc: Arc<dyn WorkerRpc>,
  pub jigasi: Arc<JigasiManager>,
  pub signaling: Arc<dyn SignalingSender>,
  pub auth: Arc<dyn AuthenticationAuthority>,
  pub role_manager: Arc<dyn RoleManager>,
  pub events: mpsc::Sender<FocusEvent>,
}

impl FocusServices {
  /// Wire up the service graph from the config and the external
  /// collaborators. The returned receiver carries every conference event.
  pub fn new(
    config: Arc<FocusConfig>,
    bridge_rpc: Arc<dyn BridgeRpc>,
    worker_rpc: Arc<dyn WorkerRpc>,
    signaling: Arc<dyn SignalingSender>,
    auth: Arc<dyn AuthenticationAuthority>,
  ) -> (Self, mpsc::Receiver<FocusEvent>) {
    let registry = Arc::new(BridgeRegistry::new(config.bridge_failure_reset_threshold));
    let selector = Arc::new(BridgeSelector::new(
      registry.clone(),
      strategy_from_config(&config),
    ));
    let jibri_pool = Arc::new(WorkerPool::new(config.clone()));
    let gateway_pool = Arc::new(WorkerPool::new(config.clone()));
    let jigasi = Arc::new(JigasiManager::new(
      gateway_pool.clone(),
      worker_rpc.clone(),
      config.clone(),
    ));
    let role_manager: Arc<dyn RoleManager> = if config.auto_owner {
      Arc::new(AutoOwnerRoleManager)
    }
    else {
      Arc::new(AuthenticatedRoleManager)
    };
    let (events, events_rx) = mpsc::channel(64);
    (
      Self {
        config,
        registry,
        selector,
        bridge_rpc,
        jibri_pool,
        gateway_pool,
        worker_rpc,
        jigasi,
        signaling,
        auth,
        role_manager,
        events,
      },
      events_rx,
    )
  }
}
