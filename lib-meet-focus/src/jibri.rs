use std::{
  collections::{HashMap, HashSet},
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
};

use async_trait::async_trait;
use meet_focus_signaling::{DialRequest, DialResponse, JibriMode, JibriStatus};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};

use crate::{
  config::FocusConfig,
  error::{JibriError, RequestError},
  events::{ConferenceEvent, FocusEvent},
  util::generate_id,
  worker::{WorkerCapability, WorkerPool},
};

/// The start request forwarded to a selected worker. The session id is
/// echoed back in every event the worker sends, which is how asynchronous
/// notifications are correlated.
#[derive(Debug, Clone)]
pub struct JibriStartRequest {
  pub session_id: String,
  pub room: String,
  pub mode: JibriMode,
  pub stream_id: Option<String>,
  pub sip_address: Option<String>,
  pub app_data: Option<Value>,
}

/// Blocking round-trips to workers. The managers wrap every call in a
/// timeout; an elapsed timeout takes the same path as an explicit error.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
  async fn send_start(&self, worker: &str, request: &JibriStartRequest) -> Result<(), JibriError>;
  async fn send_stop(&self, worker: &str, session_id: &str) -> Result<(), JibriError>;
  async fn dial(
    &self,
    worker: &str,
    session_id: &str,
    request: &DialRequest,
  ) -> Result<DialResponse, JibriError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JibriSessionState {
  Undefined,
  Pending,
  On,
  Off { failure: Option<String> },
}

impl JibriSessionState {
  fn as_str(&self) -> &'static str {
    match self {
      JibriSessionState::Undefined => "undefined",
      JibriSessionState::Pending => "pending",
      JibriSessionState::On => "on",
      JibriSessionState::Off { .. } => "off",
    }
  }
}

struct SessionInner {
  state: JibriSessionState,
  current_worker: Option<String>,
  retries_left: usize,
  attempted: HashSet<String>,
  /// Bumped on every state change so a stale pending timer can tell it
  /// fired for an earlier incarnation.
  timer_generation: u64,
  terminator: Option<String>,
}

/// One recording, streaming, or SIP call leg.
pub struct JibriSession {
  id: String,
  mode: JibriMode,
  room: String,
  initiator: String,
  stream_id: Option<String>,
  sip_address: Option<String>,
  app_data: Option<Value>,
  inner: Mutex<SessionInner>,
}

impl JibriSession {
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn mode(&self) -> JibriMode {
    self.mode
  }

  pub fn initiator(&self) -> &str {
    &self.initiator
  }

  pub fn state(&self) -> JibriSessionState {
    self.inner.lock().state.clone()
  }

  pub fn current_worker(&self) -> Option<String> {
    self.inner.lock().current_worker.clone()
  }

  fn status(&self) -> JibriStatus {
    let inner = self.inner.lock();
    JibriStatus {
      session_id: self.id.clone(),
      mode: self.mode,
      state: inner.state.as_str().to_owned(),
      failure_reason: match &inner.state {
        JibriSessionState::Off { failure } => failure.clone(),
        _ => None,
      },
    }
  }

  fn start_request(&self) -> JibriStartRequest {
    JibriStartRequest {
      session_id: self.id.clone(),
      room: self.room.clone(),
      mode: self.mode,
      stream_id: self.stream_id.clone(),
      sip_address: self.sip_address.clone(),
      app_data: self.app_data.clone(),
    }
  }
}

fn capability_for_mode(mode: JibriMode) -> WorkerCapability {
  match mode {
    JibriMode::File | JibriMode::Stream => WorkerCapability::Recording,
    JibriMode::SipCall => WorkerCapability::Sip,
  }
}

/// Per-conference manager for recording/streaming/SIP sessions: selects a
/// worker, drives the pending state, and fails over to another worker when
/// one reports a retryable failure or times out.
pub struct JibriManager {
  room: String,
  pool: Arc<WorkerPool>,
  rpc: Arc<dyn WorkerRpc>,
  config: Arc<FocusConfig>,
  events: mpsc::Sender<FocusEvent>,
  sessions: Mutex<HashMap<String, Arc<JibriSession>>>,
}

impl JibriManager {
  pub fn new(
    room: String,
    pool: Arc<WorkerPool>,
    rpc: Arc<dyn WorkerRpc>,
    config: Arc<FocusConfig>,
    events: mpsc::Sender<FocusEvent>,
  ) -> Self {
    Self {
      room,
      pool,
      rpc,
      config,
      events,
      sessions: Mutex::new(HashMap::new()),
    }
  }

  pub fn session(&self, session_id: &str) -> Option<Arc<JibriSession>> {
    self.sessions.lock().get(session_id).cloned()
  }

  pub fn active_session_count(&self) -> usize {
    self.sessions.lock().len()
  }

  async fn emit(&self, status: JibriStatus) {
    let _ = self
      .events
      .send(FocusEvent {
        room: self.room.clone(),
        event: ConferenceEvent::JibriStateChanged { status },
      })
      .await;
  }

  /// Create a session and drive it to pending on some worker.
  pub async fn start(
    self: &Arc<Self>,
    mode: JibriMode,
    initiator: String,
    stream_id: Option<String>,
    sip_address: Option<String>,
    app_data: Option<Value>,
    preferred_regions: Vec<String>,
  ) -> Result<JibriStatus, JibriError> {
    let session = Arc::new(JibriSession {
      id: generate_id(),
      mode,
      room: self.room.clone(),
      initiator,
      stream_id,
      sip_address,
      app_data,
      inner: Mutex::new(SessionInner {
        state: JibriSessionState::Undefined,
        current_worker: None,
        retries_left: self.config.jibri_retries,
        attempted: HashSet::new(),
        timer_generation: 0,
        terminator: None,
      }),
    });
    self
      .sessions
      .lock()
      .insert(session.id().to_owned(), session.clone());

    match self.try_start(&session, &preferred_regions).await {
      Ok(()) => {
        let status = session.status();
        self.emit(status.clone()).await;
        Ok(status)
      },
      Err(e) => {
        self.sessions.lock().remove(session.id());
        Err(e)
      },
    }
  }

  /// Select a worker (excluding everyone already attempted) and send the
  /// start request, burning one retry per failed attempt.
  async fn try_start(
    self: &Arc<Self>,
    session: &Arc<JibriSession>,
    preferred_regions: &[String],
  ) -> Result<(), JibriError> {
    let capability = capability_for_mode(session.mode);
    let mut saw_busy = false;
    loop {
      let worker = {
        let mut inner = session.inner.lock();
        let worker = self
          .pool
          .select_worker(&inner.attempted, preferred_regions, capability);
        if let Some(worker) = &worker {
          inner.attempted.insert(worker.jid().to_owned());
          inner.current_worker = Some(worker.jid().to_owned());
        }
        worker
      };
      let worker = match worker {
        Some(worker) => worker,
        None if self.pool.is_empty() => return Err(JibriError::NotAvailable),
        None if saw_busy => return Err(JibriError::AllBusy),
        None => return Err(JibriError::NotAvailable),
      };

      debug!(session = %session.id(), worker = %worker.jid(), "sending worker start");
      let result = timeout(
        self.config.worker_request_timeout,
        self.rpc.send_start(worker.jid(), &session.start_request()),
      )
      .await
      .unwrap_or(Err(JibriError::Timeout));

      match result {
        Ok(()) => {
          let generation = {
            let mut inner = session.inner.lock();
            inner.state = JibriSessionState::Pending;
            inner.timer_generation += 1;
            inner.timer_generation
          };
          self.spawn_pending_timer(session.clone(), generation);
          return Ok(());
        },
        Err(e) => {
          warn!(session = %session.id(), worker = %worker.jid(), error = %e, "worker start failed");
          if e == JibriError::OneBusy {
            saw_busy = true;
          }
          let can_retry = {
            let mut inner = session.inner.lock();
            if inner.retries_left > 0 {
              inner.retries_left -= 1;
              true
            }
            else {
              false
            }
          };
          if !can_retry {
            return Err(if saw_busy && e == JibriError::OneBusy {
              JibriError::AllBusy
            }
            else {
              e
            });
          }
        },
      }
    }
  }

  fn spawn_pending_timer(self: &Arc<Self>, session: Arc<JibriSession>, generation: u64) {
    let manager = self.clone();
    let pending_timeout = self.config.jibri_pending_timeout;
    tokio::spawn(async move {
      tokio::time::sleep(pending_timeout).await;
      manager.on_pending_timeout(session, generation).await;
    });
  }

  /// The pending state never resolved. Takes the same failover path as an
  /// explicit retryable failure.
  async fn on_pending_timeout(self: Arc<Self>, session: Arc<JibriSession>, generation: u64) {
    let worker = {
      let inner = session.inner.lock();
      if inner.state != JibriSessionState::Pending || inner.timer_generation != generation {
        return;
      }
      inner.current_worker.clone()
    };
    warn!(session = %session.id(), "worker session stuck in pending");
    if let Some(worker) = worker {
      let _ = timeout(
        self.config.worker_request_timeout,
        self.rpc.send_stop(&worker, session.id()),
      )
      .await;
    }
    self
      .fail_over(&session, Some("pending timeout".to_owned()), true)
      .await;
  }

  /// An asynchronous state notification from a worker, correlated by the
  /// session id it echoes.
  pub async fn on_worker_event(
    self: &Arc<Self>,
    session_id: &str,
    on: bool,
    failure: Option<String>,
    should_retry: bool,
  ) {
    let session = match self.session(session_id) {
      Some(session) => session,
      None => {
        debug!(session = %session_id, "event for unknown worker session");
        return;
      },
    };
    if on {
      {
        let mut inner = session.inner.lock();
        inner.state = JibriSessionState::On;
        inner.timer_generation += 1;
      }
      info!(session = %session_id, "worker session is on");
      self.emit(session.status()).await;
    }
    else {
      self.fail_over(&session, failure, should_retry).await;
    }
  }

  /// Move to another worker if the failure is retryable and budget remains;
  /// otherwise report the session off.
  async fn fail_over(self: &Arc<Self>, session: &Arc<JibriSession>, failure: Option<String>, should_retry: bool) {
    let retry = {
      let mut inner = session.inner.lock();
      if matches!(inner.state, JibriSessionState::Off { .. }) {
        return;
      }
      inner.timer_generation += 1;
      let retry = should_retry && failure.is_some() && inner.retries_left > 0;
      if retry {
        inner.retries_left -= 1;
        inner.state = JibriSessionState::Undefined;
        inner.current_worker = None;
      }
      else {
        inner.state = JibriSessionState::Off {
          failure: failure.clone(),
        };
      }
      retry
    };

    if retry {
      info!(session = %session.id(), "retrying worker session on another worker");
      if self.try_start(session, &[]).await.is_err() {
        let mut inner = session.inner.lock();
        inner.state = JibriSessionState::Off {
          failure: Some("no more workers".to_owned()),
        };
        drop(inner);
        self.finish(session).await;
      }
      else {
        self.emit(session.status()).await;
      }
    }
    else {
      self.finish(session).await;
    }
  }

  /// Emit the final off state; a session never vanishes silently.
  async fn finish(&self, session: &Arc<JibriSession>) {
    self.emit(session.status()).await;
    self.sessions.lock().remove(session.id());
  }

  /// Stop is idempotent; stopping a session that is already off (or gone)
  /// is a no-op.
  pub async fn stop(self: &Arc<Self>, session_id: &str, terminator: String) -> JibriStatus {
    let session = match self.session(session_id) {
      Some(session) => session,
      None => {
        return JibriStatus {
          session_id: session_id.to_owned(),
          mode: JibriMode::File,
          state: "off".to_owned(),
          failure_reason: None,
        }
      },
    };
    let worker = {
      let mut inner = session.inner.lock();
      if matches!(inner.state, JibriSessionState::Off { .. }) {
        return session.status();
      }
      inner.terminator = Some(terminator);
      inner.timer_generation += 1;
      inner.state = JibriSessionState::Off { failure: None };
      inner.current_worker.take()
    };
    if let Some(worker) = worker {
      let _ = timeout(
        self.config.worker_request_timeout,
        self.rpc.send_stop(&worker, session.id()),
      )
      .await;
    }
    let status = session.status();
    self.finish(&session).await;
    status
  }
}

/// Point-in-time dial-out counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct DialOutCounters {
  pub retries: u64,
  pub single_instance_errors: u64,
  pub single_instance_timeouts: u64,
  pub accepted_requests: u64,
}

/// Fans a dial-out request across gateway workers until one takes it.
pub struct JigasiManager {
  pool: Arc<WorkerPool>,
  rpc: Arc<dyn WorkerRpc>,
  config: Arc<FocusConfig>,
  retries: AtomicU64,
  single_instance_errors: AtomicU64,
  single_instance_timeouts: AtomicU64,
  accepted_requests: AtomicU64,
}

impl JigasiManager {
  pub fn new(pool: Arc<WorkerPool>, rpc: Arc<dyn WorkerRpc>, config: Arc<FocusConfig>) -> Self {
    Self {
      pool,
      rpc,
      config,
      retries: AtomicU64::new(0),
      single_instance_errors: AtomicU64::new(0),
      single_instance_timeouts: AtomicU64::new(0),
      accepted_requests: AtomicU64::new(0),
    }
  }

  pub fn counters(&self) -> DialOutCounters {
    DialOutCounters {
      retries: self.retries.load(Ordering::Relaxed),
      single_instance_errors: self.single_instance_errors.load(Ordering::Relaxed),
      single_instance_timeouts: self.single_instance_timeouts.load(Ordering::Relaxed),
      accepted_requests: self.accepted_requests.load(Ordering::Relaxed),
    }
  }

  /// Forward the request to a gateway, retrying on other gateways on error
  /// or timeout. The caller has already checked authorization.
  pub async fn dial_out(
    &self,
    request: &DialRequest,
    capability: WorkerCapability,
    preferred_regions: &[String],
  ) -> Result<DialResponse, RequestError> {
    let mut exclude = HashSet::new();
    let mut last_was_timeout = false;
    for attempt in 0..=self.config.dial_out_retries {
      let worker = match self
        .pool
        .select_worker(&exclude, preferred_regions, capability)
      {
        Some(worker) => worker,
        None => break,
      };
      if attempt > 0 {
        self.retries.fetch_add(1, Ordering::Relaxed);
      }
      exclude.insert(worker.jid().to_owned());
      let session_id = generate_id();
      debug!(worker = %worker.jid(), destination = %request.destination, "dialing out");
      match timeout(
        self.config.dial_out_timeout,
        self.rpc.dial(worker.jid(), &session_id, request),
      )
      .await
      {
        Err(_) => {
          warn!(worker = %worker.jid(), "dial-out timed out");
          self.single_instance_timeouts.fetch_add(1, Ordering::Relaxed);
          last_was_timeout = true;
        },
        Ok(Err(e)) => {
          warn!(worker = %worker.jid(), error = %e, "dial-out failed");
          self.single_instance_errors.fetch_add(1, Ordering::Relaxed);
          last_was_timeout = e == JibriError::Timeout;
        },
        Ok(Ok(response)) => {
          self.accepted_requests.fetch_add(1, Ordering::Relaxed);
          return Ok(response);
        },
      }
    }
    if exclude.is_empty() {
      return Err(RequestError::ServiceUnavailable("no gateway available".to_owned()));
    }
    Err(if last_was_timeout {
      RequestError::RemoteServerTimeout
    }
    else {
      RequestError::UndefinedCondition("dial-out failed on every gateway".to_owned())
    })
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::worker::WorkerStats;

  /// Scripted worker behaviors, keyed by worker jid.
  #[derive(Default)]
  struct ScriptedRpc {
    errors: HashSet<String>,
    busy: HashSet<String>,
    hangs: HashSet<String>,
  }

  #[async_trait]
  impl WorkerRpc for ScriptedRpc {
    async fn send_start(&self, worker: &str, _request: &JibriStartRequest) -> Result<(), JibriError> {
      if self.hangs.contains(worker) {
        tokio::time::sleep(Duration::from_secs(3600)).await;
      }
      if self.errors.contains(worker) {
        return Err(JibriError::InternalServerError("boom".to_owned()));
      }
      if self.busy.contains(worker) {
        return Err(JibriError::OneBusy);
      }
      Ok(())
    }

    async fn send_stop(&self, _worker: &str, _session_id: &str) -> Result<(), JibriError> {
      Ok(())
    }

    async fn dial(
      &self,
      worker: &str,
      session_id: &str,
      _request: &DialRequest,
    ) -> Result<DialResponse, JibriError> {
      if self.hangs.contains(worker) {
        tokio::time::sleep(Duration::from_secs(3600)).await;
      }
      if self.errors.contains(worker) {
        return Err(JibriError::InternalServerError("boom".to_owned()));
      }
      Ok(DialResponse {
        session_id: session_id.to_owned(),
        gateway: worker.to_owned(),
      })
    }
  }

  fn pool_of(config: &Arc<FocusConfig>, jids: &[&str]) -> Arc<WorkerPool> {
    let pool = Arc::new(WorkerPool::new(config.clone()));
    for jid in jids {
      pool.on_worker_status(
        jid,
        &WorkerStats {
          supports_sip: Some(true),
          ..Default::default()
        },
      );
    }
    pool
  }

  fn test_config() -> Arc<FocusConfig> {
    Arc::new(FocusConfig {
      worker_request_timeout: Duration::from_millis(50),
      dial_out_timeout: Duration::from_millis(50),
      jibri_pending_timeout: Duration::from_millis(50),
      ..Default::default()
    })
  }

  #[tokio::test]
  async fn dial_out_retries_across_workers() {
    let config = test_config();
    let pool = pool_of(&config, &["w1", "w2", "w3"]);
    // w1 fails outright, w2 hangs past the timeout, w3 answers.
    let rpc = Arc::new(ScriptedRpc {
      errors: ["w1".to_owned()].into(),
      hangs: ["w2".to_owned()].into(),
      ..Default::default()
    });
    // Make selection deterministic: w1 least loaded, then w2, then w3.
    pool.on_worker_status("w1", &WorkerStats { participant_count: Some(0), ..Default::default() });
    pool.on_worker_status("w2", &WorkerStats { participant_count: Some(1), ..Default::default() });
    pool.on_worker_status("w3", &WorkerStats { participant_count: Some(2), ..Default::default() });

    let manager = JigasiManager::new(pool, rpc, config);
    let request = DialRequest {
      room: "room@muc".to_owned(),
      destination: "+15551234".to_owned(),
      headers: HashMap::new(),
    };
    let response = manager
      .dial_out(&request, WorkerCapability::Sip, &[])
      .await
      .unwrap();
    assert_eq!(response.gateway, "w3");
    assert_eq!(
      manager.counters(),
      DialOutCounters {
        retries: 2,
        single_instance_errors: 1,
        single_instance_timeouts: 1,
        accepted_requests: 1,
      }
    );
  }

  #[tokio::test]
  async fn dial_out_with_no_workers_is_service_unavailable() {
    let config = test_config();
    let pool = Arc::new(WorkerPool::new(config.clone()));
    let manager = JigasiManager::new(pool, Arc::new(ScriptedRpc::default()), config);
    let request = DialRequest {
      room: "room@muc".to_owned(),
      destination: "+15551234".to_owned(),
      headers: HashMap::new(),
    };
    assert!(matches!(
      manager
        .dial_out(&request, WorkerCapability::Sip, &[])
        .await
        .unwrap_err(),
      RequestError::ServiceUnavailable(_)
    ));
  }

  #[tokio::test]
  async fn dial_out_timeout_everywhere_is_remote_server_timeout() {
    let config = test_config();
    let pool = pool_of(&config, &["w1", "w2", "w3"]);
    let rpc = Arc::new(ScriptedRpc {
      hangs: ["w1".to_owned(), "w2".to_owned(), "w3".to_owned()].into(),
      ..Default::default()
    });
    let manager = JigasiManager::new(pool, rpc, config);
    let request = DialRequest {
      room: "room@muc".to_owned(),
      destination: "+15551234".to_owned(),
      headers: HashMap::new(),
    };
    assert_eq!(
      manager
        .dial_out(&request, WorkerCapability::Sip, &[])
        .await
        .unwrap_err(),
      RequestError::RemoteServerTimeout
    );
  }

  fn jibri_manager(
    config: Arc<FocusConfig>,
    pool: Arc<WorkerPool>,
    rpc: Arc<dyn WorkerRpc>,
  ) -> (Arc<JibriManager>, mpsc::Receiver<FocusEvent>) {
    let (tx, rx) = mpsc::channel(16);
    (
      Arc::new(JibriManager::new(
        "room@muc".to_owned(),
        pool,
        rpc,
        config,
        tx,
      )),
      rx,
    )
  }

  #[tokio::test]
  async fn start_goes_pending_then_on() {
    let config = test_config();
    let pool = pool_of(&config, &["j1"]);
    let (manager, mut rx) = jibri_manager(config, pool, Arc::new(ScriptedRpc::default()));
    let status = manager
      .start(JibriMode::File, "user1".to_owned(), None, None, None, vec![])
      .await
      .unwrap();
    assert_eq!(status.state, "pending");

    manager.on_worker_event(&status.session_id, true, None, false).await;
    let session = manager.session(&status.session_id).unwrap();
    assert_eq!(session.state(), JibriSessionState::On);

    // Both state changes were emitted.
    assert_eq!(rx.recv().await.unwrap().room, "room@muc");
    let on_event = rx.recv().await.unwrap();
    match on_event.event {
      ConferenceEvent::JibriStateChanged { status } => assert_eq!(status.state, "on"),
      other => panic!("unexpected event: {other:?}"),
    }
  }

  #[tokio::test]
  async fn retryable_failure_moves_to_another_worker() {
    let config = test_config();
    let pool = pool_of(&config, &["j1", "j2"]);
    pool.on_worker_status("j1", &WorkerStats { participant_count: Some(0), ..Default::default() });
    pool.on_worker_status("j2", &WorkerStats { participant_count: Some(1), ..Default::default() });
    let (manager, _rx) = jibri_manager(config, pool, Arc::new(ScriptedRpc::default()));
    let status = manager
      .start(JibriMode::File, "user1".to_owned(), None, None, None, vec![])
      .await
      .unwrap();
    let session = manager.session(&status.session_id).unwrap();
    assert_eq!(session.current_worker().as_deref(), Some("j1"));

    manager
      .on_worker_event(&status.session_id, false, Some("disk full".to_owned()), true)
      .await;
    let session = manager.session(&status.session_id).unwrap();
    assert_eq!(session.state(), JibriSessionState::Pending);
    assert_eq!(session.current_worker().as_deref(), Some("j2"));
  }

  #[tokio::test]
  async fn non_retryable_failure_reports_off() {
    let config = test_config();
    let pool = pool_of(&config, &["j1"]);
    let (manager, mut rx) = jibri_manager(config, pool, Arc::new(ScriptedRpc::default()));
    let status = manager
      .start(JibriMode::File, "user1".to_owned(), None, None, None, vec![])
      .await
      .unwrap();
    let _pending = rx.recv().await.unwrap();

    manager
      .on_worker_event(&status.session_id, false, Some("fatal".to_owned()), false)
      .await;
    let final_event = rx.recv().await.unwrap();
    match final_event.event {
      ConferenceEvent::JibriStateChanged { status } => {
        assert_eq!(status.state, "off");
        assert_eq!(status.failure_reason.as_deref(), Some("fatal"));
      },
      other => panic!("unexpected event: {other:?}"),
    }
    assert!(manager.session(&status.session_id).is_none());
  }

  #[tokio::test]
  async fn pending_timeout_fails_over() {
    let config = test_config();
    let pool = pool_of(&config, &["j1"]);
    let (manager, mut rx) = jibri_manager(config, pool, Arc::new(ScriptedRpc::default()));
    let status = manager
      .start(JibriMode::File, "user1".to_owned(), None, None, None, vec![])
      .await
      .unwrap();
    let _pending = rx.recv().await.unwrap();

    // No worker event arrives; the pending timer fires and, with only one
    // worker in the pool, the session ends up off.
    let final_event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
      .await
      .unwrap()
      .unwrap();
    match final_event.event {
      ConferenceEvent::JibriStateChanged { status } => assert_eq!(status.state, "off"),
      other => panic!("unexpected event: {other:?}"),
    }
    assert!(manager.session(&status.session_id).is_none());
  }

  #[tokio::test]
  async fn stop_is_idempotent() {
    let config = test_config();
    let pool = pool_of(&config, &["j1"]);
    let (manager, _rx) = jibri_manager(config, pool, Arc::new(ScriptedRpc::default()));
    let status = manager
      .start(JibriMode::File, "user1".to_owned(), None, None, None, vec![])
      .await
      .unwrap();

    let stopped = manager.stop(&status.session_id, "user1".to_owned()).await;
    assert_eq!(stopped.state, "off");
    // A second stop of the same (now gone) session is a quiet no-op.
    let again = manager.stop(&status.session_id, "user1".to_owned()).await;
    assert_eq!(again.state, "off");
  }
}
