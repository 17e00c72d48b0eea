//! Observer sessions, their routes, and route lookup

use crate::config::{ConfigProtocol, ProxyConfig};
use crate::flow::{Batch, FlowWindow};
use crate::message::CaptureMessage;
use crate::server::ServerHandle;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Session holding the persisted routes while no observer is connected
pub const CACHE_SESSION: &str = "cache";

/// Outgoing batches of one observer
pub type Outbox = UnboundedSender<Batch<CaptureMessage>>;

/// A connected observer, or the cache session.
pub struct ObserverSession {
  id: String,
  configs: RwLock<Arc<Vec<ProxyConfig>>>,
  outbox: Option<Outbox>,
  window: Mutex<FlowWindow<CaptureMessage>>,
  servers: Mutex<Vec<ServerHandle>>,
}

impl ObserverSession {
  /// Session identifier
  pub fn id(&self) -> &str {
    &self.id
  }

  /// Current routes
  pub fn configs(&self) -> Arc<Vec<ProxyConfig>> {
    self.configs.read().clone()
  }

  /// Hand a listener to the session; it is shut down with the session.
  pub fn adopt_server(&self, server: ServerHandle) {
    self.servers.lock().push(server);
  }

  /// Stop every listener the session owns
  pub async fn shutdown_servers(&self) {
    let servers: Vec<ServerHandle> = std::mem::take(&mut *self.servers.lock());
    for server in servers {
      server.shutdown().await;
    }
  }

  fn deliver(&self, message: CaptureMessage) -> bool {
    let Some(outbox) = &self.outbox else {
      return false;
    };
    // Sending under the window lock keeps batches in cut order.
    let mut window = self.window.lock();
    if let Some(batch) = window.emit([message]) {
      if outbox.send(batch).is_err() {
        tracing::debug!("[CHANNEL] Session {} outbox closed", self.id);
      }
    }
    true
  }

  fn acknowledge(&self, batch_id: u64) {
    let mut window = self.window.lock();
    if let Some(batch) = window.on_acknowledge(batch_id) {
      if let Some(outbox) = &self.outbox {
        if outbox.send(batch).is_err() {
          tracing::debug!("[CHANNEL] Session {} outbox closed", self.id);
        }
      }
    }
  }
}

/// Every active session, keyed by identifier.
pub struct SessionRegistry {
  sessions: DashMap<String, Arc<ObserverSession>>,
  patterns: DashMap<String, Option<Regex>>,
  window_size: usize,
  max_outstanding: usize,
}

impl SessionRegistry {
  /// Empty registry whose sessions get the given flow-control limits
  pub fn new(window_size: usize, max_outstanding: usize) -> Self {
    Self {
      sessions: DashMap::new(),
      patterns: DashMap::new(),
      window_size,
      max_outstanding,
    }
  }

  /// Install `configs` for session `id`, creating the session if needed.
  ///
  /// An existing session keeps its outbox and flow-control state; only its
  /// routes are replaced. When an observer (a session with an outbox) activates,
  /// the cache session is retired.
  pub async fn activate(
    &self,
    id: &str,
    configs: Vec<ProxyConfig>,
    outbox: Option<Outbox>,
  ) -> Arc<ObserverSession> {
    let retire_cache = outbox.is_some() && id != CACHE_SESSION;
    let session = match self.sessions.get(id) {
      Some(existing) => {
        *existing.configs.write() = Arc::new(configs);
        existing.clone()
      }
      None => {
        let session = Arc::new(ObserverSession {
          id: id.to_string(),
          configs: RwLock::new(Arc::new(configs)),
          outbox,
          window: Mutex::new(FlowWindow::new(self.window_size, self.max_outstanding)),
          servers: Mutex::new(Vec::new()),
        });
        self.sessions.insert(id.to_string(), session.clone());
        session
      }
    };
    tracing::info!(
      "[CHANNEL] Session {} activated with {} route(s)",
      id,
      session.configs.read().len()
    );

    if retire_cache {
      self.remove(CACHE_SESSION).await;
    }
    session
  }

  /// Drop session `id` and stop the listeners it owns
  pub async fn remove(&self, id: &str) -> bool {
    match self.sessions.remove(id) {
      Some((_, session)) => {
        session.shutdown_servers().await;
        tracing::info!("[CHANNEL] Session {} removed", id);
        true
      }
      None => false,
    }
  }

  /// Session by identifier
  pub fn get(&self, id: &str) -> Option<Arc<ObserverSession>> {
    self.sessions.get(id).map(|s| s.clone())
  }

  /// Number of active sessions
  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  /// No session is active
  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }

  /// Route for a request, across every session.
  ///
  /// Only `http:` and `browser:` routes qualify, and `browser:` routes only
  /// for forward proxy traffic. A route matches the request path or
  /// `client_label + path`. The longest matching pattern wins.
  pub fn find_match(
    &self,
    is_secure: bool,
    client_label: &str,
    path: &str,
    is_forward: bool,
  ) -> Option<ProxyConfig> {
    let path = collapse_slashes(path);
    let labelled = format!("{}{}", client_label, path);
    let mut best: Option<ProxyConfig> = None;

    for entry in self.sessions.iter() {
      let configs = entry.value().configs();
      for config in configs.iter() {
        if !matches!(config.protocol, ConfigProtocol::Http | ConfigProtocol::Browser) {
          continue;
        }
        if is_forward != (config.protocol == ConfigProtocol::Browser) {
          continue;
        }
        if !(self.is_match(&config.path, &path) || self.is_match(&config.path, &labelled)) {
          continue;
        }
        if best
          .as_ref()
          .map_or(true, |b| config.path.len() > b.path.len())
        {
          best = Some(config.clone());
        }
      }
    }
    tracing::trace!(
      "[MITM] Route for {} (secure={}, forward={}): {:?}",
      path,
      is_secure,
      is_forward,
      best.as_ref().map(|c| c.path.as_str())
    );
    best
  }

  /// Offer `message` to every session recording its route.
  ///
  /// Each session receives it at most once, labelled with that session's own
  /// copy of the route. Returns the number of observers it was handed to.
  pub fn emit(&self, message: &CaptureMessage) -> usize {
    let route = &message.proxy_config;
    let mut delivered = 0;
    for entry in self.sessions.iter() {
      let session = entry.value();
      let configs = session.configs();
      let Some(config) = configs
        .iter()
        .find(|c| c.path == route.path && c.protocol == route.protocol && c.recording)
      else {
        continue;
      };
      let mut copy = message.clone();
      copy.proxy_config = config.clone();
      if session.deliver(copy) {
        delivered += 1;
      }
    }
    delivered
  }

  /// Credit back batch `batch_id` of session `id`
  pub fn acknowledge(&self, id: &str, batch_id: u64) -> bool {
    match self.get(id) {
      Some(session) => {
        session.acknowledge(batch_id);
        true
      }
      None => false,
    }
  }

  fn is_match(&self, pattern: &str, candidate: &str) -> bool {
    if !pattern.contains(".*") {
      return candidate.starts_with(pattern);
    }
    let compiled = self
      .patterns
      .entry(pattern.to_string())
      .or_insert_with(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
          tracing::warn!("[MITM] Ignoring invalid route pattern {}: {}", pattern, e);
          None
        }
      })
      .clone();
    compiled.is_some_and(|re| re.is_match(candidate))
  }
}

/// Collapse every run of `/` into a single one
pub fn collapse_slashes(path: &str) -> String {
  let mut out = String::with_capacity(path.len());
  let mut previous_slash = false;
  for c in path.chars() {
    if c == '/' && previous_slash {
      continue;
    }
    previous_slash = c == '/';
    out.push(c);
  }
  out
}
