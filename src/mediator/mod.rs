//! Network mediator: serves intercepted GET requests from cache or network.
//!
//! The mediator owns two cache partitions per version and moves through a
//! small lifecycle:
//!
//! ```text
//! installing -> waiting -> active -> superseded
//! ```
//!
//! `install` fills the precache from the manifest and always skips waiting,
//! so `activate` may run immediately after. Activation deletes every
//! partition that does not belong to the current version and claims clients.
//! Only an active mediator intercepts requests.

mod fetch;
mod request;
mod route;
mod tasks;

pub use fetch::{Fetcher, HttpFetcher};
pub use request::{cache_key, Request, RequestMode, Response, SERVICE_UNAVAILABLE};
pub use route::{RouteTable, Strategy};
pub use tasks::BackgroundTasks;

use futures::future::join_all;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, CachedResponse, Partition, ServedResponse};
use crate::error::{FetchError, InstallError};

/// Assets precached when no manifest is configured.
pub const DEFAULT_MANIFEST: &[&str] = &["/", "/index.html", "/manifest.json"];

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for one worker version.
#[derive(Debug, Clone)]
pub struct MediatorConfig {
  pub origin: Url,
  pub prefix: String,
  pub version: String,
  /// Root-relative paths stored at install time
  pub precache: Vec<String>,
  pub routes: RouteTable,
  /// Upper bound on every live fetch
  pub fetch_timeout: Duration,
  /// Root document served to offline navigations
  pub app_shell: String,
}

impl MediatorConfig {
  pub fn new(origin: Url) -> Self {
    Self {
      origin,
      prefix: "invoice-app".to_string(),
      version: "v1".to_string(),
      precache: DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect(),
      routes: RouteTable::default(),
      fetch_timeout: DEFAULT_FETCH_TIMEOUT,
      app_shell: "/".to_string(),
    }
  }

  pub fn with_version(mut self, version: &str) -> Self {
    self.version = version.to_string();
    self
  }

  pub fn partition_name(&self, partition: Partition) -> String {
    format!("{}-{}-{}", self.prefix, partition, self.version)
  }

  pub fn precache_name(&self) -> String {
    self.partition_name(Partition::Precache)
  }

  pub fn runtime_name(&self) -> String {
    self.partition_name(Partition::Runtime)
  }

  fn is_manifest_url(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin() && self.precache.iter().any(|p| p == url.path())
  }
}

/// Lifecycle of a mediator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  Waiting,
  Active,
  Superseded,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::Waiting => write!(f, "waiting"),
      WorkerState::Active => write!(f, "active"),
      WorkerState::Superseded => write!(f, "superseded"),
    }
  }
}

/// Serves intercepted requests using the strategy their URL classifies to.
pub struct NetworkMediator<S: CacheStorage, F: Fetcher> {
  config: MediatorConfig,
  storage: Arc<S>,
  fetcher: Arc<F>,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
  clients_claimed: AtomicBool,
  tasks: BackgroundTasks,
}

impl<S: CacheStorage, F: Fetcher> NetworkMediator<S, F> {
  pub fn new(config: MediatorConfig, storage: S, fetcher: F) -> Self {
    Self {
      config,
      storage: Arc::new(storage),
      fetcher: Arc::new(fetcher),
      state: Mutex::new(WorkerState::Installing),
      skip_waiting: AtomicBool::new(false),
      clients_claimed: AtomicBool::new(false),
      tasks: BackgroundTasks::new(),
    }
  }

  pub fn config(&self) -> &MediatorConfig {
    &self.config
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Background revalidations spawned by the strategies.
  pub fn tasks(&self) -> &BackgroundTasks {
    &self.tasks
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let previous = *current;
    debug!(from = %previous, to = %state, "Worker state change");
    *current = state;
  }

  pub fn is_active(&self) -> bool {
    self.state() == WorkerState::Active
  }

  /// Whether this instance has taken control of open clients.
  pub fn controls_clients(&self) -> bool {
    self.clients_claimed.load(Ordering::SeqCst)
  }

  /// Re-enter the active state when this version was installed by an
  /// earlier process. Returns whether the mediator is now active.
  ///
  /// The earlier process may have stopped after `install`, so the activation
  /// purge runs again before the mediator takes over.
  pub fn resume(&self) -> Result<bool, InstallError> {
    let precache = self.config.precache_name();
    if self.storage.partition_names()?.contains(&precache) {
      self.purge_outdated()?;
      self.set_state(WorkerState::Active);
      self.clients_claimed.store(true, Ordering::SeqCst);
      info!(version = %self.config.version, "Resumed active worker");
      return Ok(true);
    }
    Ok(false)
  }

  /// Fetch every manifest asset and store them in the precache partition.
  ///
  /// All assets are fetched before anything is written, so a failed install
  /// leaves the previous version's partitions as they were.
  pub async fn install(&self) -> Result<(), InstallError> {
    let state = self.state();
    if state != WorkerState::Installing {
      return Err(InstallError::InvalidState {
        expected: "installing",
        actual: state,
      });
    }

    let mut requests = Vec::with_capacity(self.config.precache.len());
    for path in &self.config.precache {
      let url = self
        .config
        .origin
        .join(path)
        .map_err(|e| InstallError::InvalidPath {
          path: path.clone(),
          reason: e.to_string(),
        })?;
      requests.push((path.clone(), Request::get(url)));
    }

    info!(
      version = %self.config.version,
      assets = requests.len(),
      "Installing precache"
    );

    let fetches = requests
      .iter()
      .map(|(_, request)| fetch_bounded(&*self.fetcher, request, self.config.fetch_timeout));
    let results = join_all(fetches).await;

    let mut fetched = Vec::with_capacity(results.len());
    for ((path, request), result) in requests.into_iter().zip(results) {
      let response = result.map_err(|source| InstallError::Fetch {
        path: path.clone(),
        source,
      })?;
      if !response.is_success() {
        return Err(InstallError::BadStatus {
          path,
          status: response.status,
        });
      }
      fetched.push((request, response));
    }

    let precache = self.config.precache_name();
    self.storage.ensure_partition(&precache)?;
    for (request, response) in &fetched {
      self
        .storage
        .put(&precache, &request.cache_key(), request.url.as_str(), response)?;
    }

    self.skip_waiting.store(true, Ordering::SeqCst);
    self.set_state(WorkerState::Waiting);
    info!(partition = %precache, "Precache installed");
    Ok(())
  }

  /// Delete every partition not owned by this version, then claim clients.
  /// Returns the names of the deleted partitions.
  pub async fn activate(&self) -> Result<Vec<String>, InstallError> {
    let state = self.state();
    if state != WorkerState::Waiting || !self.skip_waiting.load(Ordering::SeqCst) {
      return Err(InstallError::InvalidState {
        expected: "waiting",
        actual: state,
      });
    }

    let deleted = self.purge_outdated()?;
    self.set_state(WorkerState::Active);
    self.clients_claimed.store(true, Ordering::SeqCst);
    info!(version = %self.config.version, "Worker activated");
    Ok(deleted)
  }

  /// Delete every partition but this version's pair and make sure the
  /// runtime partition exists. Returns the deleted names.
  fn purge_outdated(&self) -> Result<Vec<String>, InstallError> {
    let keep = [self.config.precache_name(), self.config.runtime_name()];
    let mut deleted = Vec::new();
    for name in self.storage.partition_names()? {
      if !keep.contains(&name) {
        self.storage.delete_partition(&name)?;
        info!(partition = %name, "Deleted outdated cache partition");
        deleted.push(name);
      }
    }
    self.storage.ensure_partition(&keep[1])?;
    Ok(deleted)
  }

  /// Mark this instance as replaced by a newer version.
  pub fn retire(&self) {
    self.set_state(WorkerState::Superseded);
    self.clients_claimed.store(false, Ordering::SeqCst);
  }

  /// Classify a request, or `None` if it is not intercepted.
  pub fn route(&self, request: &Request) -> Option<Strategy> {
    if !self.config.routes.intercepts(&self.config.origin, request) {
      return None;
    }
    Some(self.config.routes.classify(request.url.path()))
  }

  /// Serve a request.
  ///
  /// Intercepted requests always get a response: strategy failures end in
  /// the offline fallback. Requests that are not intercepted (or reach an
  /// inactive worker) are fetched untouched and may fail.
  pub async fn handle(&self, request: &Request) -> Result<ServedResponse, FetchError> {
    let strategy = match self.route(request) {
      Some(strategy) if self.is_active() => strategy,
      _ => {
        let response = self.fetcher.fetch(request).await?;
        return Ok(ServedResponse::passthrough(response));
      }
    };

    debug!(url = %request.url, %strategy, "Handling request");
    let result = match strategy {
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    };

    match result {
      Ok(served) => Ok(served),
      Err(e) => {
        warn!(url = %request.url, %strategy, error = %e, "Serving offline fallback");
        Ok(self.fallback(request))
      }
    }
  }

  /// Live fetch first, cached copy if the network fails.
  pub async fn network_first(&self, request: &Request) -> Result<ServedResponse, FetchError> {
    match fetch_bounded(&*self.fetcher, request, self.config.fetch_timeout).await {
      Ok(response) => {
        store(&*self.storage, &self.config.runtime_name(), request, &response);
        Ok(ServedResponse::from_network(response))
      }
      Err(e) => match self.lookup(request) {
        Some(cached) => {
          debug!(url = %request.url, error = %e, "Network failed, serving cache");
          Ok(ServedResponse::from_cache(cached))
        }
        None => Err(e),
      },
    }
  }

  /// Cached copy immediately with a background refresh, network on a miss.
  pub async fn cache_first(&self, request: &Request) -> Result<ServedResponse, FetchError> {
    let partition = self.partition_for(request);

    if let Some(cached) = self.lookup(request) {
      let storage = Arc::clone(&self.storage);
      let fetcher = Arc::clone(&self.fetcher);
      let timeout = self.config.fetch_timeout;
      let request = request.clone();

      self
        .tasks
        .spawn(format!("revalidate {}", request.url), async move {
          let response = fetch_bounded(&*fetcher, &request, timeout).await?;
          store(&*storage, &partition, &request, &response);
          Ok(())
        });

      return Ok(ServedResponse::from_cache(cached));
    }

    let response = fetch_bounded(&*self.fetcher, request, self.config.fetch_timeout).await?;
    store(&*self.storage, &partition, request, &response);
    Ok(ServedResponse::from_network(response))
  }

  /// Cached copy if present, otherwise the live result. The live fetch
  /// always runs and refreshes the runtime partition.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
  ) -> Result<ServedResponse, FetchError> {
    let (tx, rx) = oneshot::channel();
    {
      let storage = Arc::clone(&self.storage);
      let fetcher = Arc::clone(&self.fetcher);
      let timeout = self.config.fetch_timeout;
      let runtime = self.config.runtime_name();
      let request = request.clone();

      self
        .tasks
        .spawn(format!("revalidate {}", request.url), async move {
          let result = fetch_bounded(&*fetcher, &request, timeout).await;
          if let Ok(response) = &result {
            store(&*storage, &runtime, &request, response);
          }
          // Nobody is listening when the cached copy was served.
          let outcome = result.as_ref().map(|_| ()).map_err(|e| e.clone());
          let _ = tx.send(result);
          outcome
        });
    }

    if let Some(cached) = self.lookup(request) {
      return Ok(ServedResponse::from_cache(cached));
    }

    let live = rx.await.unwrap_or(Err(FetchError::Aborted));
    match live {
      Ok(response) => Ok(ServedResponse::from_network(response)),
      Err(e) => match self.lookup(request) {
        Some(cached) => Ok(ServedResponse::from_cache(cached)),
        None => Err(e),
      },
    }
  }

  /// Last resort once every strategy failed.
  ///
  /// Navigations get the cached app shell when there is one; API paths get a
  /// JSON offline error; everything else a bare offline response.
  pub fn fallback(&self, request: &Request) -> ServedResponse {
    if request.is_navigation() {
      if let Some(shell) = self.app_shell() {
        return ServedResponse::offline(shell.response, Some(shell.cached_at));
      }
    } else if self.config.routes.is_api_path(request.url.path()) {
      return ServedResponse::offline(Response::offline_api(), None);
    }

    ServedResponse::offline(Response::offline(), None)
  }

  fn app_shell(&self) -> Option<CachedResponse> {
    let url = self.config.origin.join(&self.config.app_shell).ok()?;
    self.lookup(&Request::get(url))
  }

  /// Best cached match across this version's partitions. Storage errors
  /// count as a miss.
  fn lookup(&self, request: &Request) -> Option<CachedResponse> {
    let precache = self.config.precache_name();
    let runtime = self.config.runtime_name();
    match self
      .storage
      .match_any(&[precache.as_str(), runtime.as_str()], &request.cache_key())
    {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Manifest assets refresh the precache; everything else goes to runtime.
  fn partition_for(&self, request: &Request) -> String {
    if self.config.is_manifest_url(&request.url) {
      self.config.precache_name()
    } else {
      self.config.runtime_name()
    }
  }
}

/// Live fetch bounded by `timeout`.
async fn fetch_bounded<F: Fetcher + ?Sized>(
  fetcher: &F,
  request: &Request,
  timeout: Duration,
) -> Result<Response, FetchError> {
  match tokio::time::timeout(timeout, fetcher.fetch(request)).await {
    Ok(result) => result,
    Err(_) => Err(FetchError::Timeout(timeout)),
  }
}

/// Store a successful response; failures are logged and otherwise ignored.
fn store<S: CacheStorage + ?Sized>(
  storage: &S,
  partition: &str,
  request: &Request,
  response: &Response,
) {
  match storage.put(
    partition,
    &request.cache_key(),
    request.url.as_str(),
    response,
  ) {
    Ok(true) => debug!(url = %request.url, %partition, "Cached response"),
    Ok(false) => debug!(url = %request.url, status = response.status, "Response not cacheable"),
    Err(e) => warn!(url = %request.url, %partition, error = %e, "Failed to cache response"),
  }
}
