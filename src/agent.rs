//! The offline cache agent: install, activate and fetch interception.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::http::{Request, Response};
use crate::network::Network;

/// Lifecycle state of one agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
  /// Constructed, not yet installed
  Parsed,
  Installing,
  /// Installed and waiting to take control
  Installed,
  Activating,
  /// Controlling pages and intercepting fetches
  Activated,
  /// Install failed, activation failed, or superseded by a newer version
  Redundant,
}

/// What the agent asks of the host once install finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOutcome {
  /// Take over right away instead of waiting for existing pages to close
  pub skip_waiting: bool,
}

/// What the agent asks of the host once activation finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
  /// Take control of every page that is already open
  pub claim_clients: bool,
  /// Obsolete stores that were deleted
  pub deleted: Vec<String>,
}

/// Where a response handed back to a page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Served from the current cache store
  Cache,
  /// Cache miss, forwarded to the network by the agent
  Network,
  /// The agent did not intervene
  PassThrough,
}

/// A response together with its source.
#[derive(Debug, Clone)]
pub struct FetchResult {
  pub response: Response,
  pub source: CacheSource,
}

/// Result of offering a request to the agent.
#[derive(Debug, Clone)]
pub enum Interception {
  /// Not handled; the host sends the request to the network unmodified
  PassThrough,
  /// Handled; hand this back to the page
  Respond(FetchResult),
}

/// Agent owning one versioned cache store and arbitrating requests
/// between that store and the network.
///
/// The store is populated only at install time from the asset manifest;
/// responses fetched on a cache miss are never written back.
pub struct OfflineCacheAgent<S: CacheStorage, N: Network> {
  cache_name: String,
  manifest: Vec<Request>,
  storage: Arc<S>,
  network: Arc<N>,
  skip_waiting: bool,
  claim_clients: bool,
  state: Mutex<AgentState>,
}

impl<S: CacheStorage, N: Network> OfflineCacheAgent<S, N> {
  pub fn new(
    cache_name: impl Into<String>,
    manifest: Vec<Request>,
    storage: Arc<S>,
    network: Arc<N>,
  ) -> Self {
    Self {
      cache_name: cache_name.into(),
      manifest,
      storage,
      network,
      skip_waiting: true,
      claim_clients: true,
      state: Mutex::new(AgentState::Parsed),
    }
  }

  /// Whether to take over as soon as install finishes (default: true).
  pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
    self.skip_waiting = skip_waiting;
    self
  }

  /// Whether to take control of already open pages on activation (default: true).
  pub fn with_claim_clients(mut self, claim_clients: bool) -> Self {
    self.claim_clients = claim_clients;
    self
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn manifest(&self) -> &[Request] {
    &self.manifest
  }

  pub fn state(&self) -> Result<AgentState> {
    self
      .state
      .lock()
      .map(|s| *s)
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn set_state(&self, next: AgentState) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *state = next;
    Ok(())
  }

  /// Move from `from` to `to`, failing if the agent is elsewhere.
  fn transition(&self, from: AgentState, to: AgentState) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if *state != from {
      return Err(eyre!(
        "Agent '{}' cannot move to {:?} from {:?}",
        self.cache_name,
        to,
        *state
      ));
    }
    *state = to;
    Ok(())
  }

  /// Mark this instance as superseded.
  pub(crate) fn mark_redundant(&self) -> Result<()> {
    self.set_state(AgentState::Redundant)
  }

  /// Populate the cache store from the asset manifest.
  ///
  /// All-or-nothing: if any asset cannot be fetched, or comes back with a
  /// non-2xx status, nothing from this install is stored and the agent
  /// becomes redundant.
  pub async fn install(&self) -> Result<InstallOutcome> {
    self.transition(AgentState::Parsed, AgentState::Installing)?;
    info!(cache = %self.cache_name, "Installing");

    match self.precache().await {
      Ok(count) => {
        info!(cache = %self.cache_name, assets = count, "Installed");
        self.set_state(AgentState::Installed)?;
        Ok(InstallOutcome {
          skip_waiting: self.skip_waiting,
        })
      }
      Err(e) => {
        warn!(cache = %self.cache_name, error = %e, "Install failed");
        self.set_state(AgentState::Redundant)?;
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    self.storage.open(&self.cache_name).await?;

    info!(
      cache = %self.cache_name,
      assets = self.manifest.len(),
      "Downloading and caching static assets"
    );

    let fetches = self.manifest.iter().map(|request| async move {
      let response = self.network.fetch(request).await?;
      if !response.is_ok() {
        return Err(eyre!(
          "Manifest asset {} returned HTTP {}",
          request.url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((request.clone(), response))
    });

    let entries = try_join_all(fetches).await?;
    let count = entries.len();
    self.storage.put_all(&self.cache_name, entries).await?;

    Ok(count)
  }

  /// Delete every cache store whose name differs from this agent's.
  ///
  /// Deletions run concurrently; activation finishes once all of them have.
  pub async fn activate(&self) -> Result<ActivateOutcome> {
    self.transition(AgentState::Installed, AgentState::Activating)?;
    info!(cache = %self.cache_name, "Activating");

    match self.delete_obsolete().await {
      Ok(deleted) => {
        self.set_state(AgentState::Activated)?;
        info!(cache = %self.cache_name, deleted = deleted.len(), "Activated");
        Ok(ActivateOutcome {
          claim_clients: self.claim_clients,
          deleted,
        })
      }
      Err(e) => {
        warn!(cache = %self.cache_name, error = %e, "Activation failed");
        self.set_state(AgentState::Redundant)?;
        Err(e)
      }
    }
  }

  async fn delete_obsolete(&self) -> Result<Vec<String>> {
    let names = self.storage.keys().await?;

    let deletions = names
      .into_iter()
      .filter(|name| *name != self.cache_name)
      .map(|name| async move {
        info!(cache = %name, "Deleting obsolete cache");
        let existed = self.storage.delete(&name).await?;
        Ok::<_, color_eyre::Report>(existed.then_some(name))
      });

    let deleted = try_join_all(deletions).await?;
    Ok(deleted.into_iter().flatten().collect())
  }

  /// Record this version as the one in control, so a later session can
  /// restore it.
  pub(crate) async fn record_control(&self) -> Result<()> {
    self.storage.set_controller(&self.cache_name).await
  }

  /// Rehydrate an agent whose version was activated in an earlier session.
  ///
  /// Install is not repeated. This version must be the recorded controller
  /// and its cache store must still exist; a store left behind by a failed
  /// install does not qualify.
  pub async fn restore(&self) -> Result<()> {
    let controller = self.storage.controller().await?;
    if controller.as_deref() != Some(self.cache_name.as_str()) {
      return Err(eyre!(
        "Cache '{}' is not the active version (active: {}); run install first",
        self.cache_name,
        controller.as_deref().unwrap_or("none")
      ));
    }
    if !self.storage.has(&self.cache_name).await? {
      return Err(eyre!(
        "Cache '{}' is recorded as active but its store is missing; run install again",
        self.cache_name
      ));
    }
    self.transition(AgentState::Parsed, AgentState::Activated)?;
    debug!(cache = %self.cache_name, "Restored");
    Ok(())
  }

  /// Offer an outgoing request to the agent.
  ///
  /// API calls and non-GET requests are passed through. Everything else is
  /// answered cache-first: a hit never touches the network, a miss is
  /// forwarded and its outcome (including a transport error) returned as-is.
  pub async fn handle_fetch(&self, request: &Request) -> Result<Interception> {
    if self.state()? != AgentState::Activated {
      return Ok(Interception::PassThrough);
    }

    if request.is_pass_through() {
      debug!(method = %request.method, url = %request.url, "Passing through");
      return Ok(Interception::PassThrough);
    }

    if let Some(cached) = self
      .storage
      .match_request(&self.cache_name, request)
      .await?
    {
      debug!(url = %request.url, cached_at = %cached.cached_at, "Cache hit");
      return Ok(Interception::Respond(FetchResult {
        response: cached.response,
        source: CacheSource::Cache,
      }));
    }

    debug!(url = %request.url, "Cache miss");
    let response = self.network.fetch(request).await?;
    Ok(Interception::Respond(FetchResult {
      response,
      source: CacheSource::Network,
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::testing::{get, request, storage, FakeNetwork};
  use reqwest::Method;

  const MANIFEST: &[&str] = &["/", "/index.html"];

  fn agent(
    name: &str,
    storage: &Arc<SqliteStorage>,
    network: &Arc<FakeNetwork>,
  ) -> OfflineCacheAgent<SqliteStorage, FakeNetwork> {
    let manifest = MANIFEST.iter().map(|p| get(p)).collect();
    OfflineCacheAgent::new(name, manifest, Arc::clone(storage), Arc::clone(network))
  }

  async fn activated(
    name: &str,
    storage: &Arc<SqliteStorage>,
    network: &Arc<FakeNetwork>,
  ) -> OfflineCacheAgent<SqliteStorage, FakeNetwork> {
    let agent = agent(name, storage, network);
    agent.install().await.unwrap();
    agent.activate().await.unwrap();
    agent
  }

  fn respond(interception: Interception) -> FetchResult {
    match interception {
      Interception::Respond(result) => result,
      Interception::PassThrough => panic!("expected a response, got pass-through"),
    }
  }

  #[tokio::test]
  async fn test_install_caches_every_manifest_url() {
    let storage = storage();
    let network = FakeNetwork::new();
    network.serve(MANIFEST);

    let agent = agent("v1", &storage, &network);
    let outcome = agent.install().await.unwrap();

    assert!(outcome.skip_waiting);
    assert_eq!(agent.state().unwrap(), AgentState::Installed);
    assert_eq!(network.calls(), MANIFEST.len());

    for path in MANIFEST {
      let cached = storage.match_request("v1", &get(path)).await.unwrap();
      assert!(cached.is_some(), "{} should be cached", path);
    }
    assert_eq!(network.calls(), MANIFEST.len());
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let storage = storage();
    let network = FakeNetwork::new();
    // "/index.html" is unreachable
    network.serve(&["/"]);

    let agent = agent("v1", &storage, &network);
    assert!(agent.install().await.is_err());
    assert_eq!(agent.state().unwrap(), AgentState::Redundant);
    assert!(storage.entries("v1").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_rejects_error_status() {
    let storage = storage();
    let network = FakeNetwork::new();
    network.serve(&["/"]);
    network.route("/index.html", Response::new(404, "not found"));

    let agent = agent("v1", &storage, &network);
    let err = agent.install().await.unwrap_err();
    assert!(err.to_string().contains("HTTP 404"));
    assert!(storage.entries("v1").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let storage = storage();
    let network = FakeNetwork::new();

    let agent = agent("v1", &storage, &network);
    assert!(agent.activate().await.is_err());
    assert_eq!(agent.state().unwrap(), AgentState::Parsed);
  }

  #[tokio::test]
  async fn test_activate_deletes_obsolete_caches() {
    let storage = storage();
    let network = FakeNetwork::new();
    network.serve(MANIFEST);
    storage.open("v0").await.unwrap();
    storage.open("other-app").await.unwrap();

    let agent = agent("v1", &storage, &network);
    agent.install().await.unwrap();
    let outcome = agent.activate().await.unwrap();

    assert!(outcome.claim_clients);
    assert_eq!(outcome.deleted, vec!["v0", "other-app"]);
    assert_eq!(storage.keys().await.unwrap(), vec!["v1"]);
    assert_eq!(agent.state().unwrap(), AgentState::Activated);
  }

  #[tokio::test]
  async fn test_hit_makes_no_network_call() {
    let storage = storage();
    let network = FakeNetwork::new();
    network.serve(MANIFEST);
    let agent = activated("v1", &storage, &network).await;
    let before = network.calls();

    let result = respond(agent.handle_fetch(&get("/index.html")).await.unwrap());

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.response.body, b"network:/index.html");
    assert_eq!(network.calls(), before);
  }

  #[tokio::test]
  async fn test_hit_works_offline() {
    let storage = storage();
    let network = FakeNetwork::new();
    network.serve(MANIFEST);
    let agent = activated("v1", &storage, &network).await;
    network.set_offline(true);

    let result = respond(agent.handle_fetch(&get("/")).await.unwrap());
    assert_eq!(result.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_miss_fetches_once_without_write_back() {
    let storage = storage();
    let network = FakeNetwork::new();
    network.serve(MANIFEST);
    network.serve(&["/app.js"]);
    let agent = activated("v1", &storage, &network).await;
    let before = network.calls();

    let result = respond(agent.handle_fetch(&get("/app.js")).await.unwrap());

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.response.body, b"network:/app.js");
    assert_eq!(network.calls(), before + 1);
    assert_eq!(storage.entries("v1").await.unwrap().len(), MANIFEST.len());
    assert!(storage.match_request("v1", &get("/app.js")).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_miss_while_offline_surfaces_network_error() {
    let storage = storage();
    let network = FakeNetwork::new();
    network.serve(MANIFEST);
    let agent = activated("v1", &storage, &network).await;
    network.set_offline(true);

    let err = agent.handle_fetch(&get("/app.js")).await.unwrap_err();
    assert!(err.to_string().contains("network unreachable"));
  }

  #[tokio::test]
  async fn test_api_and_non_get_pass_through() {
    let storage = storage();
    let network = FakeNetwork::new();
    network.serve(MANIFEST);
    let agent = activated("v1", &storage, &network).await;

    // Even if an API response somehow ends up in the store it is never served
    storage
      .put_all("v1", vec![(get("/api/status"), Response::new(200, "stale"))])
      .await
      .unwrap();
    let before = network.calls();

    for req in [
      get("/api/status"),
      request(Method::POST, "/api/order"),
      request(Method::POST, "/index.html"),
      request(Method::DELETE, "/"),
    ] {
      let interception = agent.handle_fetch(&req).await.unwrap();
      assert!(matches!(interception, Interception::PassThrough));
    }
    assert_eq!(network.calls(), before);
  }

  #[tokio::test]
  async fn test_not_activated_passes_everything_through() {
    let storage = storage();
    let network = FakeNetwork::new();
    network.serve(MANIFEST);
    let agent = agent("v1", &storage, &network);
    agent.install().await.unwrap();

    let interception = agent.handle_fetch(&get("/index.html")).await.unwrap();
    assert!(matches!(interception, Interception::PassThrough));
  }

  #[tokio::test]
  async fn test_restore_requires_recorded_controller() {
    let storage = storage();
    let network = FakeNetwork::new();

    let missing = agent("v1", &storage, &network);
    assert!(missing.restore().await.is_err());

    // A store alone is not enough, e.g. one left behind by a failed install
    storage.open("v1").await.unwrap();
    let unrecorded = agent("v1", &storage, &network);
    assert!(unrecorded.restore().await.is_err());
    assert_eq!(unrecorded.state().unwrap(), AgentState::Parsed);

    storage.set_controller("v1").await.unwrap();
    let restored = agent("v1", &storage, &network);
    restored.restore().await.unwrap();
    assert_eq!(restored.state().unwrap(), AgentState::Activated);
  }

  #[tokio::test]
  async fn test_restore_fails_when_store_was_deleted() {
    let storage = storage();
    let network = FakeNetwork::new();
    storage.set_controller("v1").await.unwrap();

    let agent = agent("v1", &storage, &network);
    let err = agent.restore().await.unwrap_err();
    assert!(err.to_string().contains("store is missing"));
  }

  #[tokio::test]
  async fn test_waiting_and_claim_are_configurable() {
    let storage = storage();
    let network = FakeNetwork::new();
    network.serve(MANIFEST);

    let agent = agent("v1", &storage, &network)
      .with_skip_waiting(false)
      .with_claim_clients(false);

    assert!(!agent.install().await.unwrap().skip_waiting);
    assert!(!agent.activate().await.unwrap().claim_clients);
  }
}
