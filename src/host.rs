//! Host-side registration: which agent version controls pages, which one is
//! waiting, and how page requests are routed through them.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::{ActivateOutcome, CacheSource, FetchResult, Interception, OfflineCacheAgent};
use crate::cache::CacheStorage;
use crate::http::Request;
use crate::network::Network;

/// Registration of agent versions for one application scope.
///
/// At most one version controls pages at a time. A newly registered version
/// is installed first; it only replaces the controller once it has also
/// activated, so a failed install leaves the current controller in place.
pub struct Registration<S: CacheStorage, N: Network> {
  network: Arc<N>,
  controller: Option<Arc<OfflineCacheAgent<S, N>>>,
  waiting: Option<Arc<OfflineCacheAgent<S, N>>>,
  /// Whether the controller took over pages that were already open
  claimed: bool,
}

impl<S: CacheStorage, N: Network> Registration<S, N> {
  pub fn new(network: Arc<N>) -> Self {
    Self {
      network,
      controller: None,
      waiting: None,
      claimed: false,
    }
  }

  pub fn controller(&self) -> Option<&Arc<OfflineCacheAgent<S, N>>> {
    self.controller.as_ref()
  }

  #[cfg(test)]
  pub fn waiting(&self) -> Option<&Arc<OfflineCacheAgent<S, N>>> {
    self.waiting.as_ref()
  }

  pub fn claimed(&self) -> bool {
    self.claimed
  }

  /// Install a new agent version.
  ///
  /// If the agent asks to skip waiting it is activated straight away and the
  /// activation outcome is returned; otherwise it is held as the waiting
  /// version until [`Registration::activate_waiting`].
  pub async fn register(
    &mut self,
    agent: OfflineCacheAgent<S, N>,
  ) -> Result<Option<ActivateOutcome>> {
    let agent = Arc::new(agent);
    let outcome = agent.install().await?;

    if let Some(previous) = self.waiting.replace(Arc::clone(&agent)) {
      previous.mark_redundant()?;
    }

    if outcome.skip_waiting {
      return self.activate_waiting().await.map(Some);
    }

    info!(cache = %agent.cache_name(), "Waiting for existing pages to close");
    Ok(None)
  }

  /// Activate the waiting version and make it the controller.
  ///
  /// The new controller is recorded in storage so later sessions resume it.
  pub async fn activate_waiting(&mut self) -> Result<ActivateOutcome> {
    let agent = self
      .waiting
      .take()
      .ok_or_else(|| eyre!("No waiting agent to activate"))?;

    let outcome = agent.activate().await?;
    agent.record_control().await?;

    if let Some(previous) = self.controller.replace(agent) {
      previous.mark_redundant()?;
    }
    self.claimed = outcome.claim_clients;

    Ok(outcome)
  }

  /// Reinstate a version that was activated in an earlier session.
  ///
  /// Only the recorded controller can be resumed.
  pub async fn resume(&mut self, agent: OfflineCacheAgent<S, N>) -> Result<()> {
    agent.restore().await?;

    if let Some(previous) = self.controller.replace(Arc::new(agent)) {
      previous.mark_redundant()?;
    }
    self.claimed = true;

    Ok(())
  }

  /// Route a page request through the controller, if there is one.
  pub async fn dispatch_fetch(&self, request: &Request) -> Result<FetchResult> {
    if let Some(controller) = &self.controller {
      if let Interception::Respond(result) = controller.handle_fetch(request).await? {
        return Ok(result);
      }
    }

    let response = self.network.fetch(request).await.map_err(|e| {
      warn!(url = %request.url, error = %e, "Network request failed");
      e
    })?;

    Ok(FetchResult {
      response,
      source: CacheSource::PassThrough,
    })
  }
}
