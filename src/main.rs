mod agent;
mod cache;
mod config;
mod host;
mod http;
mod logging;
mod network;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use agent::OfflineCacheAgent;
use cache::{CacheStorage, SqliteStorage};
use host::Registration;
use http::Request;
use network::HttpNetwork;

#[derive(Parser, Debug)]
#[command(name = "offline-agent")]
#[command(about = "A cache-first offline agent for single-page web applications")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-agent/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Cache version to use instead of the configured one
  #[arg(long, global = true)]
  cache_name: Option<String>,

  /// Origin that root-relative URLs resolve against
  #[arg(long, global = true)]
  origin: Option<String>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the asset manifest and take control, evicting older versions
  Install,
  /// Send a request through the installed version
  Fetch {
    /// Absolute or root-relative URL
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// List cache stores
  Caches,
  /// List the entries of the configured version's cache store
  Entries,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init(args.log_file.as_deref(), args.verbose)?;

  // Load configuration, then apply command line overrides
  let config = config::Config::load(args.config.as_deref())?;
  let config = config::Config {
    cache_name: args.cache_name.unwrap_or(config.cache_name),
    origin: args.origin.unwrap_or(config.origin),
    ..config
  };
  config.validate()?;

  let storage = Arc::new(SqliteStorage::open(&config.database_path()?)?);
  let network = Arc::new(HttpNetwork::new()?);
  let manifest = config.manifest_requests()?;
  let agent = |cache_name: &str| {
    OfflineCacheAgent::new(
      cache_name,
      manifest.clone(),
      Arc::clone(&storage),
      Arc::clone(&network),
    )
    .with_skip_waiting(config.skip_waiting)
    .with_claim_clients(config.claim_clients)
  };
  let mut registration = Registration::new(Arc::clone(&network));

  match args.command {
    Command::Install => {
      let outcome = match registration.register(agent(&config.cache_name)).await? {
        Some(outcome) => outcome,
        None => {
          // No pages are open in this process, so nothing keeps the new version waiting
          info!(cache = %config.cache_name, "No open pages; activating waiting version");
          registration.activate_waiting().await?
        }
      };
      for name in &outcome.deleted {
        println!("deleted {}", name);
      }
      let controller = registration
        .controller()
        .map(|c| c.cache_name().to_string())
        .unwrap_or_default();
      let scope = if registration.claimed() {
        "controlling open pages"
      } else {
        "controlling new pages"
      };
      println!("{}: {} assets cached, {}", controller, manifest.len(), scope);
    }
    Command::Fetch {
      url,
      method,
      headers,
      data,
    } => {
      // Resume whichever version last activated, which may differ from the
      // configured one if its install failed
      let active = storage
        .controller()
        .await?
        .ok_or_else(|| eyre!("No version has been activated; run install first"))?;
      if active != config.cache_name {
        warn!(
          configured = %config.cache_name,
          active = %active,
          "Configured version is not active; using the active one"
        );
      }
      registration.resume(agent(&active)).await?;

      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let mut request = Request::resolve(method, &config.origin_url()?, &url)?;
      for header in headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header '{}', expected \"Name: value\"", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      if let Some(data) = data {
        request = request.with_body(data);
      }

      let result = registration.dispatch_fetch(&request).await?;
      let response = &result.response;
      eprintln!(
        "{} {} ({:?}, {})",
        response.status,
        response.status_text,
        result.source,
        response.header("content-type").unwrap_or("no content type")
      );
      std::io::stdout()
        .write_all(&response.body)
        .map_err(|e| eyre!("Failed to write response body: {}", e))?;
    }
    Command::Caches => {
      let active = storage.controller().await?;
      for name in storage.keys().await? {
        let marker = if Some(&name) == active.as_ref() {
          "*"
        } else {
          " "
        };
        println!("{} {}", marker, name);
      }
    }
    Command::Entries => {
      if !storage.has(&config.cache_name).await? {
        return Err(eyre!("Cache '{}' does not exist", config.cache_name));
      }
      for entry in storage.entries(&config.cache_name).await? {
        println!(
          "{} {:>9} {} {} {}",
          entry.status,
          entry.size,
          entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
          short_digest(&entry.digest),
          entry.url
        );
      }
    }
  }

  Ok(())
}

/// Leading characters of a digest for listings; shorter values are shown whole.
fn short_digest(digest: &str) -> &str {
  digest.get(..12).unwrap_or(digest)
}
