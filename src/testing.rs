//! Test doubles shared by the agent and host tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::cache::SqliteStorage;
use crate::http::{Request, Response};
use crate::network::Network;

pub const ORIGIN: &str = "http://localhost:3000";

pub fn origin() -> Url {
  Url::parse(ORIGIN).unwrap()
}

pub fn request(method: reqwest::Method, path: &str) -> Request {
  Request::resolve(method, &origin(), path).unwrap()
}

pub fn get(path: &str) -> Request {
  request(reqwest::Method::GET, path)
}

pub fn storage() -> Arc<SqliteStorage> {
  Arc::new(SqliteStorage::open_in_memory().unwrap())
}

/// Fake network serving canned responses and counting every call.
///
/// Unknown URLs behave like an unreachable host.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  calls: AtomicUsize,
  offline: AtomicBool,
}

impl FakeNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn route(&self, path: &str, response: Response) {
    let url = get(path).cache_key();
    self.routes.lock().unwrap().insert(url, response);
  }

  /// Serve `200 OK` with the path as body for each path.
  pub fn serve(&self, paths: &[&str]) {
    for path in paths {
      self.route(path, Response::new(200, format!("network:{}", path)));
    }
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to fetch {}: network unreachable", request.url));
    }

    self
      .routes
      .lock()
      .unwrap()
      .get(&request.cache_key())
      .cloned()
      .ok_or_else(|| eyre!("Failed to fetch {}: connection refused", request.url))
  }
}
