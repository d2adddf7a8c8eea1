//! Request and response values exchanged between pages, the agent and the network.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// Path segment that marks a request as dynamic API traffic.
const API_SEGMENT: &str = "/api/";

/// An outgoing request from a controlled page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  #[cfg(test)]
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Build a request from a URL that may be root-relative (e.g. "/index.html").
  pub fn resolve(method: Method, origin: &Url, raw: &str) -> Result<Self> {
    let url = origin
      .join(raw)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", raw, e))?;
    Ok(Self::new(method, url))
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Whether the agent must leave this request alone and let it hit the network.
  ///
  /// API calls and anything that is not a plain read are never served from cache.
  pub fn is_pass_through(&self) -> bool {
    self.url.as_str().contains(API_SEGMENT) || self.method != Method::GET
  }

  /// Identity of this request inside a cache store.
  ///
  /// Fragments never reach the server, so `/index.html#top` and `/index.html`
  /// share an entry.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.into()
  }
}

/// A response produced by the network or replayed from a cache store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  #[cfg(test)]
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: canonical_reason(status).to_string(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// True for 2xx statuses.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

#[cfg(test)]
fn canonical_reason(status: u16) -> &'static str {
  reqwest::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("")
}
