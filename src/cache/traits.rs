//! Cache storage contract and the values it returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::http::{Request, Response};

/// A response replayed from a cache store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored response, exactly as it was received
  pub response: Response,
  /// When the response was written to the store
  pub cached_at: DateTime<Utc>,
}

/// Summary of one stored entry, used for listing a store's contents.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub url: String,
  pub status: u16,
  pub size: usize,
  pub digest: String,
  pub cached_at: DateTime<Utc>,
}

/// Host-managed storage holding named cache stores.
///
/// Every operation is keyed by cache name; a store comes into existence on
/// `open` (or on the first `put_all`) and disappears on `delete`.
#[async_trait]
pub trait CacheStorage: Send + Sync {
  /// Open the named store, creating it if absent.
  async fn open(&self, cache_name: &str) -> Result<()>;

  /// Whether a store with this name exists.
  async fn has(&self, cache_name: &str) -> Result<bool>;

  /// Names of all existing stores, in creation order.
  async fn keys(&self) -> Result<Vec<String>>;

  /// Delete the named store and everything in it.
  /// Returns false if there was nothing to delete.
  async fn delete(&self, cache_name: &str) -> Result<bool>;

  /// Look up a request in the named store.
  ///
  /// Only `GET` requests can match; a missing store is a miss.
  async fn match_request(
    &self,
    cache_name: &str,
    request: &Request,
  ) -> Result<Option<CachedResponse>>;

  /// Write a batch of responses into the named store.
  ///
  /// Either every entry is written or none is.
  async fn put_all(&self, cache_name: &str, entries: Vec<(Request, Response)>) -> Result<()>;

  /// List the entries of the named store, ordered by URL.
  async fn entries(&self, cache_name: &str) -> Result<Vec<CacheEntry>>;

  /// Name of the version that last completed activation, if any.
  async fn controller(&self) -> Result<Option<String>>;

  /// Record `cache_name` as the version in control.
  async fn set_controller(&self, cache_name: &str) -> Result<()>;
}
