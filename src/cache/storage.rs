//! SQLite implementation of the cache storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::traits::{CacheEntry, CacheStorage, CachedResponse};
use crate::http::{Request, Response};

/// SQLite-based cache storage.
///
/// Statements run on tokio's blocking pool; the connection itself is
/// serialised behind a mutex.
#[derive(Clone)]
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
  /// Open (or create) the storage database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Run `f` against the connection on the blocking pool.
  async fn run<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let mut conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&mut conn)
    })
    .await
    .map_err(|e| eyre!("Cache storage task failed: {}", e))?
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named cache stores, id preserves creation order
CREATE TABLE IF NOT EXISTS caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by request identity
CREATE TABLE IF NOT EXISTS entries (
    cache_id INTEGER NOT NULL REFERENCES caches(id) ON DELETE CASCADE,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    digest TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_id, request_key)
);

-- Version in control, at most one row
CREATE TABLE IF NOT EXISTS controller (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    cache_name TEXT NOT NULL,
    activated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

#[async_trait]
impl CacheStorage for SqliteStorage {
  async fn open(&self, cache_name: &str) -> Result<()> {
    let name = cache_name.to_string();
    self
      .run(move |conn| {
        ensure_cache(conn, &name)?;
        Ok(())
      })
      .await
  }

  async fn has(&self, cache_name: &str) -> Result<bool> {
    let name = cache_name.to_string();
    self
      .run(move |conn| Ok(cache_id(conn, &name)?.is_some()))
      .await
  }

  async fn keys(&self) -> Result<Vec<String>> {
    self
      .run(|conn| {
        let mut stmt = conn
          .prepare("SELECT name FROM caches ORDER BY id")
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let names = stmt
          .query_map([], |row| row.get(0))
          .map_err(|e| eyre!("Failed to list caches: {}", e))?
          .collect::<rusqlite::Result<Vec<String>>>()
          .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

        Ok(names)
      })
      .await
  }

  async fn delete(&self, cache_name: &str) -> Result<bool> {
    let name = cache_name.to_string();
    self
      .run(move |conn| {
        let tx = conn
          .transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

        tx.execute(
          "DELETE FROM entries WHERE cache_id IN (SELECT id FROM caches WHERE name = ?)",
          params![name],
        )
        .map_err(|e| eyre!("Failed to delete entries of cache '{}': {}", name, e))?;

        let deleted = tx
          .execute("DELETE FROM caches WHERE name = ?", params![name])
          .map_err(|e| eyre!("Failed to delete cache '{}': {}", name, e))?;

        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

        Ok(deleted > 0)
      })
      .await
  }

  async fn match_request(
    &self,
    cache_name: &str,
    request: &Request,
  ) -> Result<Option<CachedResponse>> {
    if request.method != Method::GET {
      return Ok(None);
    }

    let name = cache_name.to_string();
    let key = request.cache_key();

    self
      .run(move |conn| {
        let row: Option<(u16, String, String, Vec<u8>, String, String)> = conn
          .query_row(
            "SELECT e.status, e.status_text, e.headers, e.body, e.digest, e.cached_at
             FROM entries e INNER JOIN caches c ON c.id = e.cache_id
             WHERE c.name = ? AND e.request_key = ?",
            params![name, key],
            |row| {
              Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
              ))
            },
          )
          .optional()
          .map_err(|e| eyre!("Failed to look up {} in cache '{}': {}", key, name, e))?;

        let Some((status, status_text, headers, body, digest, cached_at)) = row else {
          return Ok(None);
        };

        if body_digest(&body) != digest {
          return Err(eyre!(
            "Stored response for {} in cache '{}' is corrupt (digest mismatch)",
            key,
            name
          ));
        }

        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;

        Ok(Some(CachedResponse {
          response: Response {
            status,
            status_text,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      })
      .await
  }

  async fn put_all(&self, cache_name: &str, entries: Vec<(Request, Response)>) -> Result<()> {
    let name = cache_name.to_string();

    let rows = entries
      .into_iter()
      .map(|(request, response)| -> Result<_> {
        let headers = serde_json::to_string(&response.headers)
          .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
        let digest = body_digest(&response.body);
        Ok((request.cache_key(), response, headers, digest))
      })
      .collect::<Result<Vec<_>>>()?;

    self
      .run(move |conn| {
        let tx = conn
          .transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

        let id = ensure_cache(&tx, &name)?;

        {
          let mut stmt = tx
            .prepare(
              "INSERT OR REPLACE INTO entries
                 (cache_id, request_key, status, status_text, headers, body, digest, cached_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
            )
            .map_err(|e| eyre!("Failed to prepare insert: {}", e))?;

          for (key, response, headers, digest) in &rows {
            stmt
              .execute(params![
                id,
                key,
                response.status,
                response.status_text,
                headers,
                response.body,
                digest
              ])
              .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
          }
        }

        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

        Ok(())
      })
      .await
  }

  async fn entries(&self, cache_name: &str) -> Result<Vec<CacheEntry>> {
    let name = cache_name.to_string();
    self
      .run(move |conn| {
        let mut stmt = conn
          .prepare(
            "SELECT e.request_key, e.status, length(e.body), e.digest, e.cached_at
             FROM entries e INNER JOIN caches c ON c.id = e.cache_id
             WHERE c.name = ?
             ORDER BY e.request_key",
          )
          .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

        let rows = stmt
          .query_map(params![name], |row| {
            Ok((
              row.get::<_, String>(0)?,
              row.get::<_, u16>(1)?,
              row.get::<_, i64>(2)?,
              row.get::<_, String>(3)?,
              row.get::<_, String>(4)?,
            ))
          })
          .map_err(|e| eyre!("Failed to query entries: {}", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read entry: {}", e))?;

        rows
          .into_iter()
          .map(|(url, status, size, digest, cached_at)| -> Result<CacheEntry> {
            Ok(CacheEntry {
              url,
              status,
              size: size.max(0) as usize,
              digest,
              cached_at: parse_datetime(&cached_at)?,
            })
          })
          .collect()
      })
      .await
  }

  async fn controller(&self) -> Result<Option<String>> {
    self
      .run(|conn| {
        conn
          .query_row("SELECT cache_name FROM controller WHERE id = 1", [], |row| {
            row.get(0)
          })
          .optional()
          .map_err(|e| eyre!("Failed to read controller: {}", e))
      })
      .await
  }

  async fn set_controller(&self, cache_name: &str) -> Result<()> {
    let name = cache_name.to_string();
    self
      .run(move |conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO controller (id, cache_name, activated_at)
             VALUES (1, ?, datetime('now'))",
            params![name],
          )
          .map_err(|e| eyre!("Failed to record controller '{}': {}", name, e))?;
        Ok(())
      })
      .await
  }
}

fn cache_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
  conn
    .query_row(
      "SELECT id FROM caches WHERE name = ?",
      params![name],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to look up cache '{}': {}", name, e))
}

/// Create the named cache if absent and return its id.
fn ensure_cache(conn: &Connection, name: &str) -> Result<i64> {
  conn
    .execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create cache '{}': {}", name, e))?;

  cache_id(conn, name)?.ok_or_else(|| eyre!("Cache '{}' vanished after creation", name))
}

/// Hex-encoded SHA-256 of a response body.
fn body_digest(body: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(body);
  hex::encode(hasher.finalize())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
