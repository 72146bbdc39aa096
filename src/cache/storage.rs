//! Cache store implementations: SQLite for durable use, memory for embedding.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use super::traits::{CacheStore, CachedResponse};
use crate::error::{StoreError, StoreResult};
use crate::generation::GenerationId;
use crate::http::{RequestKey, Response, ResponseKind};

/// Response metadata persisted next to the body blob.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
  status: u16,
  status_text: String,
  kind: ResponseKind,
  headers: Vec<(String, String)>,
}

impl StoredMeta {
  fn of(response: &Response) -> Self {
    Self {
      status: response.status,
      status_text: response.status_text.clone(),
      kind: response.kind,
      headers: response.headers.clone(),
    }
  }

  fn into_response(self, body: Vec<u8>) -> Response {
    Response {
      status: self.status,
      status_text: self.status_text,
      kind: self.kind,
      headers: self.headers,
      body,
    }
  }
}

/// SQLite-based cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at the given path.
  pub fn open(path: &Path) -> StoreResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable {
        message: format!("failed to create cache directory {}: {}", parent.display(), e),
      })?;
    }

    let conn = Connection::open(path)?;
    Self::with_connection(conn)
  }

  /// Open a throwaway store that lives in memory.
  pub fn open_in_memory() -> StoreResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> StoreResult<Self> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("offcache").join("cache.db"))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per generation; rowid gives creation order
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by a hash of method + url
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    meta TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, key_hash),
    FOREIGN KEY (generation) REFERENCES generations(name) ON DELETE CASCADE
);
"#;

/// SHA256 of the request key for stable, fixed-length primary keys.
fn key_hash(key: &RequestKey) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

fn insert_generation(conn: &Connection, generation: &GenerationId) -> StoreResult<bool> {
  let inserted = conn.execute(
    "INSERT OR IGNORE INTO generations (name) VALUES (?)",
    params![generation.as_str()],
  )?;
  Ok(inserted > 0)
}

fn insert_entry(
  conn: &Connection,
  generation: &GenerationId,
  key: &RequestKey,
  response: &Response,
) -> StoreResult<()> {
  let meta = serde_json::to_string(&StoredMeta::of(response))?;
  conn.execute(
    "INSERT OR REPLACE INTO entries (generation, key_hash, request_key, meta, body, cached_at)
     VALUES (?, ?, ?, ?, ?, datetime('now'))",
    params![
      generation.as_str(),
      key_hash(key),
      key.as_str(),
      meta,
      response.body
    ],
  )?;
  Ok(())
}

impl CacheStore for SqliteStore {
  fn open(&self, generation: &GenerationId) -> StoreResult<bool> {
    let conn = self.conn.lock()?;
    insert_generation(&conn, generation)
  }

  fn lookup(
    &self,
    generation: &GenerationId,
    key: &RequestKey,
  ) -> StoreResult<Option<CachedResponse>> {
    let conn = self.conn.lock()?;

    let row: Option<(String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT meta, body, cached_at FROM entries
         WHERE generation = ? AND key_hash = ?",
        params![generation.as_str(), key_hash(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    match row {
      Some((meta, body, cached_at)) => {
        let meta: StoredMeta = serde_json::from_str(&meta)?;
        Ok(Some(CachedResponse {
          response: meta.into_response(body),
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, generation: &GenerationId, key: &RequestKey, response: &Response) -> StoreResult<()> {
    let mut conn = self.conn.lock()?;
    let tx = conn.transaction()?;
    insert_generation(&tx, generation)?;
    insert_entry(&tx, generation, key, response)?;
    tx.commit()?;
    Ok(())
  }

  fn put_if_present(
    &self,
    generation: &GenerationId,
    key: &RequestKey,
    response: &Response,
  ) -> StoreResult<bool> {
    let mut conn = self.conn.lock()?;
    let tx = conn.transaction()?;
    let exists: i64 = tx.query_row(
      "SELECT COUNT(*) FROM generations WHERE name = ?",
      params![generation.as_str()],
      |row| row.get(0),
    )?;
    if exists == 0 {
      return Ok(false);
    }
    insert_entry(&tx, generation, key, response)?;
    tx.commit()?;
    Ok(true)
  }

  fn put_all(
    &self,
    generation: &GenerationId,
    entries: &[(RequestKey, Response)],
  ) -> StoreResult<()> {
    let mut conn = self.conn.lock()?;
    // Dropping the transaction on error rolls it back
    let tx = conn.transaction()?;
    insert_generation(&tx, generation)?;
    for (key, response) in entries {
      insert_entry(&tx, generation, key, response)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn delete(&self, generation: &GenerationId) -> StoreResult<bool> {
    let mut conn = self.conn.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM entries WHERE generation = ?",
      params![generation.as_str()],
    )?;
    let removed = tx.execute(
      "DELETE FROM generations WHERE name = ?",
      params![generation.as_str()],
    )?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn keys(&self) -> StoreResult<Vec<GenerationId>> {
    let conn = self.conn.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM generations ORDER BY rowid")?;
    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(names.into_iter().map(GenerationId::from).collect())
  }

  fn entry_keys(&self, generation: &GenerationId) -> StoreResult<Vec<RequestKey>> {
    let conn = self.conn.lock()?;
    let mut stmt = conn.prepare(
      "SELECT request_key FROM entries WHERE generation = ? ORDER BY request_key",
    )?;
    let keys = stmt
      .query_map(params![generation.as_str()], |row| row.get::<_, String>(0))?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(keys.into_iter().map(RequestKey::from_stored).collect())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> StoreResult<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StoreError::Unavailable {
      message: format!("failed to parse datetime '{}': {}", s, e),
    })
}

struct MemoryEntry {
  response: Response,
  cached_at: DateTime<Utc>,
}

/// In-memory cache store. Generations are kept in creation order.
#[derive(Default)]
pub struct MemoryStore {
  generations: RwLock<Vec<(GenerationId, BTreeMap<RequestKey, MemoryEntry>)>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

fn position(
  generations: &[(GenerationId, BTreeMap<RequestKey, MemoryEntry>)],
  generation: &GenerationId,
) -> Option<usize> {
  generations.iter().position(|(name, _)| name == generation)
}

fn open_in(
  generations: &mut Vec<(GenerationId, BTreeMap<RequestKey, MemoryEntry>)>,
  generation: &GenerationId,
) -> usize {
  match position(generations, generation) {
    Some(index) => index,
    None => {
      generations.push((generation.clone(), BTreeMap::new()));
      generations.len() - 1
    }
  }
}

impl CacheStore for MemoryStore {
  fn open(&self, generation: &GenerationId) -> StoreResult<bool> {
    let mut generations = self.generations.write()?;
    let existed = position(&generations, generation).is_some();
    open_in(&mut generations, generation);
    Ok(!existed)
  }

  fn lookup(
    &self,
    generation: &GenerationId,
    key: &RequestKey,
  ) -> StoreResult<Option<CachedResponse>> {
    let generations = self.generations.read()?;
    let found = position(&generations, generation)
      .and_then(|index| generations[index].1.get(key))
      .map(|entry| CachedResponse {
        response: entry.response.duplicate(),
        cached_at: entry.cached_at,
      });
    Ok(found)
  }

  fn put(&self, generation: &GenerationId, key: &RequestKey, response: &Response) -> StoreResult<()> {
    let mut generations = self.generations.write()?;
    let index = open_in(&mut generations, generation);
    generations[index].1.insert(
      key.clone(),
      MemoryEntry {
        response: response.duplicate(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn put_if_present(
    &self,
    generation: &GenerationId,
    key: &RequestKey,
    response: &Response,
  ) -> StoreResult<bool> {
    let mut generations = self.generations.write()?;
    let Some(index) = position(&generations, generation) else {
      return Ok(false);
    };
    generations[index].1.insert(
      key.clone(),
      MemoryEntry {
        response: response.duplicate(),
        cached_at: Utc::now(),
      },
    );
    Ok(true)
  }

  fn put_all(
    &self,
    generation: &GenerationId,
    entries: &[(RequestKey, Response)],
  ) -> StoreResult<()> {
    // A single write lock makes the batch atomic for readers
    let mut generations = self.generations.write()?;
    let index = open_in(&mut generations, generation);
    let now = Utc::now();
    for (key, response) in entries {
      generations[index].1.insert(
        key.clone(),
        MemoryEntry {
          response: response.duplicate(),
          cached_at: now,
        },
      );
    }
    Ok(())
  }

  fn delete(&self, generation: &GenerationId) -> StoreResult<bool> {
    let mut generations = self.generations.write()?;
    match position(&generations, generation) {
      Some(index) => {
        generations.remove(index);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  fn keys(&self) -> StoreResult<Vec<GenerationId>> {
    let generations = self.generations.read()?;
    Ok(generations.iter().map(|(name, _)| name.clone()).collect())
  }

  fn entry_keys(&self, generation: &GenerationId) -> StoreResult<Vec<RequestKey>> {
    let generations = self.generations.read()?;
    Ok(
      position(&generations, generation)
        .map(|index| generations[index].1.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }
}
