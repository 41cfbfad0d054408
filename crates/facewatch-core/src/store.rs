//! Local persistence. A SQLite key-value table holding whole-value JSON
//! payloads (roster, settings). Every write replaces the value for its key.

use crate::types::{KnownPerson, RecognitionOptions};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

const ROSTER_KEY: &str = "roster";
const SETTINGS_KEY: &str = "settings";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create data directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupted {key} payload: {source}")]
    Corrupted {
        key: &'static str,
        source: serde_json::Error,
    },
    #[error("failed to serialize {key}: {source}")]
    Serialize {
        key: &'static str,
        source: serde_json::Error,
    },
}

/// Persistence for the known-people roster.
pub trait RosterStore: Send {
    /// Load the persisted roster. An absent roster is an empty one.
    fn load_roster(&self) -> Result<Vec<KnownPerson>, StoreError>;
    /// Replace the persisted roster with `roster`.
    fn save_roster(&self, roster: &[KnownPerson]) -> Result<(), StoreError>;
}

/// Persistence for recognition options.
pub trait SettingsStore: Send {
    fn load_options(&self) -> Result<RecognitionOptions, StoreError>;
    fn save_options(&self, options: &RecognitionOptions) -> Result<(), StoreError>;
}

/// SQLite-backed key-value store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "opened store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

impl RosterStore for SqliteStore {
    fn load_roster(&self) -> Result<Vec<KnownPerson>, StoreError> {
        match self.get(ROSTER_KEY)? {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Corrupted {
                key: ROSTER_KEY,
                source,
            }),
        }
    }

    fn save_roster(&self, roster: &[KnownPerson]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(roster).map_err(|source| StoreError::Serialize {
            key: ROSTER_KEY,
            source,
        })?;
        self.put(ROSTER_KEY, &raw)
    }
}

impl SettingsStore for SqliteStore {
    fn load_options(&self) -> Result<RecognitionOptions, StoreError> {
        match self.get(SETTINGS_KEY)? {
            None => Ok(RecognitionOptions::default()),
            Some(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Corrupted {
                key: SETTINGS_KEY,
                source,
            }),
        }
    }

    fn save_options(&self, options: &RecognitionOptions) -> Result<(), StoreError> {
        let raw = serde_json::to_string(options).map_err(|source| StoreError::Serialize {
            key: SETTINGS_KEY,
            source,
        })?;
        self.put(SETTINGS_KEY, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(id: &str, name: &str) -> KnownPerson {
        KnownPerson {
            id: id.into(),
            name: name.into(),
            image: "aW1n".into(),
            mime: "image/jpeg".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_roster_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let roster = vec![person("1", "Alice"), person("2", "Bob")];
        store.save_roster(&roster).unwrap();
        assert_eq!(store.load_roster().unwrap(), roster);
    }

    #[test]
    fn test_empty_roster_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load_roster().unwrap().is_empty());
        store.save_roster(&[]).unwrap();
        assert!(store.load_roster().unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_roster_is_an_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("roster", "{not json").unwrap();
        assert!(matches!(
            store.load_roster(),
            Err(StoreError::Corrupted { key: "roster", .. })
        ));
    }

    #[test]
    fn test_put_replaces_value() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("k", "one").unwrap();
        store.put("k", "two").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("two"));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_options_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.load_options().unwrap(), RecognitionOptions::default());
        let options = RecognitionOptions {
            recognize_gender: true,
            count_people: true,
        };
        store.save_options(&options).unwrap();
        assert_eq!(store.load_options().unwrap(), options);
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/facewatch.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_roster(&[person("1", "Alice")]).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_roster().unwrap()[0].name, "Alice");
    }
}
