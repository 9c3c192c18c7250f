// Credential persistence in a local SQLite database

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use super::claims;
use super::types::Credential;

const ACCESS_TOKEN_KEY: &str = "session:access_token";
const REFRESH_TOKEN_KEY: &str = "session:refresh_token";
const TOKEN_EXPIRY_KEY: &str = "session:token_expiry";

/// Durable storage for the credential pair
pub trait CredentialStore: Send + Sync {
    /// Persist both tokens and the derived expiry (epoch ms)
    fn save(&self, credential: &Credential) -> Result<()>;

    /// Read back a saved pair. A lone token is reported as absent.
    fn load(&self) -> Result<Option<Credential>>;

    /// Remove everything. Safe to call on an empty store.
    fn clear(&self) -> Result<()>;

    /// Materialized expiry of the stored access token, in epoch ms
    fn stored_expiry_ms(&self) -> Result<Option<i64>>;
}

/// `CredentialStore` backed by a `session_kv` table
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    /// Open (or create) the database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create session_kv table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
        conn.query_row("SELECT value FROM session_kv WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("Failed to read {} from SQLite", key))
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn save(&self, credential: &Credential) -> Result<()> {
        let expiry = claims::decode(&credential.access_token).map(|c| c.expires_at_ms);

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        {
            let mut upsert = tx
                .prepare("INSERT OR REPLACE INTO session_kv (key, value) VALUES (?1, ?2)")
                .context("Failed to prepare upsert")?;
            upsert.execute([ACCESS_TOKEN_KEY, credential.access_token.as_str()])?;
            upsert.execute([REFRESH_TOKEN_KEY, credential.refresh_token.as_str()])?;
            match expiry {
                Some(ms) => {
                    upsert.execute([TOKEN_EXPIRY_KEY, ms.to_string().as_str()])?;
                }
                None => {
                    tx.execute("DELETE FROM session_kv WHERE key = ?", [TOKEN_EXPIRY_KEY])?;
                }
            }
        }
        tx.commit().context("Failed to save credential")?;

        tracing::debug!(expires_at_ms = ?expiry, "Credential saved");
        Ok(())
    }

    fn load(&self) -> Result<Option<Credential>> {
        let conn = self.conn.lock();
        let access = Self::get(&conn, ACCESS_TOKEN_KEY)?;
        let refresh = Self::get(&conn, REFRESH_TOKEN_KEY)?;

        match (access, refresh) {
            (Some(access), Some(refresh)) => Ok(Credential::new(access, refresh)),
            (None, None) => Ok(None),
            _ => {
                tracing::warn!("Stored credential is incomplete, treating as absent");
                Ok(None)
            }
        }
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM session_kv WHERE key IN (?1, ?2, ?3)",
            [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, TOKEN_EXPIRY_KEY],
        )
        .context("Failed to clear stored credential")?;
        Ok(())
    }

    fn stored_expiry_ms(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let raw = Self::get(&conn, TOKEN_EXPIRY_KEY)?;
        raw.map(|s| {
            s.parse::<i64>()
                .with_context(|| format!("Invalid stored expiry: {}", s))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::claims::unsigned_token;
    use serde_json::json;

    fn credential(exp_secs: i64) -> Credential {
        let access = unsigned_token(&json!({"sub": "1", "email": "a@b.c", "exp": exp_secs}));
        Credential::new(access, "refresh-1".to_string()).unwrap()
    }

    #[test]
    fn test_save_then_load() {
        let store = SqliteCredentialStore::in_memory().unwrap();
        let saved = credential(1_900_000_000);
        store.save(&saved).unwrap();

        assert_eq!(store.load().unwrap(), Some(saved));
        assert_eq!(store.stored_expiry_ms().unwrap(), Some(1_900_000_000_000));
    }

    #[test]
    fn test_expiry_matches_decoded_claims_after_round_trip() {
        let store = SqliteCredentialStore::in_memory().unwrap();
        store.save(&credential(1_800_000_123)).unwrap();

        let loaded = store.load().unwrap().unwrap();
        let claims = claims::decode(&loaded.access_token).unwrap();
        assert_eq!(Some(claims.expires_at_ms), store.stored_expiry_ms().unwrap());
    }

    #[test]
    fn test_save_overwrites_previous_pair() {
        let store = SqliteCredentialStore::in_memory().unwrap();
        store.save(&credential(1_800_000_000)).unwrap();
        let newer = credential(1_900_000_000);
        store.save(&newer).unwrap();

        assert_eq!(store.load().unwrap(), Some(newer));
        assert_eq!(store.stored_expiry_ms().unwrap(), Some(1_900_000_000_000));
    }

    #[test]
    fn test_opaque_access_token_has_no_expiry() {
        let store = SqliteCredentialStore::in_memory().unwrap();
        store.save(&credential(1_800_000_000)).unwrap();
        let opaque = Credential::new("opaque".to_string(), "refresh".to_string()).unwrap();
        store.save(&opaque).unwrap();

        assert_eq!(store.load().unwrap(), Some(opaque));
        assert_eq!(store.stored_expiry_ms().unwrap(), None);
    }

    #[test]
    fn test_load_empty_store() {
        let store = SqliteCredentialStore::in_memory().unwrap();
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(store.stored_expiry_ms().unwrap(), None);
    }

    #[test]
    fn test_refresh_token_alone_is_treated_as_absent() {
        let store = SqliteCredentialStore::in_memory().unwrap();
        {
            let conn = store.conn.lock();
            conn.execute(
                "INSERT INTO session_kv (key, value) VALUES (?1, ?2)",
                [REFRESH_TOKEN_KEY, "refresh-only"],
            )
            .unwrap();
        }
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_access_token_alone_is_treated_as_absent() {
        let store = SqliteCredentialStore::in_memory().unwrap();
        {
            let conn = store.conn.lock();
            conn.execute(
                "INSERT INTO session_kv (key, value) VALUES (?1, ?2)",
                [ACCESS_TOKEN_KEY, "access-only"],
            )
            .unwrap();
        }
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let store = SqliteCredentialStore::in_memory().unwrap();
        store.clear().unwrap();

        store.save(&credential(1_800_000_000)).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();

        assert_eq!(store.load().unwrap(), None);
        assert_eq!(store.stored_expiry_ms().unwrap(), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.sqlite3");
        let saved = credential(1_900_000_000);

        {
            let store = SqliteCredentialStore::open(&path).unwrap();
            store.save(&saved).unwrap();
        }

        let reopened = SqliteCredentialStore::open(&path).unwrap();
        assert_eq!(reopened.load().unwrap(), Some(saved));
    }
}
