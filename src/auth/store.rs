// Durable credential storage

use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, RwLock};
use thiserror::Error;

use super::types::{Credential, CredentialRecord, User};

const CREDENTIAL_KEY: &str = "film:credential";
const USER_KEY: &str = "film:user";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stored credential is corrupt: {0}")]
    Corrupt(String),

    #[error("Credential store lock poisoned")]
    Poisoned,
}

/// Process-wide credential state, shared by every execution context.
///
/// Pure storage: no expiry or validation decisions are made here.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Result<Option<Credential>, StoreError>;

    fn set(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Remove the credential and the user mirror
    fn clear(&self) -> Result<(), StoreError>;

    fn get_user(&self) -> Result<Option<User>, StoreError>;

    fn set_user(&self, user: Option<&User>) -> Result<(), StoreError>;
}

/// Credential store backed by an `auth_kv` SQLite table
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        tracing::info!("Opening credential store: {}", path.display());
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let value = conn
            .query_row("SELECT value FROM auth_kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute("DELETE FROM auth_kv WHERE key = ?1", [key])?;
        Ok(())
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn get(&self) -> Result<Option<Credential>, StoreError> {
        let Some(json) = self.read(CREDENTIAL_KEY)? else {
            return Ok(None);
        };
        let record: CredentialRecord = serde_json::from_str(&json)?;
        Credential::try_from(record)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn set(&self, credential: &Credential) -> Result<(), StoreError> {
        let json = serde_json::to_string(&CredentialRecord::from(credential))?;
        self.write(CREDENTIAL_KEY, &json)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.remove(CREDENTIAL_KEY)?;
        self.remove(USER_KEY)
    }

    fn get_user(&self) -> Result<Option<User>, StoreError> {
        match self.read(USER_KEY)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(None),
        }
    }

    fn set_user(&self, user: Option<&User>) -> Result<(), StoreError> {
        match user {
            Some(user) => self.write(USER_KEY, &serde_json::to_string(user)?),
            None => self.remove(USER_KEY),
        }
    }
}

/// In-memory credential store
#[derive(Default)]
pub struct MemoryCredentialStore {
    credential: RwLock<Option<Credential>>,
    user: RwLock<Option<User>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<Option<Credential>, StoreError> {
        Ok(self.credential.read().map_err(|_| StoreError::Poisoned)?.clone())
    }

    fn set(&self, credential: &Credential) -> Result<(), StoreError> {
        *self.credential.write().map_err(|_| StoreError::Poisoned)? = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.credential.write().map_err(|_| StoreError::Poisoned)? = None;
        *self.user.write().map_err(|_| StoreError::Poisoned)? = None;
        Ok(())
    }

    fn get_user(&self) -> Result<Option<User>, StoreError> {
        Ok(self.user.read().map_err(|_| StoreError::Poisoned)?.clone())
    }

    fn set_user(&self, user: Option<&User>) -> Result<(), StoreError> {
        *self.user.write().map_err(|_| StoreError::Poisoned)? = user.cloned();
        Ok(())
    }
}
