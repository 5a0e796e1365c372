// src/storage.rs
// The `Storage` port (spec section 6/9 design note: "re-architect as an
// explicit Storage trait/interface parameter threaded through
// constructors"). Persists workspace descriptors, own credentials,
// identities and the rendezvous address list. `SqliteStorage` is grounded
// in the teacher's `db.rs` (`Mutex<Connection>` + `run_migrations`); tests
// use `InMemoryStorage`.

use crate::error::StorageError;
use crate::model::{WorkspaceCredentials, WorkspaceInfo};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::RwLock;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_workspace(&self, mnemonic: &str) -> Result<Option<WorkspaceInfo>, StorageError>;
    async fn put_workspace(&self, info: &WorkspaceInfo) -> Result<(), StorageError>;
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceInfo>, StorageError>;

    async fn get_credentials(&self, mnemonic: &str) -> Result<Option<WorkspaceCredentials>, StorageError>;
    async fn put_credentials(&self, credentials: &WorkspaceCredentials) -> Result<(), StorageError>;

    async fn get_rendezvous_addresses(&self) -> Result<Vec<String>, StorageError>;
    async fn put_rendezvous_addresses(&self, addresses: &[String]) -> Result<(), StorageError>;
}

/// In-memory implementation for tests (`tests/scenarios.rs` and module unit
/// tests) and ephemeral embeddings.
#[derive(Default)]
pub struct InMemoryStorage {
    workspaces: RwLock<HashMap<String, WorkspaceInfo>>,
    credentials: RwLock<HashMap<String, WorkspaceCredentials>>,
    rendezvous_addresses: RwLock<Vec<String>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_workspace(&self, mnemonic: &str) -> Result<Option<WorkspaceInfo>, StorageError> {
        Ok(self.workspaces.read().await.get(mnemonic).cloned())
    }

    async fn put_workspace(&self, info: &WorkspaceInfo) -> Result<(), StorageError> {
        self.workspaces
            .write()
            .await
            .insert(info.mnemonic.clone(), info.clone());
        Ok(())
    }

    async fn list_workspaces(&self) -> Result<Vec<WorkspaceInfo>, StorageError> {
        Ok(self.workspaces.read().await.values().cloned().collect())
    }

    async fn get_credentials(&self, mnemonic: &str) -> Result<Option<WorkspaceCredentials>, StorageError> {
        Ok(self.credentials.read().await.get(mnemonic).cloned())
    }

    async fn put_credentials(&self, credentials: &WorkspaceCredentials) -> Result<(), StorageError> {
        self.credentials
            .write()
            .await
            .insert(credentials.mnemonic.clone(), credentials.clone());
        Ok(())
    }

    async fn get_rendezvous_addresses(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.rendezvous_addresses.read().await.clone())
    }

    async fn put_rendezvous_addresses(&self, addresses: &[String]) -> Result<(), StorageError> {
        *self.rendezvous_addresses.write().await = addresses.to_vec();
        Ok(())
    }
}

/// SQLite-backed implementation, grounded in the teacher's `db.rs`: a single
/// `Mutex<Connection>`, WAL journal mode, migrations run once at open.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: PathBuf) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        let storage = SqliteStorage { conn: Mutex::new(conn) };
        storage.run_migrations()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::Backend(e.to_string()))?;
        let storage = SqliteStorage { conn: Mutex::new(conn) };
        storage.run_migrations()?;
        Ok(storage)
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS workspaces (
                mnemonic TEXT PRIMARY KEY,
                descriptor_json TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS credentials (
                mnemonic TEXT PRIMARY KEY,
                credentials_json TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS rendezvous_addresses (
                position INTEGER PRIMARY KEY,
                address TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_workspace(&self, mnemonic: &str) -> Result<Option<WorkspaceInfo>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT descriptor_json FROM workspaces WHERE mnemonic = ?1")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut rows = stmt
            .query(params![mnemonic])
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        match rows.next().map_err(|e| StorageError::Backend(e.to_string()))? {
            Some(row) => {
                let json: String = row.get(0).map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn put_workspace(&self, info: &WorkspaceInfo) -> Result<(), StorageError> {
        let json = serde_json::to_string(info)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workspaces (mnemonic, descriptor_json) VALUES (?1, ?2)
             ON CONFLICT(mnemonic) DO UPDATE SET descriptor_json = excluded.descriptor_json",
            params![info.mnemonic, json],
        )
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn list_workspaces(&self) -> Result<Vec<WorkspaceInfo>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT descriptor_json FROM workspaces")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let json = row.map_err(|e| StorageError::Backend(e.to_string()))?;
            out.push(serde_json::from_str(&json)?);
        }
        Ok(out)
    }

    async fn get_credentials(&self, mnemonic: &str) -> Result<Option<WorkspaceCredentials>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT credentials_json FROM credentials WHERE mnemonic = ?1")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut rows = stmt
            .query(params![mnemonic])
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        match rows.next().map_err(|e| StorageError::Backend(e.to_string()))? {
            Some(row) => {
                let json: String = row.get(0).map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn put_credentials(&self, credentials: &WorkspaceCredentials) -> Result<(), StorageError> {
        let json = serde_json::to_string(credentials)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO credentials (mnemonic, credentials_json) VALUES (?1, ?2)
             ON CONFLICT(mnemonic) DO UPDATE SET credentials_json = excluded.credentials_json",
            params![credentials.mnemonic, json],
        )
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_rendezvous_addresses(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT address FROM rendezvous_addresses ORDER BY position")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StorageError::Backend(e.to_string()))?);
        }
        Ok(out)
    }

    async fn put_rendezvous_addresses(&self, addresses: &[String]) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM rendezvous_addresses", [])
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        for (position, address) in addresses.iter().enumerate() {
            conn.execute(
                "INSERT INTO rendezvous_addresses (position, address) VALUES (?1, ?2)",
                params![position as i64, address],
            )
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}
