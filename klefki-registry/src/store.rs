//! Persistent machine registry with SQLite.
//!
//! Writes go straight to the database; lookups on the request path are
//! served from an in-memory snapshot swapped atomically after every write
//! and on [`MachineStore::refresh_cache`]. Writes by other processes are
//! noticed through SQLite's `data_version` in [`MachineStore::sync`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, SecondsFormat, Utc};
use klefki_auth::{Fingerprint, PublicKey};
use klefki_core::{MachineId, MachineIdentity, MachineRegistry, RegistryError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

type Snapshot = HashMap<MachineId, MachineIdentity>;

/// A registered machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRecord {
    /// Fingerprint of `public_key`.
    pub id: MachineId,
    pub name: String,
    pub public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Durable storage for registered machines.
pub struct MachineStore {
    pool: SqlitePool,
    cache: ArcSwap<Snapshot>,
    /// `PRAGMA data_version` when the snapshot was last rebuilt.
    seen_version: AtomicI64,
}

impl MachineStore {
    /// Open or create a registry database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                sqlx::Error::Configuration(
                    format!("failed to create registry directory: {e}").into(),
                )
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite performs best with single writer
            .connect_with(options)
            .await?;

        Self::new(pool).await
    }

    /// Create a store on an existing pool.
    ///
    /// Creates the table if it doesn't exist and pre-populates the cache.
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS machines (
                id TEXT PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                public_key BLOB NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let store = Self {
            pool,
            cache: ArcSwap::from_pointee(HashMap::new()),
            seen_version: AtomicI64::new(-1),
        };
        store.refresh_cache().await?;

        Ok(store)
    }

    /// Rebuild the lookup snapshot from the database and swap it in.
    ///
    /// Rows with an unusable public key are left out and logged.
    pub async fn refresh_cache(&self) -> Result<usize, StoreError> {
        // Read before the rows: a commit landing in between bumps the
        // version again and the next sync reloads.
        let version = self.data_version().await?;
        let rows = sqlx::query("SELECT id, public_key FROM machines")
            .fetch_all(&self.pool)
            .await?;

        let mut snapshot = HashMap::with_capacity(rows.len());
        for row in rows {
            let id = MachineId::new(row.try_get::<String, _>("id")?);
            let public_key: Vec<u8> = row.try_get("public_key")?;

            if let Err(e) = PublicKey::from_bytes(&public_key) {
                tracing::warn!(machine_id = %id, error = %e, "Skipping machine with invalid public key");
                continue;
            }

            snapshot.insert(id.clone(), MachineIdentity::new(id, public_key));
        }

        let count = snapshot.len();
        self.cache.store(Arc::new(snapshot));
        self.seen_version.store(version, Ordering::Release);
        Ok(count)
    }

    /// Reload the snapshot if another connection committed since the last
    /// reload. Returns whether it reloaded.
    ///
    /// Costs one pragma query when nothing changed, so the broker runs it
    /// before every lookup; `klefkictl machines new/delete` take effect on
    /// the next request.
    pub async fn sync(&self) -> Result<bool, StoreError> {
        if self.data_version().await? == self.seen_version.load(Ordering::Acquire) {
            return Ok(false);
        }
        let machines = self.refresh_cache().await?;
        tracing::debug!(machines, "Registry changed on disk, snapshot reloaded");
        Ok(true)
    }

    // Per connection: only commits from other connections change it. The
    // pool holds a single connection; if it is replaced the value differs
    // and costs one extra reload.
    async fn data_version(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>("PRAGMA data_version")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Register a machine. Its id is the fingerprint of `public_key`.
    pub async fn create(
        &self,
        name: &str,
        public_key: &PublicKey,
    ) -> Result<MachineRecord, StoreError> {
        let record = MachineRecord {
            id: Fingerprint::from_public_key(public_key).into(),
            name: name.to_string(),
            public_key: public_key.to_bytes().to_vec(),
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO machines (id, name, public_key, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.name)
        .bind(&record.public_key)
        .bind(record.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .execute(&self.pool)
        .await
        .map_err(|e| classify_insert_error(e, name))?;

        let identity = MachineIdentity::new(record.id.clone(), record.public_key.clone());
        self.cache.rcu(|old| {
            let mut snapshot = (**old).clone();
            snapshot.insert(identity.id.clone(), identity.clone());
            Arc::new(snapshot)
        });

        tracing::info!(machine_id = %record.id, name = %record.name, "Machine registered");
        Ok(record)
    }

    /// Fetch one machine from the database.
    pub async fn get(&self, id: &MachineId) -> Result<Option<MachineRecord>, StoreError> {
        let row = sqlx::query("SELECT id, name, public_key, created_at FROM machines WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(parse_machine_row).transpose()
    }

    /// All machines, oldest first.
    pub async fn list(&self) -> Result<Vec<MachineRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, public_key, created_at FROM machines ORDER BY created_at, name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_machine_row).collect()
    }

    /// Remove a machine. Returns `false` if it was not registered.
    pub async fn delete(&self, id: &MachineId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM machines WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;

        if deleted {
            self.cache.rcu(|old| {
                let mut snapshot = (**old).clone();
                snapshot.remove(id);
                Arc::new(snapshot)
            });
            tracing::info!(machine_id = %id, "Machine deleted");
        }

        Ok(deleted)
    }

    /// Number of machines in the lookup snapshot.
    pub fn cached_len(&self) -> usize {
        self.cache.load().len()
    }
}

impl MachineRegistry for MachineStore {
    fn lookup(&self, id: &MachineId) -> Result<Option<MachineIdentity>, RegistryError> {
        Ok(self.cache.load().get(id).cloned())
    }
}

fn classify_insert_error(err: sqlx::Error, name: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            // SQLite reports the offending column: "UNIQUE constraint failed: machines.name"
            return if db_err.message().contains("machines.name") {
                StoreError::DuplicateName(name.to_string())
            } else {
                StoreError::DuplicateMachine
            };
        }
    }
    StoreError::Database(err)
}

fn parse_machine_row(row: &SqliteRow) -> Result<MachineRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StoreError::Corrupt(format!("machine {id}: invalid created_at: {e}")))?
        .with_timezone(&Utc);

    Ok(MachineRecord {
        id: MachineId::new(id),
        name: row.try_get("name")?,
        public_key: row.try_get("public_key")?,
        created_at,
    })
}

/// Errors that can occur during registry operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("a machine named {0:?} already exists")]
    DuplicateName(String),
    #[error("a machine with this public key is already registered")]
    DuplicateMachine,
    #[error("corrupt registry row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        RegistryError(err.to_string())
    }
}
