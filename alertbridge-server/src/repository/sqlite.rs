//! SQLite implementation of `PluginDataRepository`.
//!
//! This provides persistent storage that survives service restarts.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`.
//!
//! # Forward Compatibility
//!
//! Plugin data is stored as JSON. New fields on `PluginData` must carry
//! `#[serde(default)]` so rows written by older versions still decode.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use alertbridge_core::{PluginData, RequestId};

use super::PluginDataRepository;
use crate::error::RepositoryError;

/// Current schema version.
const CURRENT_SCHEMA_VERSION: i64 = 2;

/// SQLite-backed plugin data repository.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime. A single connection behind a mutex
/// makes every `put` atomic with respect to other calls.
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and run pending migrations.
    ///
    /// The database is configured with `journal_mode = WAL`,
    /// `synchronous = FULL` and a 5 second busy timeout.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        #[cfg(unix)]
        if !is_in_memory {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite silently keeps another journal mode on filesystems without
        // shared memory support, so the result has to be checked.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure database", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database. Used by tests.
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS plugin_data (
                    request_id TEXT PRIMARY KEY,
                    data_json TEXT NOT NULL
                );
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        // Version 2: denormalized columns for operators querying the database
        // directly, e.g. to find alerts that never got resolved.
        if from_version < 2 {
            conn.execute_batch(
                r#"
                ALTER TABLE plugin_data ADD COLUMN alert_id TEXT;
                ALTER TABLE plugin_data ADD COLUMN resolution TEXT NOT NULL DEFAULT 'unresolved';
                ALTER TABLE plugin_data ADD COLUMN updated_at INTEGER NOT NULL DEFAULT 0;
                CREATE INDEX IF NOT EXISTS idx_unresolved
                    ON plugin_data(resolution) WHERE resolution = 'unresolved';
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v2", e.to_string()))?;
        }

        conn.execute(
            "INSERT INTO schema_version (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, RepositoryError> {
    conn.lock()
        .map_err(|_| RepositoryError::storage("lock connection", "connection mutex poisoned"))
}

fn decode(json: &str) -> Result<PluginData, RepositoryError> {
    serde_json::from_str(json).map_err(|_| RepositoryError::corruption("plugin data JSON"))
}

#[async_trait]
impl PluginDataRepository for SqliteRepository {
    async fn get(&self, id: &RequestId) -> Result<Option<PluginData>, RepositoryError> {
        let conn = self.conn.clone();
        let request_id = id.0.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT data_json FROM plugin_data WHERE request_id = ?1",
                    params![request_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("get", e.to_string()))?;

            json.as_deref().map(decode).transpose()
        })
        .await
        .map_err(|e| RepositoryError::storage("get", e.to_string()))?
    }

    async fn put(&self, id: &RequestId, data: PluginData) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let request_id = id.0.clone();

        let data_json = serde_json::to_string(&data)
            .map_err(|e| RepositoryError::storage("serialize plugin data", e.to_string()))?;
        let alert_id = data.alert_id.map(|a| a.0);
        let resolution = data.resolution.tag.to_string();
        let updated_at = chrono::Utc::now().timestamp();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT INTO plugin_data (request_id, data_json, alert_id, resolution, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(request_id) DO UPDATE SET
                     data_json = excluded.data_json,
                     alert_id = excluded.alert_id,
                     resolution = excluded.resolution,
                     updated_at = excluded.updated_at",
                params![request_id, data_json, alert_id, resolution, updated_at],
            )
            .map_err(|e| RepositoryError::storage("put", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| RepositoryError::storage("put", e.to_string()))?
    }

    async fn get_all(&self) -> Result<Vec<(RequestId, PluginData)>, RepositoryError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn
                .prepare("SELECT request_id, data_json FROM plugin_data ORDER BY request_id")
                .map_err(|e| RepositoryError::storage("get_all", e.to_string()))?;

            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(|e| RepositoryError::storage("get_all", e.to_string()))?;

            let mut results = Vec::new();
            for row in rows {
                let (request_id, json) =
                    row.map_err(|e| RepositoryError::storage("get_all", e.to_string()))?;
                match decode(&json) {
                    Ok(data) => results.push((RequestId(request_id), data)),
                    Err(e) => warn!("Skipping plugin data for {}: {}", request_id, e),
                }
            }
            Ok(results)
        })
        .await
        .map_err(|e| RepositoryError::storage("get_all", e.to_string()))?
    }
}
