//! Snapshot persistence for the local store
//!
//! The store is saved whole after every committed mutation and loaded once at
//! startup. SQLite keeps one row per project holding its JSON document; the
//! file backend writes a single pretty-printed JSON document.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::config::PersistenceBackend;
use crate::models::Project;
use crate::store::StoreSnapshot;

/// Pluggable load/save of the full store state
pub trait SnapshotStore: Send + Sync {
    /// `None` when nothing has been saved yet
    fn load(&self) -> Result<Option<StoreSnapshot>>;
    fn save(&self, snapshot: &StoreSnapshot) -> Result<()>;
}

/// Open the configured backend; `None` for in-memory only
pub fn open_snapshot_store(
    backend: PersistenceBackend,
    path: Option<&Path>,
) -> Result<Option<Arc<dyn SnapshotStore>>> {
    let store: Arc<dyn SnapshotStore> = match (backend, path) {
        (PersistenceBackend::None, _) => return Ok(None),
        (_, None) => anyhow::bail!("Persistence backend {} needs a path", backend),
        (PersistenceBackend::Json, Some(path)) => Arc::new(JsonFileSnapshotStore::new(path)),
        (PersistenceBackend::Sqlite, Some(path)) => Arc::new(SqliteSnapshotStore::open(path)?),
    };
    Ok(Some(store))
}

/// SQLite database wrapper
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Open (creating if needed) a database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open cacp database")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                project_id    TEXT PRIMARY KEY,
                data          TEXT NOT NULL,
                updated_at    INTEGER NOT NULL,
                created_at    INTEGER NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create projects table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get a single project row
    pub fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM projects WHERE project_id = ?1")?;

        let result = stmt.query_row(params![project_id], |row| {
            let data_str: String = row.get(0)?;
            serde_json::from_str::<Project>(&data_str)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        });

        match result {
            Ok(project) => Ok(Some(project)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn load(&self) -> Result<Option<StoreSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM projects ORDER BY created_at, project_id")?;

        let rows = stmt.query_map([], |row| {
            let data_str: String = row.get(0)?;
            serde_json::from_str::<Project>(&data_str)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;

        let projects = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read projects")?;
        if projects.is_empty() {
            return Ok(None);
        }
        Ok(Some(StoreSnapshot { projects }))
    }

    fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("Failed to begin transaction")?;

        tx.execute("DELETE FROM projects", [])
            .context("Failed to clear projects")?;
        for project in &snapshot.projects {
            let data_json =
                serde_json::to_string(project).context("Failed to serialize project")?;
            tx.execute(
                r#"
                INSERT INTO projects (project_id, data, updated_at, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    project.project_id,
                    data_json,
                    project.updated_at.timestamp_millis(),
                    project.created_at.timestamp_millis()
                ],
            )
            .context("Failed to insert project")?;
        }

        tx.commit().context("Failed to commit snapshot")?;
        Ok(())
    }
}

/// Single JSON document on disk
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileSnapshotStore {
    fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path).context("Failed to read snapshot file")?;
        let snapshot = serde_json::from_str(&json).context("Failed to parse snapshot file")?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create snapshot directory")?;
        }
        let json = serde_json::to_string_pretty(snapshot).context("Failed to serialize snapshot")?;

        // Write beside the target then rename so a crash never leaves half a file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).context("Failed to write snapshot file")?;
        fs::rename(&tmp, &self.path).context("Failed to replace snapshot file")?;
        Ok(())
    }
}
