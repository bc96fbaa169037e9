use anyhow::Result;
use chrono::Utc;
use promptgate_core::{AutoOverrideEntry, EditableChatRequest, runtime_dir};
use rusqlite::{Connection, params};
use std::fs;
use std::path::{Path, PathBuf};

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS request_cache (
        session_key TEXT PRIMARY KEY,
        payload TEXT NOT NULL,
        updated_at TEXT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS workspace_overrides (
        kind TEXT NOT NULL,
        label TEXT NOT NULL,
        payload TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (kind, label)
     );",
)];

/// Durable snapshot store for editable-request state and workspace-scope
/// auto-override entries. Payloads are opaque JSON blobs keyed by string;
/// corrupt or missing entries degrade to "nothing cached" rather than
/// failing the caller.
pub struct Store {
    pub root: PathBuf,
    db_path: PathBuf,
}

impl Store {
    pub fn new(workspace: &Path) -> Result<Self> {
        let root = runtime_dir(workspace);
        fs::create_dir_all(&root)?;
        let db_path = root.join("store.sqlite");
        let store = Self { root, db_path };
        store.init_db()?;
        Ok(store)
    }

    pub fn db(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
             );",
        )?;

        for (version, sql) in MIGRATIONS {
            let already: i64 = conn.query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                [*version],
                |r| r.get(0),
            )?;
            if already == 0 {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, Utc::now().to_rfc3339()],
                )?;
            }
        }
        Ok(())
    }

    pub fn save_request_snapshot(&self, request: &EditableChatRequest) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT OR REPLACE INTO request_cache (session_key, payload, updated_at)
             VALUES (?1, ?2, ?3)",
            params![
                request.key.storage_key(),
                serde_json::to_string(request)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load a cached request by storage key. A row whose payload no longer
    /// deserializes is treated as absent.
    pub fn load_request_snapshot(&self, storage_key: &str) -> Result<Option<EditableChatRequest>> {
        let conn = self.db()?;
        let mut stmt =
            conn.prepare("SELECT payload FROM request_cache WHERE session_key = ?1")?;
        let mut rows = stmt.query([storage_key])?;
        if let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            return Ok(serde_json::from_str(&payload).ok());
        }
        Ok(None)
    }

    pub fn remove_request_snapshot(&self, storage_key: &str) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "DELETE FROM request_cache WHERE session_key = ?1",
            [storage_key],
        )?;
        Ok(())
    }

    pub fn list_request_keys(&self) -> Result<Vec<String>> {
        let conn = self.db()?;
        let mut stmt =
            conn.prepare("SELECT session_key FROM request_cache ORDER BY session_key ASC")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn save_workspace_override(&self, entry: &AutoOverrideEntry) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT OR REPLACE INTO workspace_overrides (kind, label, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.kind.to_string(),
                entry.label,
                serde_json::to_string(entry)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All persisted workspace-scope overrides. Rows that fail to
    /// deserialize are skipped.
    pub fn load_workspace_overrides(&self) -> Result<Vec<AutoOverrideEntry>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM workspace_overrides ORDER BY kind ASC, label ASC",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let payload = row?;
            if let Ok(entry) = serde_json::from_str::<AutoOverrideEntry>(&payload) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    pub fn remove_workspace_override(&self, kind: &str, label: &str) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "DELETE FROM workspace_overrides WHERE kind = ?1 AND label = ?2",
            params![kind, label],
        )?;
        Ok(())
    }

    pub fn clear_workspace_overrides(&self) -> Result<usize> {
        let conn = self.db()?;
        let removed = conn.execute("DELETE FROM workspace_overrides", [])?;
        Ok(removed)
    }
}
