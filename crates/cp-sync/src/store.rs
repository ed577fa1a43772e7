//! SQLite persistence for sync sessions and forwards

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use cp_core::error::StoreError;
use cp_core::selector::LabelSelector;
use cp_core::{Clock, SystemClock};

use crate::types::{
    ActualState, DesiredState, Endpoint, ForwardRow, NewForward, NewSession, SessionPatch, SyncSessionRow,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    alpha_root TEXT NOT NULL,
    alpha_host TEXT,
    alpha_port INTEGER,
    beta_root TEXT NOT NULL,
    beta_host TEXT,
    beta_port INTEGER,
    prefer TEXT NOT NULL,
    desired_state TEXT NOT NULL,
    actual_state TEXT NOT NULL,
    scheduler_pid INTEGER,
    ignore_rules TEXT NOT NULL,
    merge_strategy TEXT,
    last_heartbeat INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS session_labels (
    session_id INTEGER NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (session_id, key),
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS forwards (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    target TEXT NOT NULL,
    local_port INTEGER NOT NULL,
    remote_port INTEGER NOT NULL,
    desired_state TEXT NOT NULL,
    actual_state TEXT NOT NULL,
    monitor_pid INTEGER,
    last_heartbeat INTEGER,
    created_at INTEGER NOT NULL
);
"#;

const SESSION_COLUMNS: &str = "id, name, alpha_root, alpha_host, alpha_port, beta_root, beta_host, beta_port, \
     prefer, desired_state, actual_state, scheduler_pid, ignore_rules, merge_strategy, last_heartbeat, created_at";

const FORWARD_COLUMNS: &str =
    "id, name, target, local_port, remote_port, desired_state, actual_state, monitor_pid, last_heartbeat, created_at";

/// Which table a state update applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Sessions,
    Forwards,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Sessions => "sessions",
            Table::Forwards => "forwards",
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Table::Sessions => "sync session",
            Table::Forwards => "forward",
        }
    }

    fn pid_column(self) -> &'static str {
        match self {
            Table::Sessions => "scheduler_pid",
            Table::Forwards => "monitor_pid",
        }
    }
}

fn db_error(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Map a UNIQUE violation on `name` to [`StoreError::Duplicate`]
fn insert_error(kind: &'static str, name: &str, e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => StoreError::Duplicate {
            kind,
            name: name.to_string(),
        },
        _ => db_error(e),
    }
}

/// Decode a column that holds one of our enum strings
fn parse_column<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = StoreError>,
{
    let raw: String = row.get(index)?;
    raw.parse()
        .map_err(|e: StoreError| rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e)))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SyncSessionRow> {
    let ignore_rules: String = row.get(12)?;
    let ignore_rules = serde_json::from_str(&ignore_rules)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(SyncSessionRow {
        id: row.get(0)?,
        name: row.get(1)?,
        alpha: Endpoint {
            root: row.get(2)?,
            host: row.get(3)?,
            port: row.get(4)?,
        },
        beta: Endpoint {
            root: row.get(5)?,
            host: row.get(6)?,
            port: row.get(7)?,
        },
        prefer: parse_column(row, 8)?,
        desired_state: parse_column(row, 9)?,
        actual_state: parse_column(row, 10)?,
        scheduler_pid: row.get(11)?,
        ignore_rules,
        merge_strategy: row.get(13)?,
        labels: BTreeMap::new(),
        last_heartbeat: row.get::<_, Option<i64>>(14)?.map(|v| v as u64),
        created_at: row.get::<_, i64>(15)? as u64,
    })
}

fn forward_from_row(row: &Row<'_>) -> rusqlite::Result<ForwardRow> {
    Ok(ForwardRow {
        id: row.get(0)?,
        name: row.get(1)?,
        target: row.get(2)?,
        local_port: row.get(3)?,
        remote_port: row.get(4)?,
        desired_state: parse_column(row, 5)?,
        actual_state: parse_column(row, 6)?,
        monitor_pid: row.get(7)?,
        last_heartbeat: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
        created_at: row.get::<_, i64>(9)? as u64,
    })
}

/// Session and forward rows backed by one SQLite database
pub struct SessionStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Database(format!("{}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path).map_err(db_error)?;
        Self::init(conn, clock)
    }

    /// In-memory database (for testing)
    pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::init(conn, clock)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_error)?;
        conn.execute_batch(SCHEMA).map_err(db_error)?;
        tracing::debug!("Session store schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> i64 {
        self.clock.now_millis() as i64
    }

    // Sessions

    pub fn create_session(&self, new: &NewSession) -> Result<SyncSessionRow, StoreError> {
        if new.name.trim().is_empty() {
            return Err(StoreError::Invalid {
                field: "name",
                message: "must not be empty".to_string(),
            });
        }
        let ignore_rules = serde_json::to_string(&new.ignore_rules).map_err(|e| StoreError::Invalid {
            field: "ignore_rules",
            message: e.to_string(),
        })?;

        let id = {
            let mut conn = self.conn();
            let tx = conn.transaction().map_err(db_error)?;
            tx.execute(
                "INSERT INTO sessions (name, alpha_root, alpha_host, alpha_port, beta_root, beta_host, beta_port, \
                 prefer, desired_state, actual_state, ignore_rules, merge_strategy, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    new.name,
                    new.alpha.root,
                    new.alpha.host,
                    new.alpha.port,
                    new.beta.root,
                    new.beta.host,
                    new.beta.port,
                    new.prefer.as_str(),
                    new.desired_state.as_str(),
                    ActualState::Stopped.as_str(),
                    ignore_rules,
                    new.merge_strategy,
                    self.now(),
                ],
            )
            .map_err(|e| insert_error(Table::Sessions.kind(), &new.name, e))?;
            let id = tx.last_insert_rowid();
            for (key, value) in &new.labels {
                tx.execute(
                    "INSERT INTO session_labels (session_id, key, value) VALUES (?1, ?2, ?3)",
                    params![id, key, value],
                )
                .map_err(db_error)?;
            }
            tx.commit().map_err(db_error)?;
            id
        };

        tracing::info!(session = id, name = %new.name, "Sync session created");
        self.session_by_id(id)
    }

    fn session_by_id(&self, id: i64) -> Result<SyncSessionRow, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![id],
                session_from_row,
            )
            .optional()
            .map_err(db_error)?;
        let mut row = row.ok_or_else(|| StoreError::NotFound {
            kind: Table::Sessions.kind(),
            key: id.to_string(),
        })?;
        row.labels = Self::labels(&conn, id)?;
        Ok(row)
    }

    fn labels(conn: &Connection, id: i64) -> Result<BTreeMap<String, String>, StoreError> {
        let mut stmt = conn
            .prepare("SELECT key, value FROM session_labels WHERE session_id = ?1")
            .map_err(db_error)?;
        let labels = stmt
            .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_error)?
            .collect::<rusqlite::Result<BTreeMap<String, String>>>()
            .map_err(db_error)?;
        Ok(labels)
    }

    /// Look a session up by numeric id or by name
    pub fn session(&self, key: &str) -> Result<SyncSessionRow, StoreError> {
        let id = self.resolve(Table::Sessions, key)?;
        self.session_by_id(id)
    }

    /// Sessions matching `selector`, in id order
    pub fn list_sessions(&self, selector: &LabelSelector) -> Result<Vec<SyncSessionRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM sessions ORDER BY id", SESSION_COLUMNS))
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], session_from_row)
            .map_err(db_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error)?;

        let mut selected = Vec::with_capacity(rows.len());
        for mut row in rows {
            row.labels = Self::labels(&conn, row.id)?;
            if selector.matches(&row.labels) {
                selected.push(row);
            }
        }
        Ok(selected)
    }

    pub fn update_session(&self, id: i64, patch: &SessionPatch) -> Result<SyncSessionRow, StoreError> {
        {
            let mut conn = self.conn();
            let tx = conn.transaction().map_err(db_error)?;
            let exists: bool = tx
                .query_row("SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)", params![id], |row| row.get(0))
                .map_err(db_error)?;
            if !exists {
                return Err(StoreError::NotFound {
                    kind: Table::Sessions.kind(),
                    key: id.to_string(),
                });
            }

            if let Some(name) = &patch.name {
                tx.execute("UPDATE sessions SET name = ?1 WHERE id = ?2", params![name, id])
                    .map_err(|e| insert_error(Table::Sessions.kind(), name, e))?;
            }
            if let Some(prefer) = patch.prefer {
                tx.execute("UPDATE sessions SET prefer = ?1 WHERE id = ?2", params![prefer.as_str(), id])
                    .map_err(db_error)?;
            }
            if let Some(rules) = &patch.ignore_rules {
                let json = serde_json::to_string(rules).map_err(|e| StoreError::Invalid {
                    field: "ignore_rules",
                    message: e.to_string(),
                })?;
                tx.execute("UPDATE sessions SET ignore_rules = ?1 WHERE id = ?2", params![json, id])
                    .map_err(db_error)?;
            }
            if let Some(strategy) = &patch.merge_strategy {
                tx.execute("UPDATE sessions SET merge_strategy = ?1 WHERE id = ?2", params![strategy, id])
                    .map_err(db_error)?;
            }
            for key in &patch.remove_labels {
                tx.execute(
                    "DELETE FROM session_labels WHERE session_id = ?1 AND key = ?2",
                    params![id, key],
                )
                .map_err(db_error)?;
            }
            for (key, value) in &patch.set_labels {
                tx.execute(
                    "INSERT OR REPLACE INTO session_labels (session_id, key, value) VALUES (?1, ?2, ?3)",
                    params![id, key, value],
                )
                .map_err(db_error)?;
            }
            tx.commit().map_err(db_error)?;
        }
        self.session_by_id(id)
    }

    pub fn remove_session(&self, id: i64) -> Result<(), StoreError> {
        self.remove(Table::Sessions, id)
    }

    pub fn set_session_desired(&self, id: i64, state: DesiredState) -> Result<(), StoreError> {
        self.set_text(Table::Sessions, id, "desired_state", state.as_str())
    }

    pub fn set_session_actual(&self, id: i64, state: ActualState) -> Result<(), StoreError> {
        self.set_text(Table::Sessions, id, "actual_state", state.as_str())
    }

    pub fn set_scheduler_pid(&self, id: i64, pid: Option<u32>) -> Result<(), StoreError> {
        self.set_pid(Table::Sessions, id, pid)
    }

    pub fn session_heartbeat(&self, id: i64) -> Result<(), StoreError> {
        self.heartbeat(Table::Sessions, id)
    }

    // Forwards

    pub fn create_forward(&self, new: &NewForward) -> Result<ForwardRow, StoreError> {
        if new.name.trim().is_empty() {
            return Err(StoreError::Invalid {
                field: "name",
                message: "must not be empty".to_string(),
            });
        }
        let id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO forwards (name, target, local_port, remote_port, desired_state, actual_state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.name,
                    new.target,
                    new.local_port,
                    new.remote_port,
                    new.desired_state.as_str(),
                    ActualState::Stopped.as_str(),
                    self.now(),
                ],
            )
            .map_err(|e| insert_error(Table::Forwards.kind(), &new.name, e))?;
            conn.last_insert_rowid()
        };
        tracing::info!(forward = id, name = %new.name, "Forward created");
        self.forward_by_id(id)
    }

    fn forward_by_id(&self, id: i64) -> Result<ForwardRow, StoreError> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM forwards WHERE id = ?1", FORWARD_COLUMNS),
                params![id],
                forward_from_row,
            )
            .optional()
            .map_err(db_error)?
            .ok_or_else(|| StoreError::NotFound {
                kind: Table::Forwards.kind(),
                key: id.to_string(),
            })
    }

    /// Look a forward up by numeric id or by name
    pub fn forward(&self, key: &str) -> Result<ForwardRow, StoreError> {
        let id = self.resolve(Table::Forwards, key)?;
        self.forward_by_id(id)
    }

    pub fn list_forwards(&self) -> Result<Vec<ForwardRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM forwards ORDER BY id", FORWARD_COLUMNS))
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], forward_from_row)
            .map_err(db_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error)?;
        Ok(rows)
    }

    pub fn remove_forward(&self, id: i64) -> Result<(), StoreError> {
        self.remove(Table::Forwards, id)
    }

    pub fn set_forward_desired(&self, id: i64, state: DesiredState) -> Result<(), StoreError> {
        self.set_text(Table::Forwards, id, "desired_state", state.as_str())
    }

    pub fn set_forward_actual(&self, id: i64, state: ActualState) -> Result<(), StoreError> {
        self.set_text(Table::Forwards, id, "actual_state", state.as_str())
    }

    pub fn set_monitor_pid(&self, id: i64, pid: Option<u32>) -> Result<(), StoreError> {
        self.set_pid(Table::Forwards, id, pid)
    }

    pub fn forward_heartbeat(&self, id: i64) -> Result<(), StoreError> {
        self.heartbeat(Table::Forwards, id)
    }

    // Shared helpers

    /// Numeric keys are ids; anything else (or an id with no row) is a name
    fn resolve(&self, table: Table, key: &str) -> Result<i64, StoreError> {
        let conn = self.conn();
        if let Ok(id) = key.parse::<i64>() {
            let found: Option<i64> = conn
                .query_row(&format!("SELECT id FROM {} WHERE id = ?1", table.name()), params![id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(db_error)?;
            if let Some(id) = found {
                return Ok(id);
            }
        }
        conn.query_row(&format!("SELECT id FROM {} WHERE name = ?1", table.name()), params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(db_error)?
        .ok_or_else(|| StoreError::NotFound {
            kind: table.kind(),
            key: key.to_string(),
        })
    }

    fn set_text(&self, table: Table, id: i64, column: &'static str, value: &str) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                &format!("UPDATE {} SET {} = ?1 WHERE id = ?2", table.name(), column),
                params![value, id],
            )
            .map_err(db_error)?;
        Self::expect_row(table, id, changed)
    }

    fn set_pid(&self, table: Table, id: i64, pid: Option<u32>) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                &format!("UPDATE {} SET {} = ?1 WHERE id = ?2", table.name(), table.pid_column()),
                params![pid, id],
            )
            .map_err(db_error)?;
        Self::expect_row(table, id, changed)
    }

    fn heartbeat(&self, table: Table, id: i64) -> Result<(), StoreError> {
        let now = self.now();
        let changed = self
            .conn()
            .execute(
                &format!("UPDATE {} SET last_heartbeat = ?1 WHERE id = ?2", table.name()),
                params![now, id],
            )
            .map_err(db_error)?;
        Self::expect_row(table, id, changed)
    }

    fn remove(&self, table: Table, id: i64) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(&format!("DELETE FROM {} WHERE id = ?1", table.name()), params![id])
            .map_err(db_error)?;
        Self::expect_row(table, id, changed)?;
        tracing::info!(id, "Removed {}", table.kind());
        Ok(())
    }

    fn expect_row(table: Table, id: i64, changed: usize) -> Result<(), StoreError> {
        if changed == 0 {
            Err(StoreError::NotFound {
                kind: table.kind(),
                key: id.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_core::time::ManualClock;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store() -> (Arc<ManualClock>, SessionStore) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = SessionStore::in_memory(clock.clone()).unwrap();
        (clock, store)
    }

    fn session(name: &str, labels: &[(&str, &str)]) -> NewSession {
        let mut new = NewSession::new(name, Endpoint::local("/tmp/a"), Endpoint::parse("box:2222:/srv/b").unwrap());
        new.labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        new.ignore_rules = vec!["*.o".to_string(), "target/".to_string()];
        new
    }

    #[test]
    fn test_create_and_lookup() {
        let (_clock, store) = store();
        let created = store.create_session(&session("docs", &[("env", "prod")])).unwrap();

        assert_eq!(created.name, "docs");
        assert_eq!(created.desired_state, DesiredState::Running);
        assert_eq!(created.actual_state, ActualState::Stopped);
        assert_eq!(created.beta.host.as_deref(), Some("box"));
        assert_eq!(created.beta.port, Some(2222));
        assert_eq!(created.ignore_rules, vec!["*.o", "target/"]);
        assert_eq!(created.labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(created.created_at, 1_000);

        assert_eq!(store.session("docs").unwrap(), created);
        assert_eq!(store.session(&created.id.to_string()).unwrap(), created);
        assert!(matches!(store.session("nope"), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_duplicate_name() {
        let (_clock, store) = store();
        store.create_session(&session("docs", &[])).unwrap();
        let err = store.create_session(&session("docs", &[])).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[test]
    fn test_list_with_selector() {
        let (_clock, store) = store();
        store.create_session(&session("a", &[("env", "prod")])).unwrap();
        store.create_session(&session("b", &[("env", "prod"), ("archived", "yes")])).unwrap();
        store.create_session(&session("c", &[("env", "dev")])).unwrap();

        let selector = LabelSelector::parse(&["env=prod", "!archived"]).unwrap();
        let names: Vec<_> = store
            .list_sessions(&selector)
            .unwrap()
            .into_iter()
            .map(|row| row.name)
            .collect();
        assert_eq!(names, vec!["a"]);

        assert_eq!(store.list_sessions(&LabelSelector::default()).unwrap().len(), 3);
    }

    #[test]
    fn test_update_session() {
        let (_clock, store) = store();
        let row = store.create_session(&session("a", &[("env", "prod"), ("team", "x")])).unwrap();

        let mut patch = SessionPatch {
            name: Some("renamed".to_string()),
            merge_strategy: Some("lww".to_string()),
            remove_labels: vec!["team".to_string()],
            ..SessionPatch::default()
        };
        patch.set_labels.insert("env".to_string(), "dev".to_string());
        let updated = store.update_session(row.id, &patch).unwrap();

        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.merge_strategy.as_deref(), Some("lww"));
        assert_eq!(updated.labels.len(), 1);
        assert_eq!(updated.labels["env"], "dev");
        assert_eq!(updated.ignore_rules, row.ignore_rules);

        assert!(store.update_session(999, &patch).is_err());
    }

    #[test]
    fn test_state_pid_and_heartbeat() {
        let (clock, store) = store();
        let row = store.create_session(&session("a", &[])).unwrap();

        store.set_session_actual(row.id, ActualState::Running).unwrap();
        store.set_scheduler_pid(row.id, Some(4242)).unwrap();
        clock.advance(Duration::from_secs(5));
        store.session_heartbeat(row.id).unwrap();

        let row = store.session("a").unwrap();
        assert_eq!(row.actual_state, ActualState::Running);
        assert_eq!(row.scheduler_pid, Some(4242));
        assert_eq!(row.last_heartbeat, Some(6_000));

        store.set_scheduler_pid(row.id, None).unwrap();
        store.set_session_desired(row.id, DesiredState::Stopped).unwrap();
        let row = store.session("a").unwrap();
        assert_eq!(row.scheduler_pid, None);
        assert_eq!(row.desired_state, DesiredState::Stopped);

        assert!(store.set_session_actual(999, ActualState::Error).is_err());
    }

    #[test]
    fn test_remove_cascades_labels() {
        let (_clock, store) = store();
        let row = store.create_session(&session("a", &[("env", "prod")])).unwrap();
        store.remove_session(row.id).unwrap();
        assert!(store.session("a").is_err());
        assert!(store.remove_session(row.id).is_err());

        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM session_labels", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_forwards() {
        let (_clock, store) = store();
        let forward = store
            .create_forward(&NewForward {
                name: "jupyter".to_string(),
                target: "me@box".to_string(),
                local_port: 8888,
                remote_port: 8888,
                desired_state: DesiredState::Running,
            })
            .unwrap();
        assert_eq!(forward.actual_state, ActualState::Stopped);
        assert_eq!(store.forward("jupyter").unwrap(), forward);

        store.set_monitor_pid(forward.id, Some(7)).unwrap();
        store.set_forward_actual(forward.id, ActualState::Running).unwrap();
        let listed = store.list_forwards().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].monitor_pid, Some(7));

        store.remove_forward(forward.id).unwrap();
        assert!(store.list_forwards().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("sessions.db");
        {
            let store = SessionStore::open(&path).unwrap();
            store.create_session(&session("persisted", &[("k", "v")])).unwrap();
        }
        let store = SessionStore::open(&path).unwrap();
        let row = store.session("persisted").unwrap();
        assert_eq!(row.labels["k"], "v");
    }
}
