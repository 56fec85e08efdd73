use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::schedule::ScheduleEntry;
use crate::backup::session::BackupSession;
use crate::backup::store::StateStore;
use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

static SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY NOT NULL,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY NOT NULL,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// SQLite-backed state, one JSON document per schedule/session row
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Opening state database {:?}", path);
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(Error::from)
        .with_msg(format!("Open state database failed: {path:?}"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn upsert(&self, table: &str, id: &str, body: String) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO {table} (id, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at"
            ),
            params![id, body, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn load_all<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT id, body FROM {table} ORDER BY id"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, body)| {
                serde_json::from_str(&body)
                    .map_err(Error::from)
                    .with_msg(format!("Corrupt {table} row {id:?}"))
            })
            .collect()
    }
}

impl StateStore for SqliteStore {
    fn save_schedule(&self, entry: &ScheduleEntry) -> Result<()> {
        self.upsert("schedules", entry.id(), serde_json::to_string(entry)?)
    }

    fn delete_schedule(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn load_schedules(&self) -> Result<Vec<ScheduleEntry>> {
        self.load_all("schedules")
    }

    fn save_session(&self, session: &BackupSession) -> Result<()> {
        self.upsert("sessions", session.id(), serde_json::to_string(session)?)
    }

    fn load_sessions(&self) -> Result<Vec<BackupSession>> {
        self.load_all("sessions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::schedule::{Frequency, ScheduleDefinition, Scheduler};
    use crate::backup::session::SessionKind;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn hourly(id: &str) -> ScheduleDefinition {
        ScheduleDefinition::builder()
            .id(id)
            .name("hourly")
            .frequency(Frequency::Hourly)
            .include_paths(vec!["/srv".to_string()])
            .build()
    }

    #[test]
    fn test_schedules_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("state.sqlite");

        let entry = {
            let store = Arc::new(SqliteStore::open(&db).unwrap());
            let scheduler = Scheduler::new(Utc, store);
            scheduler.add(hourly("keep")).unwrap();
            scheduler.add(hourly("drop")).unwrap();
            scheduler.remove("drop").unwrap();
            scheduler.get("keep").unwrap()
        };

        let store = SqliteStore::open(&db).unwrap();
        assert_eq!(store.load_schedules().unwrap(), vec![entry]);
    }

    #[test]
    fn test_session_upsert_replaces_body() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut session = BackupSession::new("docs", SessionKind::Full);
        store.save_session(&session).unwrap();

        session.set_error_message("changed");
        store.save_session(&session).unwrap();

        let loaded = store.load_sessions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id(), session.id());
        assert_eq!(loaded[0].error_message().as_deref(), Some("changed"));
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert("sessions", "x", "{not json".into()).unwrap();
        let err = store.load_sessions().unwrap_err();
        assert!(err.to_string().contains("Corrupt sessions row \"x\""));
    }
}
