use crate::backup::result_error::result::Result;
use crate::backup::schedule::ScheduleEntry;
use crate::backup::session::BackupSession;
use crate::backup::store::StateStore;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Process-local store, for tests and throwaway runs
#[derive(Default)]
pub struct MemoryStore {
    schedules: Mutex<BTreeMap<String, ScheduleEntry>>,
    sessions: Mutex<BTreeMap<String, BackupSession>>,
}

impl StateStore for MemoryStore {
    fn save_schedule(&self, entry: &ScheduleEntry) -> Result<()> {
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.id().to_string(), entry.clone());
        Ok(())
    }

    fn delete_schedule(&self, id: &str) -> Result<()> {
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }

    fn load_schedules(&self) -> Result<Vec<ScheduleEntry>> {
        Ok(self
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    fn save_session(&self, session: &BackupSession) -> Result<()> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id().to_string(), session.clone());
        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<BackupSession>> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }
}
