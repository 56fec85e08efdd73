//! Durable record of schedules and sessions, keyed by id, used to rehydrate
//! after a restart.

pub mod memory;
pub mod sqlite;

use crate::backup::result_error::result::Result;
use crate::backup::schedule::ScheduleEntry;
use crate::backup::session::BackupSession;

pub trait StateStore: Send + Sync {
    fn save_schedule(&self, entry: &ScheduleEntry) -> Result<()>;

    fn delete_schedule(&self, id: &str) -> Result<()>;

    fn load_schedules(&self) -> Result<Vec<ScheduleEntry>>;

    fn save_session(&self, session: &BackupSession) -> Result<()>;

    fn load_sessions(&self) -> Result<Vec<BackupSession>>;
}
