use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::schedule::ScheduleDefinition;
use crate::backup::secret::SecretKey;
use crate::backup::session::{
    BackupSession, FileDescriptor, PartialFailurePolicy, SessionCounters, SessionKind,
    SessionStatus, SessionSummary,
};
use crate::backup::source::FileSource;
use crate::backup::storage::StorageProvider;
use crate::backup::store::StateStore;
use crate::backup::transfer::TransferPipeline;
use bon::Builder;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

static CANCELLED: &str = "cancelled";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEventKind {
    StatusChanged { status: SessionStatus },
    FilesIngested { count: usize },
    FileStarted { file_id: String },
    FileProgress { file_id: String, progress: u8 },
    FileCompleted { file_id: String },
    FileFailed { file_id: String, error: String },
}

/// A change to one session, with the counters right after it
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub counters: SessionCounters,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

struct Slot {
    session: BackupSession,
    /// A thread is currently driving this session
    active: bool,
    pause_requested: bool,
}

type SlotRef = Arc<Mutex<Slot>>;

fn lock(slot: &SlotRef) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns backup sessions and runs their files through a [`TransferPipeline`].
///
/// Every session sits behind its own lock; a runner holds it only to pick the
/// next file and to record results, never during storage I/O. Pause and
/// cancel requests are observed between files.
#[derive(Builder)]
pub struct SessionTracker<P: StorageProvider, F: FileSource> {
    pipeline: TransferPipeline<P>,
    source: F,
    key: SecretKey,
    #[builder(default)]
    policy: PartialFailurePolicy,
    store: Arc<dyn StateStore>,
    #[builder(skip)]
    sessions: RwLock<HashMap<String, SlotRef>>,
    #[builder(skip)]
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
}

impl<P: StorageProvider, F: FileSource> SessionTracker<P, F> {
    pub fn pipeline(&self) -> &TransferPipeline<P> {
        &self.pipeline
    }

    /// Loads stored sessions exactly as saved and writes nothing back. For
    /// processes that only inspect state another process may own.
    pub fn load(&self) -> Result<usize> {
        let loaded = self.store.load_sessions()?;
        let count = loaded.len();
        loaded.into_iter().for_each(|session| self.install(session));
        debug!("Loaded {} sessions", count);
        Ok(count)
    }

    /// Loads stored sessions. Sessions that were running when the process
    /// stopped come back paused; their ids are returned so the caller can
    /// resume them.
    pub fn rehydrate(&self) -> Result<Vec<String>> {
        let mut interrupted = vec![];
        let loaded = self.store.load_sessions()?;
        let count = loaded.len();
        for mut session in loaded {
            let was_running = session.status() == SessionStatus::Running;
            if session.recover_after_restart() {
                self.persist(&session);
            }
            if was_running {
                interrupted.push(session.id().to_string());
            }
            self.install(session);
        }
        info!(
            "Rehydrated {} sessions, {} interrupted",
            count,
            interrupted.len()
        );
        Ok(interrupted)
    }

    fn install(&self, session: BackupSession) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                session.id().to_string(),
                Arc::new(Mutex::new(Slot {
                    session,
                    active: false,
                    pause_requested: false,
                })),
            );
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn create_session<S: Into<String>>(&self, name: S, kind: SessionKind) -> BackupSession {
        self.insert(BackupSession::new(name, kind))
    }

    pub fn create_session_for(&self, schedule: &ScheduleDefinition) -> BackupSession {
        self.insert(BackupSession::for_schedule(schedule))
    }

    fn insert(&self, session: BackupSession) -> BackupSession {
        info!(
            "Created {} session {} ({})",
            session.kind(),
            session.id(),
            session.name()
        );
        self.persist(&session);
        self.install(session.clone());
        session
    }

    fn slot(&self, id: &str) -> Result<SlotRef> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownSession(id.to_string()))
    }

    pub fn session(&self, id: &str) -> Option<BackupSession> {
        let slot = self.slot(id).ok()?;
        let guard = lock(&slot);
        Some(guard.session.clone())
    }

    /// All sessions, oldest first
    pub fn sessions(&self) -> Vec<BackupSession> {
        let slots: Vec<SlotRef> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut sessions: Vec<_> = slots.iter().map(|s| lock(s).session.clone()).collect();
        sessions.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        sessions
    }

    pub fn summary(&self, id: &str) -> Result<SessionSummary> {
        Ok(lock(&self.slot(id)?).session.summary())
    }

    /// Appends files to a session that has not ended yet. A running session
    /// picks them up after the files already queued.
    pub fn ingest_files(&self, id: &str, descriptors: Vec<FileDescriptor>) -> Result<usize> {
        let slot = self.slot(id)?;
        let mut guard = lock(&slot);
        let added = guard.session.ingest(descriptors)?;
        debug!("Ingested {} files into session {}", added, id);
        self.persist(&guard.session);
        self.publish(&guard.session, SessionEventKind::FilesIngested { count: added });
        Ok(added)
    }

    /// Runs a pending session on the calling thread until every file is
    /// processed, a pause is observed or the session is cancelled.
    pub fn run(&self, id: &str) -> Result<SessionSummary> {
        let slot = self.slot(id)?;
        {
            let mut guard = lock(&slot);
            if guard.session.status() != SessionStatus::Pending {
                return Err(Error::state("session", id, "run", guard.session.status()));
            }
            self.transition(&mut guard, SessionStatus::Running, "run")?;
            guard.active = true;
        }
        info!("Running session {}", id);
        Ok(self.drive(&slot))
    }

    /// Pauses after the file in flight. Without a runner the session pauses
    /// right away.
    pub fn pause(&self, id: &str) -> Result<SessionSummary> {
        let slot = self.slot(id)?;
        let mut guard = lock(&slot);
        match guard.session.status() {
            SessionStatus::Paused => {}
            SessionStatus::Running if guard.active => {
                debug!("Pause requested for session {}", id);
                guard.pause_requested = true;
            }
            _ => self.transition(&mut guard, SessionStatus::Paused, "pause")?,
        }
        Ok(guard.session.summary())
    }

    /// Continues a paused session on the calling thread. If a pause was
    /// requested but not yet observed it is withdrawn and the current runner
    /// carries on.
    pub fn resume(&self, id: &str) -> Result<SessionSummary> {
        let slot = self.slot(id)?;
        {
            let mut guard = lock(&slot);
            match guard.session.status() {
                SessionStatus::Running if guard.active => {
                    guard.pause_requested = false;
                    return Ok(guard.session.summary());
                }
                SessionStatus::Paused => {
                    self.transition(&mut guard, SessionStatus::Running, "resume")?;
                    guard.active = true;
                }
                status => return Err(Error::state("session", id, "resume", status)),
            }
        }
        info!("Resuming session {}", id);
        Ok(self.drive(&slot))
    }

    /// Fails the session immediately. A file in flight still completes and is
    /// recorded; no further file is started.
    pub fn cancel(&self, id: &str) -> Result<SessionSummary> {
        let slot = self.slot(id)?;
        let mut guard = lock(&slot);
        self.transition(&mut guard, SessionStatus::Failed, "cancel")?;
        guard.session.set_error_message(CANCELLED);
        guard.pause_requested = false;
        self.persist(&guard.session);
        info!("Cancelled session {}", id);
        Ok(guard.session.summary())
    }

    /// Downloads and verifies one completed file of a session.
    pub fn restore_file(&self, session_id: &str, file_id: &str) -> Result<Vec<u8>> {
        let blob = {
            let slot = self.slot(session_id)?;
            let guard = lock(&slot);
            let record = guard
                .session
                .file(file_id)
                .ok_or_else(|| Error::State {
                    entity: "file",
                    id: file_id.to_string(),
                    action: "restore",
                    state: "unknown".into(),
                })?;
            record
                .blob()
                .clone()
                .ok_or_else(|| Error::state("file", file_id, "restore", record.status()))?
        };
        self.pipeline.restore(&blob, &self.key)
    }

    fn drive(&self, slot: &SlotRef) -> SessionSummary {
        loop {
            let (index, record, session_id) = {
                let mut guard = lock(slot);
                let id = guard.session.id().to_string();
                if guard.session.status() != SessionStatus::Running {
                    guard.active = false;
                    return guard.session.summary();
                }
                if guard.pause_requested {
                    guard.pause_requested = false;
                    guard.active = false;
                    if let Err(e) = self.transition(&mut guard, SessionStatus::Paused, "pause") {
                        warn!("{e}");
                    }
                    info!("Session {} paused", id);
                    return guard.session.summary();
                }
                let Some(index) = guard.session.next_pending() else {
                    guard.active = false;
                    self.finish(&mut guard);
                    return guard.session.summary();
                };
                let Some(record) = guard.session.begin_file(index).cloned() else {
                    continue;
                };
                self.persist(&guard.session);
                self.publish(
                    &guard.session,
                    SessionEventKind::FileStarted {
                        file_id: record.id().clone(),
                    },
                );
                (index, record, id)
            };

            debug!("Backing up {:?} ({} bytes)", record.path(), record.size());
            let remote_path = format!("{}/{}", session_id, record.id());
            let outcome = self.source.read(&record).and_then(|data| {
                self.pipeline.backup(&data, &self.key, &remote_path, &mut |progress| {
                    let guard = &mut lock(slot);
                    if guard.session.set_file_progress(index, progress) {
                        self.publish(
                            &guard.session,
                            SessionEventKind::FileProgress {
                                file_id: record.id().clone(),
                                progress,
                            },
                        );
                    }
                })
            });

            let mut guard = lock(slot);
            let file_id = record.id().clone();
            match outcome {
                Ok(blob) => {
                    guard.session.complete_file(index, blob);
                    self.publish(&guard.session, SessionEventKind::FileCompleted { file_id });
                }
                Err(e) => {
                    warn!("Backing up {:?} failed: {e}", record.path());
                    let error = e.to_string();
                    guard.session.fail_file(index, error.clone());
                    self.publish(&guard.session, SessionEventKind::FileFailed { file_id, error });
                }
            }
            self.persist(&guard.session);
        }
    }

    fn finish(&self, slot: &mut Slot) {
        match slot.session.finish(self.policy) {
            Ok(status) => {
                let summary = slot.session.summary();
                info!(
                    "Session {} {}: {} of {} files, {} failed",
                    summary.id,
                    status,
                    summary.completed_files,
                    summary.total_files,
                    summary.failed_files
                );
                self.persist(&slot.session);
                self.publish(&slot.session, SessionEventKind::StatusChanged { status });
            }
            Err(e) => warn!("{e}"),
        }
    }

    fn transition(&self, slot: &mut Slot, to: SessionStatus, action: &'static str) -> Result<()> {
        slot.session.transition(to, action)?;
        self.persist(&slot.session);
        self.publish(&slot.session, SessionEventKind::StatusChanged { status: to });
        Ok(())
    }

    fn persist(&self, session: &BackupSession) {
        if let Err(e) = self.store.save_session(session) {
            warn!("Persisting session {} failed: {e}", session.id());
        }
    }

    fn publish(&self, session: &BackupSession, kind: SessionEventKind) {
        let event = SessionEvent {
            session_id: session.id().to_string(),
            counters: session.counters(),
            kind,
        };
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
