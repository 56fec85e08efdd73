//! Backup sessions and their per-file records.
//!
//! A [`BackupSession`] is a plain state machine: every mutation goes through
//! a method that re-derives the aggregate counters from the file records, so
//! `completed_files + failed_files <= total_files` and
//! `completed_size <= total_size` hold after each call. Driving sessions
//! through the transfer pipeline is the job of [`SessionTracker`].

pub mod tracker;

pub use tracker::{SessionEvent, SessionEventKind, SessionTracker};

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::schedule::{BackupKind, ScheduleDefinition};
use crate::backup::transfer::EncryptedBlobDescriptor;
use bon::Builder;
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::PathBuf;
use uuid::Uuid;

static DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[display("full")]
    Full,
    #[display("incremental")]
    Incremental,
    #[display("selective")]
    Selective,
}

impl From<BackupKind> for SessionKind {
    fn from(kind: BackupKind) -> Self {
        match kind {
            BackupKind::Full => SessionKind::Full,
            BackupKind::Incremental => SessionKind::Incremental,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
    #[display("paused")]
    Paused,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    fn can_become(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Failed)
        )
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    #[display("pending")]
    Pending,
    #[display("uploading")]
    Uploading,
    #[display("completed")]
    Completed,
    #[display("error")]
    Error,
}

/// How a finished run with errored files is reported
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    /// The session ends `failed` with an "N of M files failed" message.
    #[default]
    Fail,
    /// The session ends `completed` and its summary reports a partial failure.
    CompleteWithErrors,
}

/// A file to be added to a session
#[derive(Clone, Debug, PartialEq, Eq, Builder, Getters, CopyGetters)]
pub struct FileDescriptor {
    #[builder(into)]
    #[getset(get = "pub")]
    name: String,
    #[getset(get_copy = "pub")]
    size: u64,
    #[builder(into, default = DEFAULT_CONTENT_TYPE.to_string())]
    #[getset(get = "pub")]
    content_type: String,
    #[builder(into)]
    #[getset(get = "pub")]
    path: PathBuf,
    #[builder(default = Utc::now())]
    #[getset(get_copy = "pub")]
    last_modified: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct BackupFileRecord {
    #[getset(get = "pub")]
    id: String,
    #[getset(get = "pub")]
    name: String,
    #[getset(get_copy = "pub")]
    size: u64,
    #[getset(get = "pub")]
    content_type: String,
    #[getset(get = "pub")]
    path: PathBuf,
    #[getset(get_copy = "pub")]
    last_modified: DateTime<Utc>,
    #[getset(get_copy = "pub")]
    status: FileStatus,
    #[getset(get_copy = "pub")]
    progress: u8,
    #[getset(get = "pub")]
    error: Option<String>,
    #[getset(get = "pub")]
    blob: Option<EncryptedBlobDescriptor>,
}

impl BackupFileRecord {
    fn from_descriptor(descriptor: FileDescriptor) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: descriptor.name,
            size: descriptor.size,
            content_type: descriptor.content_type,
            path: descriptor.path,
            last_modified: descriptor.last_modified,
            status: FileStatus::Pending,
            progress: 0,
            error: None,
            blob: None,
        }
    }

    /// Hex SHA-256 of the original content, known once uploaded
    pub fn digest(&self) -> Option<&str> {
        self.blob.as_ref().map(|b| b.digest.as_str())
    }

    pub fn remote_path(&self) -> Option<&str> {
        self.blob.as_ref().map(|b| b.remote_path.as_str())
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    #[display("in progress")]
    InProgress,
    #[display("success")]
    Success,
    #[display("partial failure")]
    PartialFailure,
    #[display("failed")]
    Failed,
}

/// Aggregate counters of a session at one point in time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub total_size: u64,
    pub completed_size: u64,
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    pub outcome: SessionOutcome,
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub total_size: u64,
    pub completed_size: u64,
    pub error_message: Option<String>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct BackupSession {
    #[getset(get = "pub")]
    id: String,
    #[getset(get = "pub")]
    name: String,
    #[getset(get_copy = "pub")]
    kind: SessionKind,
    #[getset(get_copy = "pub")]
    status: SessionStatus,
    #[getset(get = "pub")]
    schedule_id: Option<String>,
    #[getset(get_copy = "pub")]
    created_at: DateTime<Utc>,
    #[getset(get_copy = "pub")]
    start_time: Option<DateTime<Utc>>,
    #[getset(get_copy = "pub")]
    end_time: Option<DateTime<Utc>>,
    #[getset(get_copy = "pub")]
    total_files: usize,
    #[getset(get_copy = "pub")]
    completed_files: usize,
    #[getset(get_copy = "pub")]
    failed_files: usize,
    #[getset(get_copy = "pub")]
    total_size: u64,
    #[getset(get_copy = "pub")]
    completed_size: u64,
    #[getset(get = "pub")]
    error_message: Option<String>,
    #[getset(get = "pub")]
    files: Vec<BackupFileRecord>,
}

impl BackupSession {
    pub fn new<S: Into<String>>(name: S, kind: SessionKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            status: SessionStatus::Pending,
            schedule_id: None,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            total_files: 0,
            completed_files: 0,
            failed_files: 0,
            total_size: 0,
            completed_size: 0,
            error_message: None,
            files: vec![],
        }
    }

    pub fn for_schedule(schedule: &ScheduleDefinition) -> Self {
        let mut session = Self::new(schedule.name().as_str(), schedule.backup_kind().into());
        session.schedule_id = Some(schedule.id().to_string());
        session
    }

    pub fn file(&self, file_id: &str) -> Option<&BackupFileRecord> {
        self.files.iter().find(|f| f.id == file_id)
    }

    pub fn counters(&self) -> SessionCounters {
        SessionCounters {
            total_files: self.total_files,
            completed_files: self.completed_files,
            failed_files: self.failed_files,
            total_size: self.total_size,
            completed_size: self.completed_size,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let outcome = match self.status {
            SessionStatus::Pending | SessionStatus::Running | SessionStatus::Paused => {
                SessionOutcome::InProgress
            }
            SessionStatus::Completed if self.failed_files == 0 => SessionOutcome::Success,
            SessionStatus::Completed => SessionOutcome::PartialFailure,
            SessionStatus::Failed => SessionOutcome::Failed,
        };
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            outcome,
            total_files: self.total_files,
            completed_files: self.completed_files,
            failed_files: self.failed_files,
            total_size: self.total_size,
            completed_size: self.completed_size,
            error_message: self.error_message.clone(),
        }
    }

    pub(crate) fn set_error_message<S: Into<String>>(&mut self, msg: S) {
        self.error_message = Some(msg.into());
    }

    /// Appends pending records in the given order. Returns how many were added.
    pub(crate) fn ingest(&mut self, descriptors: Vec<FileDescriptor>) -> Result<usize> {
        if self.status.is_terminal() {
            return Err(Error::state("session", &self.id, "ingest files", self.status));
        }
        let added = descriptors.len();
        self.files
            .extend(descriptors.into_iter().map(BackupFileRecord::from_descriptor));
        self.recompute();
        Ok(added)
    }

    pub(crate) fn transition(&mut self, to: SessionStatus, action: &'static str) -> Result<()> {
        if !self.status.can_become(to) {
            return Err(Error::state("session", &self.id, action, self.status));
        }
        let now = Utc::now();
        if to == SessionStatus::Running && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if to.is_terminal() {
            self.end_time = Some(now);
        }
        self.status = to;
        Ok(())
    }

    pub(crate) fn next_pending(&self) -> Option<usize> {
        self.files
            .iter()
            .position(|f| f.status == FileStatus::Pending)
    }

    pub(crate) fn begin_file(&mut self, index: usize) -> Option<&BackupFileRecord> {
        let record = self.files.get_mut(index)?;
        record.status = FileStatus::Uploading;
        record.progress = 0;
        record.error = None;
        Some(record)
    }

    /// Progress only moves forward while a file is uploading.
    pub(crate) fn set_file_progress(&mut self, index: usize, progress: u8) -> bool {
        match self.files.get_mut(index) {
            Some(record) if record.status == FileStatus::Uploading => {
                let progress = progress.min(100);
                if progress > record.progress {
                    record.progress = progress;
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    pub(crate) fn complete_file(&mut self, index: usize, blob: EncryptedBlobDescriptor) {
        if let Some(record) = self.files.get_mut(index) {
            record.status = FileStatus::Completed;
            record.progress = 100;
            record.blob = Some(blob);
        }
        self.recompute();
    }

    pub(crate) fn fail_file<S: Into<String>>(&mut self, index: usize, reason: S) {
        if let Some(record) = self.files.get_mut(index) {
            record.status = FileStatus::Error;
            record.error = Some(reason.into());
        }
        self.recompute();
    }

    /// Ends a running session whose files have all been processed.
    pub(crate) fn finish(&mut self, policy: PartialFailurePolicy) -> Result<SessionStatus> {
        let to = match policy {
            PartialFailurePolicy::Fail if self.failed_files > 0 => {
                self.error_message = Some(format!(
                    "{} of {} files failed",
                    self.failed_files, self.total_files
                ));
                SessionStatus::Failed
            }
            _ => SessionStatus::Completed,
        };
        self.transition(to, "finish")?;
        Ok(to)
    }

    /// Brings a session loaded after a crash back to a resumable state: a
    /// running session becomes paused and interrupted uploads start over.
    pub(crate) fn recover_after_restart(&mut self) -> bool {
        let mut changed = false;
        for record in self.files.iter_mut() {
            if record.status == FileStatus::Uploading {
                record.status = FileStatus::Pending;
                record.progress = 0;
                changed = true;
            }
        }
        if self.status == SessionStatus::Running {
            self.status = SessionStatus::Paused;
            changed = true;
        }
        self.recompute();
        changed
    }

    fn recompute(&mut self) {
        let (mut completed_files, mut failed_files) = (0, 0);
        let (mut total_size, mut completed_size) = (0u64, 0u64);
        for record in &self.files {
            total_size += record.size;
            match record.status {
                FileStatus::Completed => {
                    completed_files += 1;
                    completed_size += record.size;
                }
                FileStatus::Error => failed_files += 1,
                FileStatus::Pending | FileStatus::Uploading => {}
            }
        }
        self.total_files = self.files.len();
        self.total_size = total_size;
        self.completed_files = completed_files;
        self.completed_size = completed_size;
        self.failed_files = failed_files;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backup::compress::CompressionCodec;

    pub(crate) fn descriptor(name: &str, size: u64) -> FileDescriptor {
        FileDescriptor::builder()
            .name(name)
            .size(size)
            .path(format!("/data/{name}"))
            .build()
    }

    fn blob(path: &str) -> EncryptedBlobDescriptor {
        EncryptedBlobDescriptor {
            remote_path: path.to_string(),
            iv: [0; 16],
            digest: "00".into(),
            compression: CompressionCodec::None,
            compression_ratio: 0.0,
            original_size: 0,
            stored_size: 16,
        }
    }

    /// Counters equal what the file records say
    pub(crate) fn assert_consistent(session: &BackupSession) {
        let files = session.files();
        let completed: Vec<_> = files
            .iter()
            .filter(|f| f.status() == FileStatus::Completed)
            .collect();
        assert_eq!(session.completed_files(), completed.len());
        assert_eq!(
            session.completed_size(),
            completed.iter().map(|f| f.size()).sum::<u64>()
        );
        assert_eq!(
            session.failed_files(),
            files.iter().filter(|f| f.status() == FileStatus::Error).count()
        );
        assert_eq!(session.total_files(), files.len());
        assert_eq!(session.total_size(), files.iter().map(|f| f.size()).sum::<u64>());
        assert!(session.completed_files() + session.failed_files() <= session.total_files());
    }

    #[test]
    fn test_new_session_is_pending_and_empty() {
        let session = BackupSession::new("docs", SessionKind::Selective);
        assert_eq!(session.status(), SessionStatus::Pending);
        assert_eq!(session.total_files(), 0);
        assert!(session.start_time().is_none());
        assert_eq!(session.summary().outcome, SessionOutcome::InProgress);
    }

    #[test]
    fn test_ingest_bumps_totals_in_order() {
        let mut session = BackupSession::new("docs", SessionKind::Full);
        session
            .ingest(vec![descriptor("a", 10), descriptor("b", 20)])
            .unwrap();
        session.ingest(vec![descriptor("c", 30)]).unwrap();

        assert_eq!(session.total_files(), 3);
        assert_eq!(session.total_size(), 60);
        let names: Vec<_> = session.files().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(session.files().iter().all(|f| f.status() == FileStatus::Pending));
    }

    #[test]
    fn test_partial_failure_counters() {
        let mut session = BackupSession::new("docs", SessionKind::Full);
        session
            .ingest(vec![descriptor("a", 10), descriptor("b", 20), descriptor("c", 30)])
            .unwrap();
        session.transition(SessionStatus::Running, "run").unwrap();

        assert_consistent(&session);
        let mut expected = (0, 0);
        while let Some(index) = session.next_pending() {
            session.begin_file(index);
            assert_consistent(&session);
            assert_eq!((session.completed_files(), session.completed_size()), expected);
            if index == 1 {
                session.fail_file(index, "disk on fire");
            } else {
                session.complete_file(index, blob("x"));
                expected = (expected.0 + 1, expected.1 + session.files()[index].size());
            }
            assert_consistent(&session);
            assert_eq!((session.completed_files(), session.completed_size()), expected);
        }

        assert_eq!(session.completed_files(), 2);
        assert_eq!(session.completed_size(), 40);
        assert_eq!(session.failed_files(), 1);
        assert_eq!(session.files()[1].error().as_deref(), Some("disk on fire"));
        assert!(session.files()[1].digest().is_none());
    }

    #[test]
    fn test_finish_respects_policy() {
        let build = || {
            let mut session = BackupSession::new("docs", SessionKind::Full);
            session.ingest(vec![descriptor("a", 1), descriptor("b", 2)]).unwrap();
            session.transition(SessionStatus::Running, "run").unwrap();
            session.complete_file(0, blob("s/a"));
            session.fail_file(1, "gone");
            session
        };

        let mut strict = build();
        assert_eq!(
            strict.finish(PartialFailurePolicy::Fail).unwrap(),
            SessionStatus::Failed
        );
        assert_eq!(strict.error_message().as_deref(), Some("1 of 2 files failed"));
        assert_eq!(strict.summary().outcome, SessionOutcome::Failed);
        assert!(strict.end_time().is_some());

        let mut lenient = build();
        assert_eq!(
            lenient.finish(PartialFailurePolicy::CompleteWithErrors).unwrap(),
            SessionStatus::Completed
        );
        let summary = lenient.summary();
        assert_eq!(summary.outcome, SessionOutcome::PartialFailure);
        assert_eq!(summary.failed_files, 1);
        assert!(summary.error_message.is_none());
    }

    #[test]
    fn test_clean_run_is_success() {
        let mut session = BackupSession::new("docs", SessionKind::Full);
        session.ingest(vec![descriptor("a", 1)]).unwrap();
        session.transition(SessionStatus::Running, "run").unwrap();
        session.complete_file(0, blob("s/a"));
        session.finish(PartialFailurePolicy::Fail).unwrap();
        assert_eq!(session.summary().outcome, SessionOutcome::Success);
        assert_eq!(session.files()[0].remote_path(), Some("s/a"));
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut session = BackupSession::new("docs", SessionKind::Full);
        let err = session
            .transition(SessionStatus::Paused, "pause")
            .unwrap_err();
        assert!(err.to_string().contains("cannot pause while pending"));

        session.transition(SessionStatus::Running, "run").unwrap();
        session.transition(SessionStatus::Paused, "pause").unwrap();
        session.transition(SessionStatus::Running, "resume").unwrap();
        session.transition(SessionStatus::Completed, "finish").unwrap();

        assert!(session.transition(SessionStatus::Running, "run").is_err());
        assert!(session.ingest(vec![descriptor("late", 1)]).is_err());
    }

    #[test]
    fn test_progress_is_monotonic_and_bounded() {
        let mut session = BackupSession::new("docs", SessionKind::Full);
        session.ingest(vec![descriptor("a", 1)]).unwrap();
        assert!(!session.set_file_progress(0, 50));

        session.begin_file(0);
        assert!(session.set_file_progress(0, 50));
        assert!(!session.set_file_progress(0, 20));
        assert!(session.set_file_progress(0, 250));
        assert_eq!(session.files()[0].progress(), 100);
    }

    #[test]
    fn test_recover_after_restart() {
        let mut session = BackupSession::new("docs", SessionKind::Full);
        session.ingest(vec![descriptor("a", 1), descriptor("b", 2)]).unwrap();
        session.transition(SessionStatus::Running, "run").unwrap();
        session.complete_file(0, blob("s/a"));
        session.begin_file(1);
        session.set_file_progress(1, 45);

        assert!(session.recover_after_restart());
        assert_eq!(session.status(), SessionStatus::Paused);
        assert_eq!(session.files()[1].status(), FileStatus::Pending);
        assert_eq!(session.files()[1].progress(), 0);
        assert_eq!(session.completed_files(), 1);
        assert!(!session.recover_after_restart());
    }

    #[test]
    fn test_for_schedule_links_schedule() {
        let schedule = ScheduleDefinition::builder()
            .id("nightly")
            .name("nightly docs")
            .frequency(crate::backup::schedule::Frequency::Hourly)
            .backup_kind(BackupKind::Incremental)
            .include_paths(vec!["/srv".to_string()])
            .build();
        let session = BackupSession::for_schedule(&schedule);
        assert_eq!(session.schedule_id().as_deref(), Some("nightly"));
        assert_eq!(session.kind(), SessionKind::Incremental);
        assert_eq!(session.name(), "nightly docs");
    }

    #[test]
    fn test_serde_roundtrip_keeps_records() {
        let mut session = BackupSession::new("docs", SessionKind::Full);
        session.ingest(vec![descriptor("a", 3)]).unwrap();
        session.transition(SessionStatus::Running, "run").unwrap();
        session.complete_file(0, blob("s/a"));

        let json = serde_json::to_string(&session).unwrap();
        let back: BackupSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
        assert!(json.contains("\"status\":\"running\""));
    }
}
