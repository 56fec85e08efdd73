//! Daemon configuration and the services it wires together.

use crate::backup::compress::CompressorConfig;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::schedule::{ScheduleDefinition, ScheduleEntry, Scheduler, SchedulerHandle};
use crate::backup::secret::SecretKey;
use crate::backup::session::{
    PartialFailurePolicy, SessionKind, SessionOutcome, SessionSummary, SessionTracker,
};
use crate::backup::source::{FsSource, Scan};
use crate::backup::storage::fs::FsStorage;
use crate::backup::store::sqlite::SqliteStore;
use crate::backup::transfer::TransferPipeline;
use crate::backup::validate::{validate_dir_exist_or_created, validate_writable_dir};
use chrono::Local;
use itertools::Itertools;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use validator::{Validate, ValidationError};

static STATE_DB_FILE: &str = "state.sqlite";

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_unique_schedule_ids))]
pub struct AppConfig {
    /// Where the schedule and session database lives
    #[validate(custom(function = validate_dir_exist_or_created))]
    pub state_dir: PathBuf,
    /// Root of the directory-backed artifact storage
    #[validate(custom(function = validate_writable_dir))]
    pub storage_dir: PathBuf,
    /// Base64 of the 32-byte AES key
    pub encryption_key: SecretKey,
    #[serde(default)]
    #[validate(nested)]
    pub compressor: CompressorConfig,
    #[serde(default)]
    pub partial_failure: PartialFailurePolicy,
    /// Upper bound on how long the scheduler sleeps between checks
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[validate(range(min = 1))]
    pub threads: Option<usize>,
    #[serde(default)]
    #[validate(nested)]
    pub schedules: Vec<ScheduleDefinition>,
}

fn validate_unique_schedule_ids(config: &AppConfig) -> std::result::Result<(), ValidationError> {
    let mut seen = HashSet::new();
    if let Some(dup) = config.schedules.iter().find(|s| !seen.insert(s.id())) {
        return Err(ValidationError::new("DuplicateScheduleId")
            .with_message(format!("schedule id {:?} is used twice", dup.id()).into()));
    }

    Ok(())
}

pub type Tracker = SessionTracker<Arc<FsStorage>, FsSource>;

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: AppConfig = File::open(path)
            .map_err(Error::from)
            .with_msg(format!("Open config failed: {path:?}"))
            .and_then(|f| {
                serde_yml::from_reader(f)
                    .map_err(Error::from)
                    .with_msg(format!("Parse YAML config failed: {path:?}"))
            })?;
        config
            .validate()
            .map_err(Error::from)
            .with_msg(format!("Config validation failed: {path:?}"))?;
        Ok(config)
    }

    pub fn build_pool(&self) -> Result<ThreadPool> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("k-vault-worker-{i}"));
        if let Some(threads) = self.threads {
            builder = builder.num_threads(threads);
        }
        Ok(builder.build()?)
    }

    /// Opens the state database and storage and loads sessions and
    /// schedules from it.
    ///
    /// With [`Access::Owner`] interrupted sessions are recovered and the
    /// stored schedules are brought in line with the configured ones. With
    /// [`Access::Shared`] stored state is only read; sessions created later
    /// are still saved.
    pub fn open(&self, access: Access) -> Result<Services> {
        let store = Arc::new(SqliteStore::open(self.state_dir.join(STATE_DB_FILE))?);
        let storage = Arc::new(FsStorage::new(&self.storage_dir)?);

        let tracker = Arc::new(
            SessionTracker::builder()
                .pipeline(TransferPipeline::new(storage, self.compressor.clone()))
                .source(FsSource::default())
                .key(self.encryption_key.clone())
                .policy(self.partial_failure)
                .store(store.clone())
                .build(),
        );

        let (interrupted, scheduler) = match access {
            Access::Owner => {
                let interrupted = tracker.rehydrate()?;
                let scheduler = Scheduler::rehydrate(Local, store.clone())?;
                sync_schedules(&scheduler, &self.schedules)?;
                (interrupted, scheduler)
            }
            Access::Shared => {
                tracker.load()?;
                (vec![], Scheduler::load(Local, store.clone())?)
            }
        };

        Ok(Services {
            store,
            tracker,
            scheduler: Arc::new(scheduler),
            source: FsSource::default(),
            interrupted,
            poll_interval: self.poll_interval,
        })
    }
}

/// What an opened [`Services`] may rewrite in the state database
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Recovers interrupted sessions and syncs schedules. One process at a time.
    Owner,
    /// Reads stored state as is, next to a possibly running daemon
    Shared,
}

/// Makes the configured schedules the registered ones, keeping the run
/// history of schedules that already existed.
fn sync_schedules(scheduler: &Scheduler<Local>, configured: &[ScheduleDefinition]) -> Result<()> {
    let wanted: HashSet<&str> = configured.iter().map(|s| s.id().as_str()).collect();
    for stale in scheduler
        .list()
        .iter()
        .filter(|e| !wanted.contains(e.id()))
    {
        info!("Removing schedule {} no longer in config", stale.id());
        scheduler.remove(stale.id())?;
    }
    for definition in configured {
        let entry = if scheduler.get(definition.id()).is_some() {
            scheduler.update(definition.clone())?
        } else {
            scheduler.add(definition.clone())?
        };
        match entry.next_run() {
            Some(next) => info!(
                "Schedule {} ({}) next runs at {}",
                entry.id(),
                definition.name(),
                next.with_timezone(&Local)
            ),
            None => info!("Schedule {} is disabled", entry.id()),
        }
    }
    Ok(())
}

pub struct Services {
    pub store: Arc<SqliteStore>,
    pub tracker: Arc<Tracker>,
    pub scheduler: Arc<Scheduler<Local>>,
    source: FsSource,
    interrupted: Vec<String>,
    poll_interval: Duration,
}

impl Services {
    pub fn schedules(&self) -> Vec<ScheduleEntry> {
        self.scheduler.list()
    }

    pub fn scan<S: AsRef<str>>(&self, include: &[S], exclude: &[S]) -> Result<Scan> {
        let scan = self.source.scan(include, exclude)?;
        for e in &scan.errors {
            warn!("{e}");
        }
        if scan.files.is_empty() && !scan.errors.is_empty() {
            return Err(scan.errors.into());
        }
        Ok(scan)
    }

    /// Scans, creates a session and runs it on the calling thread.
    pub fn backup_now<N: Into<String>, S: AsRef<str>>(
        &self,
        name: N,
        kind: SessionKind,
        include: &[S],
        exclude: &[S],
    ) -> Result<SessionSummary> {
        let scan = self.scan(include, exclude)?;
        let session = self.tracker.create_session(name, kind);
        self.tracker.ingest_files(session.id(), scan.files)?;
        self.tracker.run(session.id())
    }

    fn run_schedule(&self, definition: &ScheduleDefinition) -> Result<()> {
        let scan = self.scan(&definition.include_paths()[..], &definition.exclude_paths()[..])?;
        let session = self.tracker.create_session_for(definition);
        self.tracker.ingest_files(session.id(), scan.files)?;
        let summary = self.tracker.run(session.id())?;
        match summary.outcome {
            SessionOutcome::Success => Ok(()),
            outcome => Err(Error::Scheduling(format!(
                "session {} of schedule {} ended with {}: {}",
                summary.id,
                definition.id(),
                outcome,
                summary.error_message.unwrap_or_default()
            ))),
        }
    }

    /// Resumes sessions interrupted by the last shutdown and starts firing
    /// schedules. Both run on `pool`.
    pub fn start_daemon(self: &Arc<Self>, pool: Arc<ThreadPool>) -> Result<SchedulerHandle> {
        for id in self.interrupted.iter().cloned() {
            let tracker = self.tracker.clone();
            pool.spawn(move || match tracker.resume(&id) {
                Ok(summary) => info!("Resumed session {} ended {}", id, summary.outcome),
                Err(e) => warn!("Resuming session {} failed: {e}", id),
            });
        }

        let services = self.clone();
        let callback = Arc::new(move |definition: &ScheduleDefinition| {
            services.run_schedule(definition)
        });
        info!(
            "Starting scheduler with {} schedules: {}",
            self.scheduler.list().len(),
            self.scheduler.list().iter().map(|e| e.id().to_string()).join(", ")
        );
        self.scheduler.start(pool, callback, self.poll_interval)
    }
}
