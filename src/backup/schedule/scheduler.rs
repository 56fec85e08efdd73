use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::schedule::ScheduleDefinition;
use crate::backup::store::StateStore;
use chrono::{DateTime, TimeZone, Utc};
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use validator::Validate;

/// Invoked on the worker pool each time a schedule is due
pub type TriggerCallback = Arc<dyn Fn(&ScheduleDefinition) -> Result<()> + Send + Sync>;

/// A schedule definition plus the audit fields the scheduler derives for it.
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct ScheduleEntry {
    #[getset(get = "pub")]
    definition: ScheduleDefinition,
    #[getset(get_copy = "pub")]
    next_run: Option<DateTime<Utc>>,
    #[getset(get_copy = "pub")]
    last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    #[getset(get_copy = "pub")]
    run_count: u64,
    #[serde(default)]
    #[getset(get_copy = "pub")]
    success_count: u64,
}

impl ScheduleEntry {
    fn new(definition: ScheduleDefinition) -> Self {
        Self {
            definition,
            next_run: None,
            last_run: None,
            run_count: 0,
            success_count: 0,
        }
    }

    pub fn id(&self) -> &str {
        self.definition.id()
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Due {
    at: DateTime<Utc>,
    generation: u64,
    id: String,
}

struct Slot {
    entry: ScheduleEntry,
    generation: u64,
    in_flight: bool,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<String, Slot>,
    heap: BinaryHeap<Reverse<Due>>,
    next_generation: u64,
    shutdown: bool,
}

impl Registry {
    fn is_live(slots: &HashMap<String, Slot>, due: &Due) -> bool {
        slots
            .get(&due.id)
            .is_some_and(|s| s.generation == due.generation)
    }

    /// Replaces any armed trigger of `slot` with one at its current
    /// `next_run`. Older heap items become stale through the generation bump
    /// and are compacted away once they outnumber the live ones.
    fn arm(&mut self, id: &str) {
        self.next_generation += 1;
        let generation = self.next_generation;
        if let Some(slot) = self.slots.get_mut(id) {
            slot.generation = generation;
            if let Some(at) = slot.entry.next_run {
                self.heap.push(Reverse(Due {
                    at,
                    generation,
                    id: id.to_string(),
                }));
            }
        }
        if self.heap.len() > 2 * self.slots.len() + 1 {
            let Registry { slots, heap, .. } = self;
            heap.retain(|Reverse(due)| Self::is_live(slots, due));
        }
    }

    /// Earliest live trigger, dropping stale ones sitting in front of it.
    fn peek_due(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse(due)) = self.heap.peek() {
            if Self::is_live(&self.slots, due) {
                return Some(due.at);
            }
            self.heap.pop();
        }
        None
    }
}

struct Shared {
    registry: Mutex<Registry>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owned registry of schedules with a single due-time heap.
///
/// `Tz` is the zone wall-clock times are interpreted in; `Local` for the
/// daemon.
pub struct Scheduler<Tz: TimeZone> {
    tz: Tz,
    shared: Arc<Shared>,
    store: Arc<dyn StateStore>,
}

impl<Tz> Scheduler<Tz>
where
    Tz: TimeZone + Send + Sync + 'static,
{
    pub fn new(tz: Tz, store: Arc<dyn StateStore>) -> Self {
        Self {
            tz,
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                wakeup: Condvar::new(),
            }),
            store,
        }
    }

    /// Reloads every stored schedule, keeping its audit fields, and computes
    /// a fresh next run from now. Missed runs are not replayed. Nothing is
    /// written back to the store.
    pub fn load(tz: Tz, store: Arc<dyn StateStore>) -> Result<Self> {
        let scheduler = Self::new(tz, store);
        let now = Utc::now();
        let stored = scheduler
            .store
            .load_schedules()
            .with_msg("Loading stored schedules failed")?;
        debug!("Loading {} schedules", stored.len());

        {
            let mut registry = scheduler.shared.lock();
            for mut entry in stored {
                entry.next_run = match scheduler.compute_next(&entry.definition, now) {
                    Ok(next) => next,
                    Err(e) => {
                        warn!("Schedule {} can not be armed: {e}", entry.id());
                        None
                    }
                };
                let id = entry.id().to_string();
                registry.slots.insert(
                    id.clone(),
                    Slot {
                        entry,
                        generation: 0,
                        in_flight: false,
                    },
                );
                registry.arm(&id);
            }
        }
        Ok(scheduler)
    }

    /// [`Scheduler::load`], then stores the recomputed next runs.
    pub fn rehydrate(tz: Tz, store: Arc<dyn StateStore>) -> Result<Self> {
        let scheduler = Self::load(tz, store)?;
        let entries = scheduler.list();
        info!("Rehydrated {} schedules", entries.len());
        entries.iter().for_each(|entry| scheduler.persist(entry));
        Ok(scheduler)
    }

    fn compute_next(
        &self,
        definition: &ScheduleDefinition,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        if !definition.enabled() {
            return Ok(None);
        }
        let recurrence = definition
            .recurrence()
            .map_err(|e| Error::Scheduling(format!("{}: {e}", definition.id())))?;
        let next = recurrence.next_after(&now.with_timezone(&self.tz))?;
        Ok(Some(next.with_timezone(&Utc)))
    }

    fn persist(&self, entry: &ScheduleEntry) {
        if let Err(e) = self.store.save_schedule(entry) {
            warn!("Persisting schedule {} failed: {e}", entry.id());
        }
    }

    fn prepare(&self, definition: ScheduleDefinition, now: DateTime<Utc>) -> Result<ScheduleEntry> {
        definition.validate()?;
        let mut entry = ScheduleEntry::new(definition);
        entry.next_run = self.compute_next(&entry.definition, now)?;
        Ok(entry)
    }

    /// Validates, stores and arms a new schedule.
    pub fn add(&self, definition: ScheduleDefinition) -> Result<ScheduleEntry> {
        let entry = self.prepare(definition, Utc::now())?;
        let mut registry = self.shared.lock();
        if registry.slots.contains_key(entry.id()) {
            return Err(Error::Scheduling(format!(
                "schedule {} already exists",
                entry.id()
            )));
        }
        self.store
            .save_schedule(&entry)
            .with_msg(format!("Persisting schedule {} failed", entry.id()))?;

        let id = entry.id().to_string();
        registry.slots.insert(
            id.clone(),
            Slot {
                entry: entry.clone(),
                generation: 0,
                in_flight: false,
            },
        );
        registry.arm(&id);
        self.shared.wakeup.notify_all();
        info!(
            "Added schedule {} ({}), next run {:?}",
            id,
            entry.definition.frequency(),
            entry.next_run
        );
        Ok(entry)
    }

    /// Replaces an existing definition and re-arms it. Run history is kept.
    pub fn update(&self, definition: ScheduleDefinition) -> Result<ScheduleEntry> {
        let prepared = self.prepare(definition, Utc::now())?;
        let mut registry = self.shared.lock();
        let id = prepared.id().to_string();
        let slot = registry
            .slots
            .get(&id)
            .ok_or_else(|| Error::Scheduling(format!("schedule {id} does not exist")))?;

        let entry = ScheduleEntry {
            last_run: slot.entry.last_run,
            run_count: slot.entry.run_count,
            success_count: slot.entry.success_count,
            ..prepared
        };
        self.store
            .save_schedule(&entry)
            .with_msg(format!("Persisting schedule {id} failed"))?;

        if let Some(slot) = registry.slots.get_mut(&id) {
            slot.entry = entry.clone();
        }
        registry.arm(&id);
        self.shared.wakeup.notify_all();
        info!("Updated schedule {id}, next run {:?}", entry.next_run);
        Ok(entry)
    }

    /// Disarms and forgets a schedule.
    pub fn remove(&self, id: &str) -> Result<ScheduleEntry> {
        let mut registry = self.shared.lock();
        if !registry.slots.contains_key(id) {
            return Err(Error::Scheduling(format!("schedule {id} does not exist")));
        }
        self.store
            .delete_schedule(id)
            .with_msg(format!("Deleting schedule {id} failed"))?;
        let slot = registry
            .slots
            .remove(id)
            .ok_or_else(|| Error::Scheduling(format!("schedule {id} does not exist")))?;
        self.shared.wakeup.notify_all();
        info!("Removed schedule {id}");
        Ok(slot.entry)
    }

    pub fn get(&self, id: &str) -> Option<ScheduleEntry> {
        self.shared.lock().slots.get(id).map(|s| s.entry.clone())
    }

    pub fn list(&self) -> Vec<ScheduleEntry> {
        self.shared
            .lock()
            .slots
            .values()
            .map(|s| s.entry.clone())
            .sorted_by(|a, b| {
                a.definition
                    .name()
                    .cmp(b.definition.name())
                    .then_with(|| a.id().cmp(b.id()))
            })
            .collect()
    }

    /// Earliest armed trigger, if any.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().peek_due()
    }

    /// Pops every trigger due at `now`, re-arms each schedule for its next
    /// future instant and returns the definitions that should fire.
    ///
    /// A schedule whose previous run is still in flight is skipped for this
    /// instant and re-armed.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<ScheduleDefinition> {
        let mut fired = vec![];
        let mut to_save = vec![];
        {
            let mut registry = self.shared.lock();
            while registry
                .heap
                .peek()
                .is_some_and(|Reverse(due)| due.at <= now)
            {
                let Some(Reverse(due)) = registry.heap.pop() else {
                    break;
                };
                if !Registry::is_live(&registry.slots, &due) {
                    continue;
                }
                let Some(slot) = registry.slots.get_mut(&due.id) else {
                    continue;
                };

                let skip = slot.in_flight;
                if skip {
                    warn!(
                        "Schedule {} is still running, skipping trigger at {}",
                        due.id, due.at
                    );
                } else {
                    slot.in_flight = true;
                    slot.entry.last_run = Some(now);
                    slot.entry.run_count += 1;
                    fired.push(slot.entry.definition.clone());
                }

                slot.entry.next_run = match self.compute_next(&slot.entry.definition, now) {
                    Ok(next) => next,
                    Err(e) => {
                        error!("Re-arming schedule {} failed: {e}", due.id);
                        None
                    }
                };
                debug!("Schedule {} next run {:?}", due.id, slot.entry.next_run);
                to_save.push(slot.entry.clone());
                registry.arm(&due.id);
            }
        }
        to_save.iter().for_each(|entry| self.persist(entry));
        fired
    }

    /// Records the outcome of a fired run and allows the schedule to fire
    /// again.
    pub fn record_outcome(&self, id: &str, success: bool) {
        let entry = {
            let mut registry = self.shared.lock();
            let Some(slot) = registry.slots.get_mut(id) else {
                return;
            };
            slot.in_flight = false;
            if success {
                slot.entry.success_count += 1;
            }
            slot.entry.clone()
        };
        self.persist(&entry);
    }

    fn dispatch(
        self: &Arc<Self>,
        pool: &ThreadPool,
        callback: &TriggerCallback,
        definition: ScheduleDefinition,
    ) {
        let scheduler = self.clone();
        let callback = callback.clone();
        pool.spawn(move || {
            info!("Schedule {} ({}) triggered", definition.id(), definition.name());
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&definition)));
            let success = match outcome {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!("Scheduled backup {} failed: {e}", definition.id());
                    false
                }
                Err(_) => {
                    error!("Scheduled backup {} panicked", definition.id());
                    false
                }
            };
            scheduler.record_outcome(definition.id(), success);
        });
    }

    /// Starts the scheduling loop on its own thread. Callbacks run on `pool`.
    ///
    /// The loop sleeps until the earliest due time, a registry change, or
    /// `poll_interval`, whichever comes first.
    pub fn start(
        self: &Arc<Self>,
        pool: Arc<ThreadPool>,
        callback: TriggerCallback,
        poll_interval: Duration,
    ) -> Result<SchedulerHandle> {
        self.shared.lock().shutdown = false;
        let scheduler = self.clone();
        let join = std::thread::Builder::new()
            .name("k-vault-scheduler".into())
            .spawn(move || scheduler.run_loop(pool, callback, poll_interval))
            .map_err(|e| Error::Scheduling(format!("spawning scheduler thread failed: {e}")))?;

        Ok(SchedulerHandle {
            shared: self.shared.clone(),
            join: Some(join),
        })
    }

    fn run_loop(self: Arc<Self>, pool: Arc<ThreadPool>, callback: TriggerCallback, poll: Duration) {
        info!("Scheduler loop started");
        loop {
            for definition in self.tick(Utc::now()) {
                self.dispatch(&pool, &callback, definition);
            }

            let mut registry = self.shared.lock();
            if registry.shutdown {
                break;
            }
            let wait = registry
                .peek_due()
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .map_or(poll, |until_due| until_due.min(poll));
            let (registry, _) = self
                .shared
                .wakeup
                .wait_timeout(registry, wait)
                .unwrap_or_else(PoisonError::into_inner);
            if registry.shutdown {
                break;
            }
        }
        info!("Scheduler loop stopped");
    }
}

/// Running scheduling loop. Dropping it stops the loop.
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Blocks until the loop exits.
    pub fn wait(mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("Scheduler thread panicked");
            }
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("Scheduler thread panicked");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
