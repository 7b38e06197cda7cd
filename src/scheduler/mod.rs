//! Scheduler core: job table, reconciliation, and the firing wheel
//!
//! Owns the in-memory job table and the bijection between durable schedule
//! ids and ephemeral local handles. A reconcile loop applies the store's
//! change feed to the table; a wheel task sleeps until the earliest due
//! instant and dispatches callbacks, but only while this replica holds the
//! lease. Non-leaders keep the table warm and drop missed instants.

mod plan;

pub use plan::{FiringPlan, UnsupportedDefinition};

use crate::elector::LeaderState;
use crate::model::{ChangeEvent, Schedule};
use crate::server::metrics::SharedMetrics;
use crate::server::{shutdown_channel, ShutdownSignal};
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "plan_test.rs"]
mod plan_tests;

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod scheduler_tests;

/// How long the wheel sleeps when no entry has a due instant
const IDLE_POLL: Duration = Duration::from_secs(60);

/// How long shutdown waits for in-flight callbacks before abandoning them
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Ephemeral handle for an installed schedule
///
/// Minted monotonically at install time, so ordering local ids is ordering
/// by installation, which is also the tie-break for coincident fires. The
/// handle survives in-place updates of the same schedule and dies with the
/// entry on removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The pluggable effect invoked when a schedule fires
///
/// Errors are logged and counted; they never uninstall the job or affect
/// future firings.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, schedule: &Schedule) -> anyhow::Result<()>;
}

/// Production job: records the firing event in the log
pub struct LogJob;

#[async_trait]
impl Job for LogJob {
    async fn run(&self, schedule: &Schedule) -> anyhow::Result<()> {
        info!(
            schedule.id = %schedule.id,
            schedule.name = %schedule.name,
            "running schedule"
        );
        Ok(())
    }
}

/// What the scheduler needs from the persistence layer
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    /// Full snapshot of the persisted schedule set
    async fn find_all(&self) -> Result<Vec<Schedule>, StoreError>;

    /// Change feed; ends when `shutdown` fires or the feed closes
    async fn watch(
        &self,
        shutdown: ShutdownSignal,
    ) -> Result<mpsc::Receiver<ChangeEvent<Schedule>>, StoreError>;
}

struct JobEntry {
    local_id: LocalId,
    schedule: Schedule,
    plan: FiringPlan,
}

/// A leader-approved dispatch, handed to a worker task
struct Firing {
    local_id: LocalId,
    schedule: Schedule,
}

/// Job table plus both directions of the global↔local id mapping
///
/// The reconciler is the only writer of membership; the wheel only advances
/// plans. Invariant: `locals` is the exact inverse of `entries`.
#[derive(Default)]
struct JobTable {
    entries: HashMap<String, JobEntry>,
    locals: HashMap<LocalId, String>,
    next_local: u64,
}

impl JobTable {
    fn mint(&mut self) -> LocalId {
        self.next_local += 1;
        LocalId(self.next_local)
    }

    fn earliest(&self) -> Option<DateTime<Utc>> {
        self.entries
            .values()
            .filter_map(|entry| entry.plan.next_at())
            .min()
    }

    /// Advance every due entry; return dispatches for those that fired
    ///
    /// Due entries are processed in installation order. Leadership is
    /// queried per entry at the fire decision; a non-leader advances the
    /// plan without dispatching, so the missed instant is dropped for good.
    fn collect_due(&mut self, now: DateTime<Utc>, leader: &LeaderState) -> (Vec<Firing>, u64) {
        let mut due: Vec<(LocalId, String)> = self
            .entries
            .values()
            .filter(|entry| entry.plan.next_at().is_some_and(|at| at <= now))
            .map(|entry| (entry.local_id, entry.schedule.id.clone()))
            .collect();
        due.sort_unstable();

        let mut firings = Vec::new();
        let mut skipped = 0;
        for (local_id, global_id) in due {
            let Some(entry) = self.entries.get_mut(&global_id) else {
                continue;
            };
            entry.plan.advance(now);
            if leader.is_leader() {
                firings.push(Firing {
                    local_id,
                    schedule: entry.schedule.clone(),
                });
            } else {
                skipped += 1;
                debug!(
                    schedule.id = %global_id,
                    local.id = %local_id,
                    "not leader, dropping fire"
                );
            }
        }
        (firings, skipped)
    }
}

/// The scheduling engine shared by all replicas
pub struct SchedulerCore {
    source: Arc<dyn ScheduleSource>,
    leader: LeaderState,
    job: Arc<dyn Job>,
    metrics: SharedMetrics,
    table: RwLock<JobTable>,
    wake: Notify,
}

impl SchedulerCore {
    pub fn new(
        source: Arc<dyn ScheduleSource>,
        leader: LeaderState,
        job: Arc<dyn Job>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            source,
            leader,
            job,
            metrics,
            table: RwLock::new(JobTable::default()),
            wake: Notify::new(),
        }
    }

    /// Run the scheduler until the change feed ends
    ///
    /// Installs the current snapshot (per-entry failures are logged and the
    /// entry skipped), opens the change feed, spawns the wheel, and applies
    /// events until the feed closes, then stops the wheel, which drains
    /// in-flight callbacks up to a bounded grace period.
    pub async fn start(self: Arc<Self>, shutdown: ShutdownSignal) -> Result<(), StoreError> {
        info!("starting scheduler");

        let snapshot = self.source.find_all().await?;
        for schedule in snapshot {
            let id = schedule.id.clone();
            if let Err(e) = self.upsert(schedule).await {
                error!(
                    schedule.id = %id,
                    error = %e,
                    "could not install stored schedule, skipping it"
                );
            }
        }

        let mut events = self.source.watch(shutdown).await?;

        let (wheel_control, wheel_signal) = shutdown_channel();
        let wheel = tokio::spawn(self.clone().run_wheel(wheel_signal));

        while let Some(event) = events.recv().await {
            info!(
                operation = event.operation(),
                schedule.id = event.id(),
                "received schedule change event"
            );
            self.metrics.record_reconcile(event.operation());
            match event {
                ChangeEvent::Insert { data, .. } | ChangeEvent::Update { data, .. } => {
                    let id = data.id.clone();
                    if let Err(e) = self.upsert(data).await {
                        error!(schedule.id = %id, error = %e, "error upserting schedule");
                    }
                }
                ChangeEvent::Delete { id } => {
                    self.remove(&id).await;
                }
            }
        }

        wheel_control.shutdown();
        if wheel.await.is_err() {
            warn!("wheel task ended abnormally");
        }
        info!("scheduler stopped");
        Ok(())
    }

    /// Install or update a schedule's job entry
    ///
    /// The definition is materialized first: an unsupported definition is
    /// rejected without touching existing state. Updates happen in place,
    /// preserving the local id; inserts mint one and record both mapping
    /// directions.
    pub async fn upsert(&self, schedule: Schedule) -> Result<(), UnsupportedDefinition> {
        let plan = FiringPlan::new(&schedule, Utc::now())?;
        let mut table = self.table.write().await;
        let installed = table.entries.get(&schedule.id).map(|entry| entry.local_id);
        match installed {
            Some(local_id) => {
                info!(
                    schedule.id = %schedule.id,
                    schedule.name = %schedule.name,
                    local.id = %local_id,
                    "updated scheduled job"
                );
                if let Some(entry) = table.entries.get_mut(&schedule.id) {
                    entry.schedule = schedule;
                    entry.plan = plan;
                }
            }
            None => {
                let local_id = table.mint();
                let global_id = schedule.id.clone();
                info!(
                    schedule.id = %global_id,
                    schedule.name = %schedule.name,
                    local.id = %local_id,
                    "added scheduled job"
                );
                table.entries.insert(
                    global_id.clone(),
                    JobEntry {
                        local_id,
                        schedule,
                        plan,
                    },
                );
                table.locals.insert(local_id, global_id);
            }
        }
        self.metrics.set_jobs_installed(table.entries.len() as i64);
        drop(table);
        self.wake.notify_one();
        Ok(())
    }

    /// Remove a schedule's job entry; a no-op when absent
    ///
    /// Idempotency matters here: the change feed may redeliver deletes.
    pub async fn remove(&self, global_id: &str) {
        let mut table = self.table.write().await;
        let Some(entry) = table.entries.remove(global_id) else {
            return;
        };
        table.locals.remove(&entry.local_id);
        info!(
            schedule.id = %global_id,
            local.id = %entry.local_id,
            "removed scheduled job"
        );
        self.metrics.set_jobs_installed(table.entries.len() as i64);
        drop(table);
        self.wake.notify_one();
    }

    /// The wheel: sleep to the earliest due instant, dispatch, repeat
    ///
    /// The sleep races the mutation signal so an upsert that moves the
    /// earliest instant closer wakes the wheel immediately. Callbacks run
    /// on worker tasks; a slow callback never blocks the wheel.
    async fn run_wheel(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut workers: JoinSet<()> = JoinSet::new();
        loop {
            while workers.try_join_next().is_some() {}

            let next = self.table.read().await.earliest();
            let sleep_for = match next {
                Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => IDLE_POLL,
            };

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = self.wake.notified() => continue,
                _ = tokio::time::sleep(sleep_for) => {}
            }

            let now = Utc::now();
            let (firings, skipped) = {
                let mut table = self.table.write().await;
                table.collect_due(now, &self.leader)
            };
            for _ in 0..skipped {
                self.metrics.record_fire("skipped");
            }

            for firing in firings {
                let job = self.job.clone();
                let metrics = self.metrics.clone();
                workers.spawn(async move {
                    match job.run(&firing.schedule).await {
                        Ok(()) => metrics.record_fire("success"),
                        Err(e) => {
                            error!(
                                schedule.id = %firing.schedule.id,
                                local.id = %firing.local_id,
                                error = %e,
                                "schedule callback failed"
                            );
                            metrics.record_fire("error");
                        }
                    }
                });
            }
        }

        if workers.is_empty() {
            return;
        }
        info!(in_flight = workers.len(), "draining in-flight callbacks");
        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            warn!("drain grace elapsed, abandoning in-flight callbacks");
            workers.abort_all();
        }
    }
}
