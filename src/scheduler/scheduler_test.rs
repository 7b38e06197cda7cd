#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use crate::model::{Schedule, ScheduleDefinition, ScheduleType};
use crate::server::{create_metrics, shutdown_channel, ShutdownController};
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Schedule source over process memory: a fixed snapshot plus a test-driven
/// event channel
struct InMemorySource {
    snapshot: Vec<Schedule>,
    events: Mutex<Option<mpsc::Receiver<ChangeEvent<Schedule>>>>,
}

#[async_trait]
impl ScheduleSource for InMemorySource {
    async fn find_all(&self) -> Result<Vec<Schedule>, StoreError> {
        Ok(self.snapshot.clone())
    }

    async fn watch(
        &self,
        _shutdown: ShutdownSignal,
    ) -> Result<mpsc::Receiver<ChangeEvent<Schedule>>, StoreError> {
        Ok(self.events.lock().await.take().expect("watch opened once"))
    }
}

/// Job that records which schedules fired
#[derive(Default)]
struct RecordingJob {
    fired: StdMutex<Vec<String>>,
}

impl RecordingJob {
    fn count(&self) -> usize {
        self.fired.lock().expect("not poisoned").len()
    }
}

#[async_trait]
impl Job for RecordingJob {
    async fn run(&self, schedule: &Schedule) -> anyhow::Result<()> {
        self.fired
            .lock()
            .expect("not poisoned")
            .push(schedule.id.clone());
        Ok(())
    }
}

/// Job whose every run fails
struct FailingJob {
    attempts: StdMutex<usize>,
}

#[async_trait]
impl Job for FailingJob {
    async fn run(&self, _schedule: &Schedule) -> anyhow::Result<()> {
        *self.attempts.lock().expect("not poisoned") += 1;
        anyhow::bail!("boom")
    }
}

fn duration_schedule(id: &str, interval: Duration) -> Schedule {
    Schedule {
        id: id.to_string(),
        name: format!("{id}-ticker"),
        schedule_type: ScheduleType::Duration,
        definition: ScheduleDefinition {
            interval: Some(interval),
            ..Default::default()
        },
    }
}

fn cron_schedule(id: &str, expression: &str) -> Schedule {
    Schedule {
        id: id.to_string(),
        name: id.to_string(),
        schedule_type: ScheduleType::Cron,
        definition: ScheduleDefinition {
            cron_expression: Some(expression.to_string()),
            ..Default::default()
        },
    }
}

struct Harness {
    core: Arc<SchedulerCore>,
    leader: LeaderState,
    job: Arc<RecordingJob>,
    tx: mpsc::Sender<ChangeEvent<Schedule>>,
    controller: ShutdownController,
    handle: JoinHandle<Result<(), StoreError>>,
}

impl Harness {
    async fn shut_down(self) {
        self.controller.shutdown();
        drop(self.tx);
        self.handle.await.expect("core task").expect("clean stop");
    }

    async fn installed(&self) -> Vec<(String, LocalId)> {
        let table = self.core.table.read().await;
        let mut out: Vec<(String, LocalId)> = table
            .entries
            .values()
            .map(|e| (e.schedule.id.clone(), e.local_id))
            .collect();
        out.sort();
        out
    }

    async fn assert_bijection(&self) {
        let table = self.core.table.read().await;
        assert_eq!(table.entries.len(), table.locals.len());
        for (global_id, entry) in &table.entries {
            assert_eq!(
                table.locals.get(&entry.local_id),
                Some(global_id),
                "reverse index must invert the entry table"
            );
        }
    }
}

async fn start_core(snapshot: Vec<Schedule>, leader_now: bool) -> Harness {
    start_core_with_job(snapshot, leader_now, Arc::new(RecordingJob::default())).await
}

async fn start_core_with_job(
    snapshot: Vec<Schedule>,
    leader_now: bool,
    job: Arc<RecordingJob>,
) -> Harness {
    let (tx, rx) = mpsc::channel(16);
    let source = Arc::new(InMemorySource {
        snapshot,
        events: Mutex::new(Some(rx)),
    });
    let leader = LeaderState::new();
    leader.set_leader(leader_now);
    let core = Arc::new(SchedulerCore::new(
        source,
        leader.clone(),
        job.clone(),
        create_metrics().expect("metrics"),
    ));
    let (controller, signal) = shutdown_channel();
    let handle = tokio::spawn(core.clone().start(signal));
    // Let the snapshot install and the wheel spin up
    tokio::time::sleep(Duration::from_millis(30)).await;
    Harness {
        core,
        leader,
        job,
        tx,
        controller,
        handle,
    }
}

#[tokio::test]
async fn test_snapshot_installs_entries_and_skips_invalid() {
    let harness = start_core(
        vec![
            duration_schedule("ok", Duration::from_secs(60)),
            cron_schedule("bad", "not a cron"),
        ],
        false,
    )
    .await;

    let installed = harness.installed().await;
    assert_eq!(installed.len(), 1, "invalid entry skipped, start survives");
    assert_eq!(installed[0].0, "ok");
    harness.assert_bijection().await;
    harness.shut_down().await;
}

#[tokio::test]
async fn test_leader_fires_interval_on_cadence() {
    let harness =
        start_core(vec![duration_schedule("tick", Duration::from_millis(50))], true).await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    let fired = harness.job.count();
    assert!(
        (3..=7).contains(&fired),
        "expected ~5 fires at 50ms cadence, got {fired}"
    );
    harness.shut_down().await;
}

#[tokio::test]
async fn test_cron_schedule_fires() {
    let harness = start_core(vec![cron_schedule("everysec", "* * * * * *")], true).await;

    tokio::time::sleep(Duration::from_millis(2200)).await;
    let fired = harness.job.count();
    assert!(
        (1..=3).contains(&fired),
        "expected 1-3 fires of an every-second cron in 2.2s, got {fired}"
    );
    harness.shut_down().await;
}

#[tokio::test]
async fn test_non_leader_keeps_table_warm_but_silent() {
    let harness =
        start_core(vec![duration_schedule("tick", Duration::from_millis(40))], false).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.job.count(), 0, "non-leader never fires");
    assert_eq!(harness.installed().await.len(), 1, "table stays warm");
    harness.shut_down().await;
}

#[tokio::test]
async fn test_no_catch_up_when_gaining_leadership() {
    let harness =
        start_core(vec![duration_schedule("tick", Duration::from_millis(100))], false).await;

    // Several due instants pass while not leader
    tokio::time::sleep(Duration::from_millis(250)).await;
    harness.leader.set_leader(true);

    // Nothing fires at the moment of acquiring leadership
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.job.count(), 0, "missed instants are dropped");

    // The next grid instant fires normally
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(harness.job.count() >= 1, "firing resumes on the next instant");
    harness.shut_down().await;
}

#[tokio::test]
async fn test_insert_event_installs_job() {
    let harness = start_core(vec![], true).await;

    harness
        .tx
        .send(ChangeEvent::Insert {
            id: "live".to_string(),
            data: duration_schedule("live", Duration::from_millis(50)),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.job.count() >= 2, "freshly inserted schedule fires");
    harness.shut_down().await;
}

#[tokio::test]
async fn test_update_preserves_local_id_and_applies_definition() {
    let harness =
        start_core(vec![duration_schedule("s", Duration::from_secs(10))], false).await;

    let before = harness.installed().await;
    let local_before = before[0].1;

    harness
        .tx
        .send(ChangeEvent::Update {
            id: "s".to_string(),
            data: duration_schedule("s", Duration::from_secs(20)),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let after = harness.installed().await;
    assert_eq!(after[0].1, local_before, "update happens in place");
    {
        let table = harness.core.table.read().await;
        let entry = table.entries.get("s").unwrap();
        assert_eq!(
            entry.schedule.definition.interval,
            Some(Duration::from_secs(20))
        );
    }
    harness.assert_bijection().await;
    harness.shut_down().await;
}

#[tokio::test]
async fn test_update_to_sooner_interval_wakes_the_wheel() {
    // The wheel is asleep until T+1h; the update must cut that sleep short
    let harness =
        start_core(vec![duration_schedule("s", Duration::from_secs(3600))], true).await;

    harness
        .tx
        .send(ChangeEvent::Update {
            id: "s".to_string(),
            data: duration_schedule("s", Duration::from_millis(50)),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        harness.job.count() >= 2,
        "shorter interval takes effect without waiting out the old sleep"
    );
    harness.shut_down().await;
}

#[tokio::test]
async fn test_delete_stops_firing() {
    let harness =
        start_core(vec![duration_schedule("tick", Duration::from_millis(40))], true).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    harness
        .tx
        .send(ChangeEvent::Delete {
            id: "tick".to_string(),
        })
        .await
        .unwrap();
    // Let the delete apply and any in-flight dispatch settle
    tokio::time::sleep(Duration::from_millis(60)).await;

    let after_delete = harness.job.count();
    assert!(after_delete >= 1, "schedule fired before the delete");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.job.count(), after_delete, "no fires after delete");
    assert!(harness.installed().await.is_empty());
    harness.shut_down().await;
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let harness = start_core(vec![duration_schedule("a", Duration::from_secs(60))], false).await;

    harness.core.remove("a").await;
    let once = harness.installed().await;
    harness.core.remove("a").await;
    let twice = harness.installed().await;

    assert_eq!(once, twice);
    assert!(twice.is_empty());
    harness.assert_bijection().await;
    harness.shut_down().await;
}

#[tokio::test]
async fn test_unsupported_update_leaves_existing_entry_untouched() {
    let harness = start_core(vec![duration_schedule("s", Duration::from_secs(30))], false).await;
    let before = harness.installed().await;

    let err = harness
        .core
        .upsert(cron_schedule("s", "definitely not cron"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unsupported"));

    let after = harness.installed().await;
    assert_eq!(after, before, "rejected definition must not touch state");
    {
        let table = harness.core.table.read().await;
        let entry = table.entries.get("s").unwrap();
        assert_eq!(entry.schedule.schedule_type, ScheduleType::Duration);
    }
    harness.shut_down().await;
}

#[tokio::test]
async fn test_event_sequence_reconverges_to_store_state() {
    let harness = start_core(vec![], false).await;

    let events = vec![
        ChangeEvent::Insert {
            id: "a".to_string(),
            data: duration_schedule("a", Duration::from_secs(10)),
        },
        ChangeEvent::Insert {
            id: "b".to_string(),
            data: duration_schedule("b", Duration::from_secs(10)),
        },
        ChangeEvent::Update {
            id: "a".to_string(),
            data: duration_schedule("a", Duration::from_secs(20)),
        },
        ChangeEvent::Delete {
            id: "b".to_string(),
        },
        ChangeEvent::Delete {
            id: "b".to_string(),
        },
    ];
    for event in events {
        harness.tx.send(event).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let installed = harness.installed().await;
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].0, "a");
    {
        let table = harness.core.table.read().await;
        assert_eq!(
            table.entries.get("a").unwrap().schedule.definition.interval,
            Some(Duration::from_secs(20)),
            "effects converge to the last-written definition"
        );
    }
    harness.assert_bijection().await;
    harness.shut_down().await;
}

#[tokio::test]
async fn test_at_times_fires_each_once_then_stays_listable() {
    let soon = Utc::now() + chrono::Duration::milliseconds(80);
    let later = Utc::now() + chrono::Duration::milliseconds(160);
    let schedule = Schedule {
        id: "once".to_string(),
        name: "two-shot".to_string(),
        schedule_type: ScheduleType::AtTimes,
        definition: ScheduleDefinition {
            times: Some(vec![soon, later]),
            ..Default::default()
        },
    };

    let harness = start_core(vec![schedule], true).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(harness.job.count(), 2, "each instant fires exactly once");
    let installed = harness.installed().await;
    assert_eq!(installed.len(), 1, "quiescent entry remains installed");
    {
        let table = harness.core.table.read().await;
        assert!(table.entries.get("once").unwrap().plan.is_quiescent());
    }
    harness.shut_down().await;
}

#[tokio::test]
async fn test_failing_callback_does_not_uninstall_job() {
    let (tx, rx) = mpsc::channel(16);
    let source = Arc::new(InMemorySource {
        snapshot: vec![duration_schedule("flaky", Duration::from_millis(50))],
        events: Mutex::new(Some(rx)),
    });
    let leader = LeaderState::new();
    leader.set_leader(true);
    let job = Arc::new(FailingJob {
        attempts: StdMutex::new(0),
    });
    let core = Arc::new(SchedulerCore::new(
        source,
        leader,
        job.clone(),
        create_metrics().expect("metrics"),
    ));
    let (controller, signal) = shutdown_channel();
    let handle = tokio::spawn(core.clone().start(signal));

    tokio::time::sleep(Duration::from_millis(250)).await;
    let attempts = *job.attempts.lock().expect("not poisoned");
    assert!(
        attempts >= 2,
        "failures are logged, the job keeps firing (got {attempts})"
    );
    assert_eq!(core.table.read().await.entries.len(), 1);

    controller.shutdown();
    drop(tx);
    handle.await.expect("core task").expect("clean stop");
}

#[tokio::test]
async fn test_coincident_fires_run_in_installation_order() {
    let harness = start_core(vec![], true).await;

    // Same interval, installed in a known order; both fire at the same
    // instant and must dispatch in installation order
    harness.core.upsert(duration_schedule("first", Duration::from_millis(80))).await.unwrap();
    harness.core.upsert(duration_schedule("second", Duration::from_millis(80))).await.unwrap();

    tokio::time::sleep(Duration::from_millis(140)).await;
    let fired = harness.job.fired.lock().expect("not poisoned").clone();
    assert!(fired.len() >= 2, "both coincident entries fired, got {fired:?}");
    assert_eq!(fired[0], "first");
    assert_eq!(fired[1], "second");
    harness.shut_down().await;
}
