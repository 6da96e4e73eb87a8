//! Integration tests driving the scheduler against scripted hosts.
//!
//! The test thread plays the host's main thread: submitted jobs queue up and
//! run when the test pumps them, and generation callbacks fire when the test
//! decides, so the interleavings under test are exact.

use pregen::{
    cell::{
        batch_cells,
        batch_of,
        cell_key,
    },
    config::Config,
    host::*,
    scheduler::{
        Hooks,
        Scheduler,
    },
};
use std::{
    collections::{
        HashMap,
        HashSet,
        VecDeque,
    },
    sync::Arc,
    thread,
    time::{
        Duration,
        Instant,
    },
};
use parking_lot::Mutex;
use vek::*;


const PUMP_STEP: Duration = Duration::from_millis(10);
const PUMP_TIMEOUT: Duration = Duration::from_secs(30);


#[derive(Default)]
struct TestHost {
    jobs: Mutex<VecDeque<HostJob>>,
    generated: Mutex<HashSet<u64>>,
    // held generation callbacks, when not auto-completing
    pending: Mutex<Vec<(WorldId, Vec2<i32>, DoneCallback)>>,
    auto_complete: bool,
}

impl TestHost {
    fn manual() -> Arc<Self> {
        Arc::new(TestHost::default())
    }

    fn auto() -> Arc<Self> {
        Arc::new(TestHost {
            auto_complete: true,
            ..TestHost::default()
        })
    }

    // play the host main thread until the mailbox is empty
    fn run_jobs(&self) {
        loop {
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => job(),
                None => break,
            }
        }
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn take_pending(&self) -> Vec<(WorldId, Vec2<i32>, DoneCallback)> {
        std::mem::take(&mut *self.pending.lock())
    }
}

impl WorldHost for TestHost {
    fn submit(&self, job: HostJob) {
        self.jobs.lock().push_back(job);
    }

    fn is_generated(&self, _world: &WorldId, cell: Vec2<i32>) -> bool {
        self.generated.lock().contains(&cell_key(cell))
    }

    fn generate(&self, world: &WorldId, cell: Vec2<i32>, done: DoneCallback) {
        if self.auto_complete {
            done(GenOutcome::Generated(None));
        } else {
            self.pending.lock().push((world.clone(), cell, done));
        }
    }
}

#[derive(Default)]
struct MemStore(Mutex<HashMap<String, HashSet<u64>>>);

impl ProgressStore for MemStore {
    fn load(&self, world: &WorldId) -> anyhow::Result<HashSet<u64>> {
        Ok(self.0.lock().get(world.as_str()).cloned().unwrap_or_default())
    }

    fn save(&self, world: &WorldId, cells: &HashSet<u64>) -> anyhow::Result<()> {
        self.0.lock().insert(world.as_str().to_owned(), cells.clone());
        Ok(())
    }
}

fn fixed_config(enabled: bool, radius: i32, tasks: usize) -> ConfigSource {
    Box::new(move || Config {
        enabled,
        generation_radius: radius,
        max_active_tasks: tasks,
        max_queue_size: 20000,
    })
}

fn start(host: &Arc<TestHost>, store: &Arc<MemStore>, config: ConfigSource) -> Scheduler {
    Scheduler::start(Hooks::new(
        Arc::clone(host) as Arc<dyn WorldHost>,
        Arc::clone(store) as Arc<dyn ProgressStore>,
        config,
    ))
}

fn poi(world: &str, x: i32, z: i32) -> Poi {
    Poi {
        world: WorldId::new(world),
        cell: Vec2::new(x, z),
    }
}

// tick the host and pump its mailbox until the condition holds
fn pump_until(
    scheduler: &Scheduler,
    host: &TestHost,
    poi: &Poi,
    mut condition: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + PUMP_TIMEOUT;
    while Instant::now() < deadline {
        host.run_jobs();
        scheduler.tick(Some(poi.clone()));
        if condition() {
            return true;
        }
        thread::sleep(PUMP_STEP);
    }
    false
}

// number of cells the scheduler considers in range of a radius-4 scan: the
// center batch and its four edge neighbors
const RADIUS_4_CELLS: u64 = 80;


#[test]
fn drains_radius_to_zero() {
    let host = TestHost::auto();
    let store = Arc::new(MemStore::default());
    let mut scheduler = start(&host, &store, fixed_config(true, 4, 8));
    let poi = poi("overworld", 0, 0);

    let drained = pump_until(&scheduler, &host, &poi, || {
        let status = scheduler.status();
        status.world_available
            && status.remaining_in_radius == 0
            && status.active_tasks == 0
    });
    assert!(drained, "radius never drained: {:?}", scheduler.status());

    let status = scheduler.status();
    assert_eq!(status.completed, RADIUS_4_CELLS);
    assert_eq!(status.queued, RADIUS_4_CELLS);
    assert_eq!(status.failed, 0);

    scheduler.shutdown();
    let saved = store.0.lock().get("overworld").cloned().unwrap();
    assert_eq!(saved.len(), RADIUS_4_CELLS as usize);
}

#[test]
fn concurrency_cap_is_never_exceeded() {
    let host = TestHost::manual();
    let store = Arc::new(MemStore::default());
    let scheduler = start(&host, &store, fixed_config(true, 8, 4));
    let poi = poi("overworld", 0, 0);

    // the worker should saturate the cap and stall there
    let saturated = pump_until(&scheduler, &host, &poi, || {
        assert!(scheduler.status().active_tasks <= 4);
        assert!(host.pending_count() <= 4);
        host.pending_count() == 4
    });
    assert!(saturated);

    // completing two frees exactly two slots
    let mut held = host.take_pending();
    for (_, _, done) in held.drain(..2) {
        done(GenOutcome::Generated(None));
    }
    for (world, cell, done) in held {
        host.pending.lock().push((world, cell, done));
    }

    let refilled = pump_until(&scheduler, &host, &poi, || {
        assert!(scheduler.status().active_tasks <= 4);
        assert!(host.pending_count() <= 4);
        host.pending_count() == 4
    });
    assert!(refilled);
    assert_eq!(scheduler.status().completed, 2);
}

#[test]
fn stale_completions_do_not_leak_across_contexts() {
    let host = TestHost::manual();
    let store = Arc::new(MemStore::default());
    let mut scheduler = start(&host, &store, fixed_config(true, 4, 16));

    // get some world-a generation in flight, then hold its callbacks
    let poi_a = poi("world-a", 0, 0);
    assert!(pump_until(&scheduler, &host, &poi_a, || host.pending_count() >= 8));
    let held = host.take_pending();
    assert!(!held.is_empty());

    // hop to world b; the scan starts over
    let poi_b = poi("world-b", 0, 0);
    assert!(pump_until(&scheduler, &host, &poi_b, || {
        scheduler.status().remaining_in_radius == RADIUS_4_CELLS
    }));
    let completed_before = scheduler.status().completed;

    // old-context completions landing now must be ignored entirely
    for (_, _, done) in held {
        done(GenOutcome::Generated(None));
    }
    host.run_jobs();
    scheduler.tick(Some(poi_b.clone()));

    let status = scheduler.status();
    assert_eq!(status.completed, completed_before);
    assert_eq!(status.remaining_in_radius, RADIUS_4_CELLS);

    // nothing of world a's work may appear in world b's saved progress
    scheduler.shutdown();
    let saved_b = store.0.lock().get("world-b").cloned().unwrap_or_default();
    assert!(saved_b.is_empty(), "world-b inherited cells: {:?}", saved_b);
}

#[test]
fn restored_progress_is_not_regenerated() {
    let host = TestHost::manual();
    let store = Arc::new(MemStore::default());

    // one batch of progress saved from an earlier session
    let seeded_batch = Vec2::new(0, 0);
    let seeded = batch_cells(seeded_batch).iter()
        .map(|&cell| cell_key(cell))
        .collect::<HashSet<u64>>();
    store.0.lock().insert("overworld".to_owned(), seeded.clone());

    let scheduler = start(&host, &store, fixed_config(true, 4, 100));
    let poi = poi("overworld", 0, 0);

    scheduler.tick(Some(poi.clone()));
    assert_eq!(
        scheduler.status().remaining_in_radius,
        RADIUS_4_CELLS - seeded.len() as u64,
    );

    // everything else gets dispatched; the seeded batch never does
    let expected = (RADIUS_4_CELLS - seeded.len() as u64) as usize;
    assert!(pump_until(&scheduler, &host, &poi, || host.pending_count() == expected));
    thread::sleep(Duration::from_millis(200));
    host.run_jobs();
    assert_eq!(host.pending_count(), expected);
    for (_, cell, _) in host.pending.lock().iter() {
        assert_ne!(batch_of(*cell), seeded_batch);
    }
}

#[test]
fn disabled_scheduler_claims_nothing() {
    let host = TestHost::manual();
    let store = Arc::new(MemStore::default());
    let scheduler = start(&host, &store, fixed_config(false, 4, 8));
    let poi = poi("overworld", 0, 0);

    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline {
        host.run_jobs();
        scheduler.tick(Some(poi.clone()));
        thread::sleep(PUMP_STEP);
    }
    let status = scheduler.status();
    assert_eq!(status.queued, 0);
    assert_eq!(host.pending_count(), 0);
    // the context still exists and the estimate is still published
    assert!(status.world_available);
    assert_eq!(status.remaining_in_radius, RADIUS_4_CELLS);
}

#[test]
fn shutdown_is_prompt_even_when_permit_starved() {
    let host = TestHost::manual();
    let store = Arc::new(MemStore::default());
    let mut scheduler = start(&host, &store, fixed_config(true, 8, 2));
    let poi = poi("overworld", 0, 0);

    // saturate the permit pool so the worker is blocked waiting
    assert!(pump_until(&scheduler, &host, &poi, || host.pending_count() == 2));

    let started = Instant::now();
    scheduler.shutdown();
    assert!(started.elapsed() < Duration::from_secs(2));

    // completions landing after shutdown are no-ops
    for (_, _, done) in host.take_pending() {
        done(GenOutcome::Generated(None));
    }
    host.run_jobs();
    assert_eq!(scheduler.status().completed, 0);
}
