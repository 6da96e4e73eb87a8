//! Load-adaptive background generation scheduling.
//!
//! The scheduler owns one background worker thread that continuously pulls
//! the nearest not-yet-generated batch of cells from the coverage map,
//! deduplicates it against in-flight work, claims each cell under a bounded
//! permit pool, and hands the claims to the host's single-threaded executor.
//! The host tick feeds back health, movement, and configuration changes.
//! Work pauses whenever the host is struggling or paused and resumes by
//! itself; progress survives restarts through the injected progress store.

mod shared;
mod worker;

use self::shared::{
    ContextState,
    Shared,
    effective_radius,
};
use crate::{
    cell::key_to_cell,
    coverage::CoverageMap,
    host::{
        ConfigSource,
        FastGen,
        IngestSink,
        PauseCheck,
        Poi,
        ProgressStore,
        WorldHost,
        WorldId,
    },
    stats::GenStats,
    tick_health::TickHealth,
    util_permits::Permits,
};
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            AtomicI64,
            AtomicU64,
            Ordering,
        },
    },
    thread::{
        self,
        JoinHandle,
    },
};
use parking_lot::{
    Condvar,
    Mutex,
};
use vek::*;


// rescan the remaining estimate when the point of interest moves at least
// this far, in squared cells
const RESCAN_DIST_SQ: i64 = 4;


/// Everything the host environment injects into the scheduler.
pub struct Hooks {
    pub host: Arc<dyn WorldHost>,
    pub store: Arc<dyn ProgressStore>,
    pub fast_gen: Option<Arc<dyn FastGen>>,
    pub ingest_sink: Option<Arc<dyn IngestSink>>,
    pub pause_check: PauseCheck,
    pub config_source: ConfigSource,
}

impl Hooks {
    /// Construct with the required hooks, no optional capabilities, and a
    /// never-paused pause check.
    pub fn new(
        host: Arc<dyn WorldHost>,
        store: Arc<dyn ProgressStore>,
        config_source: ConfigSource,
    ) -> Self {
        Hooks {
            host,
            store,
            fast_gen: None,
            ingest_sink: None,
            pause_check: Box::new(|| false),
            config_source,
        }
    }
}

/// Read-only snapshot of scheduler state, safe to take from any thread.
#[derive(Debug, Copy, Clone)]
pub struct Status {
    pub throttled: bool,
    pub active_tasks: u64,
    pub remaining_in_radius: u64,
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cells_per_second: f64,
    pub world_available: bool,
}

/// Background terrain generation scheduler. One instance per host process,
/// owned by the composition root; one live world context at a time.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Load configuration, probe the optional capabilities, and start the
    /// worker thread.
    pub fn start(hooks: Hooks) -> Self {
        let config = (hooks.config_source)();
        info!(?config, "starting generation scheduler");

        // optional integrations are probed once and degrade silently
        let fast_available = hooks.fast_gen.as_ref().map(|g| g.probe()).unwrap_or(false);
        let ingest_available = hooks.ingest_sink.as_ref().map(|s| s.probe()).unwrap_or(false);
        info!(fast_available, ingest_available, "probed optional integrations");

        let shared = Arc::new(Shared {
            host: hooks.host,
            store: hooks.store,
            fast_gen: hooks.fast_gen,
            ingest_sink: hooks.ingest_sink,
            pause_check: hooks.pause_check,
            config_source: hooks.config_source,
            fast_available,
            ingest_available,
            permits: Permits::new(config.max_active_tasks),
            config: Mutex::new(config),
            running: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            context: Mutex::new(None),
            completed: Mutex::new(HashSet::new()),
            tracked: Mutex::new(HashSet::new()),
            claimed_batches: Mutex::new(HashSet::new()),
            batch_counters: Mutex::new(HashMap::new()),
            pending_samples: Mutex::new(HashMap::new()),
            stats: GenStats::new(),
            health: TickHealth::new(),
            active_tasks: AtomicI64::new(0),
            remaining: AtomicI64::new(0),
            reload_requested: AtomicBool::new(false),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || worker::worker_body(shared))
        };

        Scheduler {
            shared,
            worker: Some(worker),
        }
    }

    /// Call once per host tick, from the host thread. Feeds the health
    /// monitor and stats, applies a scheduled config reload, and observes
    /// the current point of interest (or its absence).
    pub fn tick(&self, poi: Option<Poi>) {
        let shared = &self.shared;
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }
        if shared.reload_requested.swap(false, Ordering::SeqCst) {
            shared.apply_config_reload();
        }
        shared.health.tick();
        shared.stats.tick();
        shared.observe_poi(poi);
    }

    /// Ask for configuration to be re-read on the next host tick.
    pub fn schedule_config_reload(&self) {
        self.shared.reload_requested.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> Status {
        let shared = &self.shared;
        Status {
            throttled: shared.health.is_throttled(),
            active_tasks: shared.active_tasks.load(Ordering::SeqCst).max(0) as u64,
            remaining_in_radius: shared.remaining.load(Ordering::SeqCst).max(0) as u64,
            queued: shared.stats.queued(),
            completed: shared.stats.completed(),
            failed: shared.stats.failed(),
            skipped: shared.stats.skipped(),
            cells_per_second: shared.stats.cells_per_second(),
            world_available: shared.context.lock().is_some(),
        }
    }

    /// Stop the worker, persist the active context's progress, and reset.
    /// Generation completions landing after this become no-ops.
    pub fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.wake_worker();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);

        let context = self.shared.context.lock().take();
        if let Some(context) = context {
            self.shared.save_progress(&context.world);
        }
        self.shared.clear_context_state();
        self.shared.stats.reset();
        self.shared.health.reset();
        self.shared.remaining.store(0, Ordering::SeqCst);
        info!("generation scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// tick-side logic, all of it running on the host thread
impl Shared {
    fn observe_poi(&self, poi: Option<Poi>) {
        let mut context = self.context.lock();
        let Some(poi) = poi else {
            // no center this tick; the worker idles until one returns
            if let Some(context) = context.as_mut() {
                context.center = None;
            }
            return;
        };

        match context.as_mut() {
            Some(ctx) if ctx.world == poi.world => {
                ctx.center = Some(poi.cell);
                let moved = ctx.last_scan_center
                    .map(|last| dist_sq(last, poi.cell) >= RESCAN_DIST_SQ)
                    .unwrap_or(true);
                if moved {
                    // movement only re-biases future batch selection;
                    // in-flight work is left alone
                    ctx.last_scan_center = Some(poi.cell);
                    let config = self.config.lock().clone();
                    let radius = effective_radius(&config, ctx.fast_active);
                    let remaining = ctx.coverage.count_missing_in_range(poi.cell, radius);
                    self.remaining.store(remaining as i64, Ordering::SeqCst);
                }
            }
            _ => self.switch_context(&mut context, poi),
        }
    }

    // the point of interest is in a different world now: persist and discard
    // the old context, build the new one from saved progress
    fn switch_context(&self, slot: &mut Option<ContextState>, poi: Poi) {
        if let Some(old) = slot.take() {
            info!(from = %old.world, to = %poi.world, "world context changed");
            self.save_progress(&old.world);
        }

        // invalidate in-flight resolutions before clearing their state
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.clear_context_state();

        let restored = match self.store.load(&poi.world) {
            Ok(restored) => restored,
            Err(e) => {
                // an empty set is safe: already-done work regenerates
                error!("failed to load generation progress for {}: {}", poi.world, e);
                HashSet::new()
            }
        };
        let coverage = Arc::new(CoverageMap::new());
        {
            let mut completed = self.completed.lock();
            for &key in &restored {
                completed.insert(key);
            }
        }
        for &key in &restored {
            coverage.mark_complete(key_to_cell(key));
        }

        let fast_active = self.fast_available
            && self.fast_gen.as_ref().map(|g| g.is_active(&poi.world)).unwrap_or(false);
        if fast_active {
            info!(world = %poi.world, "fast-path generation active");
        }

        let config = self.config.lock().clone();
        let radius = effective_radius(&config, fast_active);
        let remaining = coverage.count_missing_in_range(poi.cell, radius);
        self.remaining.store(remaining as i64, Ordering::SeqCst);
        info!(
            world = %poi.world,
            restored = restored.len(),
            remaining,
            "entered world context"
        );

        *slot = Some(ContextState {
            epoch: self.epoch.load(Ordering::SeqCst),
            world: poi.world,
            coverage,
            fast_active,
            center: Some(poi.cell),
            last_scan_center: Some(poi.cell),
        });
    }

    fn save_progress(&self, world: &WorldId) {
        let completed = self.completed.lock().clone();
        if let Err(e) = self.store.save(world, &completed) {
            // this session's progress is lost on next load, nothing worse
            error!("failed to save generation progress for {}: {}", world, e);
        }
    }

    fn clear_context_state(&self) {
        self.completed.lock().clear();
        self.tracked.lock().clear();
        self.claimed_batches.lock().clear();
        self.batch_counters.lock().clear();
        self.pending_samples.lock().clear();
    }

    fn apply_config_reload(&self) {
        let config = (self.config_source)();
        info!(?config, "applying configuration reload");
        self.permits.set_capacity(config.max_active_tasks);
        *self.config.lock() = config;
        self.rescan();
    }

    // refresh the remaining-in-radius estimate from the coverage map
    fn rescan(&self) {
        let mut context = self.context.lock();
        if let Some(ctx) = context.as_mut() {
            if let Some(center) = ctx.center {
                let config = self.config.lock().clone();
                let radius = effective_radius(&config, ctx.fast_active);
                let remaining = ctx.coverage.count_missing_in_range(center, radius);
                self.remaining.store(remaining as i64, Ordering::SeqCst);
                ctx.last_scan_center = Some(center);
            }
        }
    }
}

fn dist_sq(a: Vec2<i32>, b: Vec2<i32>) -> i64 {
    let dx = (a.x - b.x) as i64;
    let dz = (a.y - b.y) as i64;
    dx * dx + dz * dz
}
