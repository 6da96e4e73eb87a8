//! State shared between the worker thread, the host executor, and generation
//! completion callbacks, with the resolution paths that mutate it.

use crate::{
    cell::{
        batch_key,
        cell_key,
    },
    config::Config,
    coverage::CoverageMap,
    host::{
        ConfigSource,
        FastGen,
        IngestSink,
        PauseCheck,
        ProducedChunk,
        ProgressStore,
        SampleData,
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
    time::Duration,
};
use parking_lot::{
    Condvar,
    Mutex,
};
use vek::*;


// how long a single permit wait may block the worker before it rechecks the
// running flag
const PERMIT_POLL: Duration = Duration::from_millis(100);

// with the fast path active a large radius is affordable, so never use less
// than this
const FAST_PATH_MIN_RADIUS: i32 = 128;


// state shared across all three execution contexts. one instance per
// scheduler, kept alive by in-flight callbacks via Arc.
pub(super) struct Shared {
    // injected host adapters
    pub host: Arc<dyn WorldHost>,
    pub store: Arc<dyn ProgressStore>,
    pub fast_gen: Option<Arc<dyn FastGen>>,
    pub ingest_sink: Option<Arc<dyn IngestSink>>,
    pub pause_check: PauseCheck,
    pub config_source: ConfigSource,
    // capability probes, performed once at startup
    pub fast_available: bool,
    pub ingest_available: bool,

    pub config: Mutex<Config>,
    pub running: AtomicBool,
    // bumped on context switch and shutdown; resolutions carrying a stale
    // epoch must not touch per-context state
    pub epoch: AtomicU64,
    pub context: Mutex<Option<ContextState>>,

    // per-context cell keys known generated
    pub completed: Mutex<HashSet<u64>>,
    // cell keys claimed and not yet resolved
    pub tracked: Mutex<HashSet<u64>>,
    // batch keys being produced or drained, so the same batch is not
    // re-emitted while outstanding
    pub claimed_batches: Mutex<HashSet<u64>>,
    // per claimed batch, cells still outstanding
    pub batch_counters: Mutex<HashMap<u64, u32>>,
    // fast-path data captured on the worker, consumed on the host thread
    pub pending_samples: Mutex<HashMap<u64, SampleData>>,

    pub permits: Permits,
    pub stats: GenStats,
    pub health: TickHealth,
    pub active_tasks: AtomicI64,
    pub remaining: AtomicI64,
    pub reload_requested: AtomicBool,

    // worker idle sleeps, interruptible by shutdown
    pub idle_lock: Mutex<()>,
    pub idle_cv: Condvar,
}

// the live world context. owned by the host thread; the worker sees it only
// through snapshots
pub(super) struct ContextState {
    pub epoch: u64,
    pub world: WorldId,
    pub coverage: Arc<CoverageMap>,
    pub fast_active: bool,
    pub center: Option<Vec2<i32>>,
    pub last_scan_center: Option<Vec2<i32>>,
}

/// A claim's view of the context it was made against. Resolutions check the
/// epoch before touching per-context state.
#[derive(Clone)]
pub(super) struct ContextTicket {
    pub epoch: u64,
    pub world: WorldId,
    pub coverage: Arc<CoverageMap>,
    pub fast_active: bool,
}

impl Shared {
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    pub fn context_snapshot(&self) -> Option<(ContextTicket, Option<Vec2<i32>>)> {
        let context = self.context.lock();
        context.as_ref().map(|ctx| (
            ContextTicket {
                epoch: ctx.epoch,
                world: ctx.world.clone(),
                coverage: Arc::clone(&ctx.coverage),
                fast_active: ctx.fast_active,
            },
            ctx.center,
        ))
    }

    /// Sleep until the timeout elapses or shutdown wakes the worker.
    pub fn idle_wait(&self, timeout: Duration) {
        let mut guard = self.idle_lock.lock();
        if self.running.load(Ordering::SeqCst) {
            self.idle_cv.wait_for(&mut guard, timeout);
        }
    }

    pub fn wake_worker(&self) {
        let _guard = self.idle_lock.lock();
        self.idle_cv.notify_all();
    }

    /// Block for a permit, rechecking the running flag periodically so
    /// shutdown never strands the worker. Returns false when shutting down.
    pub fn acquire_permit(&self) -> bool {
        while self.running.load(Ordering::SeqCst) {
            if self.permits.acquire(PERMIT_POLL) {
                return true;
            }
        }
        false
    }

    /// A cell turned out generated: record it, teach the coverage map, and
    /// count down its batch. Idempotent; a cell already known generated
    /// counts as skipped instead.
    pub fn resolve_success(&self, ctx: &ContextTicket, cell: Vec2<i32>) {
        let mut completed = self.completed.lock();
        // epoch checked under the lock so a context switch can't interleave
        if !self.is_current(ctx.epoch) {
            return;
        }
        if completed.insert(cell_key(cell)) {
            drop(completed);
            self.stats.add_completed();
            ctx.coverage.mark_complete(cell);
            self.remaining.fetch_sub(1, Ordering::SeqCst);
        } else {
            drop(completed);
            self.stats.add_skipped();
        }
        self.countdown_batch(cell);
    }

    /// A cell's generation failed or its claim was lost. The cell stays
    /// unmarked and gets retried naturally on a later scan pass.
    pub fn resolve_failure(&self, ctx: &ContextTicket, cell: Vec2<i32>) {
        if !self.is_current(ctx.epoch) {
            return;
        }
        self.stats.add_failed();
        self.remaining.fetch_sub(1, Ordering::SeqCst);
        self.countdown_batch(cell);
    }

    /// Release a claimed cell's permit and in-flight membership after its
    /// resolution. Safe on any thread and with a stale ticket.
    pub fn finish_cell(&self, ctx: &ContextTicket, cell: Vec2<i32>) {
        if self.is_current(ctx.epoch) {
            self.tracked.lock().remove(&cell_key(cell));
        }
        self.active_tasks.fetch_sub(1, Ordering::SeqCst);
        self.permits.release();
    }

    /// Forward a produced chunk to the ingestion sink, if one is available.
    /// Best-effort: failures are logged and nothing else.
    pub fn ingest(&self, chunk: ProducedChunk) {
        if !self.ingest_available {
            return;
        }
        if let Some(sink) = &self.ingest_sink {
            if let Err(e) = sink.ingest(chunk) {
                error!("failed to ingest produced chunk: {}", e);
            }
        }
    }

    /// Drop a batch claim outright, e.g. when pre-filtering emptied it.
    pub fn release_batch(&self, key: u64) {
        self.batch_counters.lock().remove(&key);
        self.claimed_batches.lock().remove(&key);
    }

    // one of the batch's cells resolved; the batch claim lifts when the last
    // one does
    fn countdown_batch(&self, cell: Vec2<i32>) {
        let key = batch_key(cell);
        let mut counters = self.batch_counters.lock();
        if let Some(count) = counters.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.remove(&key);
                self.claimed_batches.lock().remove(&key);
            }
        }
    }
}

pub(super) fn effective_radius(config: &Config, fast_active: bool) -> i32 {
    if fast_active {
        config.generation_radius.max(FAST_PATH_MIN_RADIUS)
    } else {
        config.generation_radius
    }
}
