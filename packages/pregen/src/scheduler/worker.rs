//! The work-producing loop: turns "nearest undone work" into a bounded
//! stream of generation requests on the host executor.

use super::shared::{
    ContextTicket,
    Shared,
    effective_radius,
};
use crate::{
    cell::{
        batch_key,
        cell_key,
    },
    host::GenOutcome,
};
use std::{
    panic::{
        AssertUnwindSafe,
        catch_unwind,
    },
    sync::{
        Arc,
        atomic::Ordering,
    },
    time::Duration,
};
use vek::*;


// idle backoff tiers
const IDLE_NOT_READY: Duration = Duration::from_millis(100);
const IDLE_THROTTLED: Duration = Duration::from_millis(500);
const IDLE_NO_POI: Duration = Duration::from_millis(1000);
const IDLE_NO_WORK: Duration = Duration::from_millis(100);
// backoff after a fault in the loop body
const FAULT_BACKOFF: Duration = Duration::from_secs(1);


/// Body of the worker thread. Runs until shutdown clears the running flag;
/// faults in the loop body are logged and backed off, never fatal.
pub(super) fn worker_body(shared: Arc<Shared>) {
    debug!("generation worker running");
    while shared.running.load(Ordering::SeqCst) {
        let iteration = catch_unwind(AssertUnwindSafe(|| spin_once(&shared)));
        if iteration.is_err() {
            error!("generation worker iteration panicked, backing off");
            shared.idle_wait(FAULT_BACKOFF);
        }
    }
    debug!("generation worker stopped");
}

// one pass: idle checks, acquire a batch, pre-filter, claim under permits,
// dispatch to the host
fn spin_once(shared: &Arc<Shared>) {
    let config = shared.config.lock().clone();
    if !config.enabled {
        return shared.idle_wait(IDLE_NOT_READY);
    }
    let Some((ctx, center)) = shared.context_snapshot() else {
        return shared.idle_wait(IDLE_NOT_READY);
    };
    if shared.health.is_throttled() || (shared.pause_check)() {
        return shared.idle_wait(IDLE_THROTTLED);
    }
    let Some(center) = center else {
        return shared.idle_wait(IDLE_NO_POI);
    };

    let radius = effective_radius(&config, ctx.fast_active);
    let Some(batch) = ctx.coverage.find_work(center, radius, &shared.claimed_batches) else {
        return shared.idle_wait(IDLE_NO_WORK);
    };

    let key = batch_key(batch[0]);
    shared.batch_counters.lock().insert(key, batch.len() as u32);

    // cells already generated or already in flight resolve right here,
    // without spending a permit
    let mut ready = Vec::with_capacity(batch.len());
    for &cell in &batch {
        let already = shared.completed.lock().contains(&cell_key(cell))
            || shared.tracked.lock().contains(&cell_key(cell));
        if already {
            shared.resolve_success(&ctx, cell);
        } else {
            ready.push(cell);
        }
    }
    if ready.is_empty() {
        shared.release_batch(key);
        return;
    }

    // admission control: claim each cell under a permit
    let mut dispatchable = Vec::with_capacity(ready.len());
    for cell in ready {
        if !shared.acquire_permit() {
            // shutting down
            break;
        }
        // the epoch check runs under the tracked lock: the context switcher
        // bumps the epoch before it clears the set, so a claim that slips in
        // against a dying context is always swept by the clear
        let claimed = {
            let mut tracked = shared.tracked.lock();
            shared.is_current(ctx.epoch) && tracked.insert(cell_key(cell))
        };
        if claimed {
            shared.active_tasks.fetch_add(1, Ordering::SeqCst);
            shared.stats.add_queued();
            if ctx.fast_active {
                if let Some(fast_gen) = &shared.fast_gen {
                    if let Some(data) = fast_gen.sample(&ctx.world, cell) {
                        shared.pending_samples.lock().insert(cell_key(cell), data);
                    }
                }
            }
            dispatchable.push(cell);
        } else {
            // lost the claim to a racing pass
            shared.permits.release();
            shared.resolve_failure(&ctx, cell);
        }
    }

    if !dispatchable.is_empty() {
        dispatch(shared, &ctx, dispatchable);
    }
}

// hand the claimed cells to the host executor as one unit. must not block
// the worker: the closure runs whenever the host gets to it
fn dispatch(shared: &Arc<Shared>, ctx: &ContextTicket, cells: Vec<Vec2<i32>>) {
    let shared = Arc::clone(shared);
    let ctx = ctx.clone();
    let host = Arc::clone(&shared.host);
    host.submit(Box::new(move || run_dispatched(shared, ctx, cells)));
}

// on the host thread: resolve what's present, materialize the fast path, or
// kick off real generation
fn run_dispatched(shared: Arc<Shared>, ctx: ContextTicket, cells: Vec<Vec2<i32>>) {
    if !shared.is_current(ctx.epoch) {
        // context torn down while this dispatch was queued
        for &cell in &cells {
            shared.finish_cell(&ctx, cell);
        }
        return;
    }

    let mut to_generate = Vec::new();
    for cell in cells {
        if shared.host.is_generated(&ctx.world, cell) {
            // already in world data: success without generation cost
            shared.resolve_success(&ctx, cell);
            shared.finish_cell(&ctx, cell);
        } else if ctx.fast_active {
            materialize_fast(&shared, &ctx, cell);
            shared.finish_cell(&ctx, cell);
        } else {
            shared.host.reserve(&ctx.world, cell);
            to_generate.push(cell);
        }
    }

    if to_generate.is_empty() {
        return;
    }
    shared.host.flush_reservations(&ctx.world);
    for cell in to_generate {
        let shared = Arc::clone(&shared);
        let ctx = ctx.clone();
        let host = Arc::clone(&shared.host);
        let world = ctx.world.clone();
        host.generate(&world, cell, Box::new(move |outcome| {
            on_generated(shared, ctx, cell, outcome);
        }));
    }
}

fn materialize_fast(shared: &Shared, ctx: &ContextTicket, cell: Vec2<i32>) {
    let data = shared.pending_samples.lock().remove(&cell_key(cell));
    match (&shared.fast_gen, data) {
        (Some(fast_gen), Some(data)) => {
            match fast_gen.materialize(&ctx.world, cell, data) {
                Ok(()) => shared.resolve_success(ctx, cell),
                Err(e) => {
                    warn!("fast-path materialize failed for {:?}: {}", cell, e);
                    shared.resolve_failure(ctx, cell);
                }
            }
        }
        _ => shared.resolve_failure(ctx, cell),
    }
}

// a generation call finished, possibly on some pool thread
fn on_generated(shared: Arc<Shared>, ctx: ContextTicket, cell: Vec2<i32>, outcome: GenOutcome) {
    if !shared.is_current(ctx.epoch) {
        // the context this cell belonged to is gone
        shared.finish_cell(&ctx, cell);
        return;
    }

    match outcome {
        GenOutcome::Generated(produced) => {
            shared.resolve_success(&ctx, cell);
            if let Some(chunk) = produced {
                shared.ingest(chunk);
            }
        }
        GenOutcome::Failed => shared.resolve_failure(&ctx, cell),
    }

    // hop back onto the host thread to drop the reservation and release the
    // slot
    let host = Arc::clone(&shared.host);
    host.submit(Box::new(move || {
        if shared.is_current(ctx.epoch) {
            shared.host.unreserve(&ctx.world, cell);
            shared.host.housekeeping(&ctx.world);
        }
        shared.finish_cell(&ctx, cell);
    }));
}
