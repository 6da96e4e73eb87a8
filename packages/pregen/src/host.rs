//! Adapter interfaces the host environment implements for the scheduler.
//!
//! The scheduler never reaches into host internals: everything it needs from
//! the host simulation comes through these traits, injected at construction
//! by the composition root. Optional capabilities (`FastGen`, `IngestSink`)
//! are probed once at startup and degrade silently when absent.

use crate::config::Config;
use std::{
    any::Any,
    collections::HashSet,
    fmt,
    sync::Arc,
};
use anyhow::Result;
use vek::*;


/// Identifier of a world context within the host, e.g. a dimension name.
/// Cheap to clone and compare.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorldId(Arc<str>);

impl WorldId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        WorldId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


/// Opaque handle to a chunk of terrain produced by a generation call, passed
/// through to the ingestion sink without inspection.
pub struct ProducedChunk(pub Box<dyn Any + Send>);

/// Opaque data captured by a fast-path `sample` and consumed by its
/// `materialize`.
pub type SampleData = Box<dyn Any + Send>;

/// How one generation call ended. A successful generation may or may not
/// yield a chunk worth forwarding to the ingestion sink.
pub enum GenOutcome {
    Generated(Option<ProducedChunk>),
    Failed,
}

/// Completion callback for a generation call. May be invoked on any thread.
pub type DoneCallback = Box<dyn FnOnce(GenOutcome) + Send>;

/// A closure to run on the host's main thread.
pub type HostJob = Box<dyn FnOnce() + Send>;

/// Predicate polled while idle to let the host suspend background work.
pub type PauseCheck = Box<dyn Fn() -> bool + Send + Sync>;

/// Source of current configuration, consulted at startup and on scheduled
/// reloads.
pub type ConfigSource = Box<dyn Fn() -> Config + Send + Sync>;


/// The host simulation's world access, as seen by the scheduler.
///
/// `submit` may be called from any thread and must not block; every other
/// method is only ever called from the host's main thread (from inside a
/// submitted job), except that the `generate` completion callback may be
/// delivered wherever the host pleases.
pub trait WorldHost: Send + Sync + 'static {
    /// Run a job at the next safe point on the host's main thread.
    /// Fire-and-forget from the caller's perspective.
    fn submit(&self, job: HostJob);

    /// Whether the cell already exists in the host's world data.
    fn is_generated(&self, world: &WorldId, cell: Vec2<i32>) -> bool;

    /// Start generating a cell. The callback must eventually be invoked
    /// exactly once.
    fn generate(&self, world: &WorldId, cell: Vec2<i32>, done: DoneCallback);

    /// Pin a cell so the host keeps it available while it generates.
    fn reserve(&self, world: &WorldId, cell: Vec2<i32>) {
        let _ = (world, cell);
    }

    /// Drop a pin taken with `reserve`.
    fn unreserve(&self, world: &WorldId, cell: Vec2<i32>) {
        let _ = (world, cell);
    }

    /// Apply pending reservation changes. Called once per dispatched unit,
    /// after its `reserve` calls.
    fn flush_reservations(&self, world: &WorldId) {
        let _ = world;
    }

    /// Nudge whatever host bookkeeping wants to run after a generation
    /// finishes.
    fn housekeeping(&self, world: &WorldId) {
        let _ = world;
    }
}

/// Optional accelerated generation path.
pub trait FastGen: Send + Sync + 'static {
    /// Whether the capability is usable at all. Called once at startup.
    fn probe(&self) -> bool;

    /// Whether the fast path applies to this world. Called once per context
    /// switch.
    fn is_active(&self, world: &WorldId) -> bool;

    /// Capture whatever data `materialize` will need for this cell. Called
    /// off the host thread.
    fn sample(&self, world: &WorldId, cell: Vec2<i32>) -> Option<SampleData>;

    /// Turn sampled data into real terrain. Called on the host thread.
    fn materialize(&self, world: &WorldId, cell: Vec2<i32>, data: SampleData) -> Result<()>;
}

/// Optional sink for produced chunks. Best-effort: ingest failures are
/// logged and never affect cell resolution.
pub trait IngestSink: Send + Sync + 'static {
    /// Whether the capability is usable at all. Called once at startup.
    fn probe(&self) -> bool;

    fn ingest(&self, chunk: ProducedChunk) -> Result<()>;
}

/// Durable storage for each world's completed-cell set. Consulted on context
/// setup and teardown only, never on the hot path.
pub trait ProgressStore: Send + Sync + 'static {
    fn load(&self, world: &WorldId) -> Result<HashSet<u64>>;

    fn save(&self, world: &WorldId, cells: &HashSet<u64>) -> Result<()>;
}


/// Point of interest generation is centered on, as reported by the host once
/// per tick.
#[derive(Debug, Clone)]
pub struct Poi {
    pub world: WorldId,
    pub cell: Vec2<i32>,
}
