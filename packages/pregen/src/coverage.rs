//! Hierarchical record of which cells have been generated.
//!
//! The map is a forest of root regions. A root node sits at level 3 and each
//! level subdivides 8x8, so a root spans 512x512 batches (2048x2048 cells);
//! level-1 nodes hold a 16-bit completion mask per 4x4 batch. A node records
//! in its `full_mask` which of its 64 children are entirely generated, and a
//! saturated child's entry is evicted, so a fully generated region costs
//! O(1) memory no matter how large. Roots are hash-keyed: memory is
//! proportional to touched work, never to world extent.
//!
//! Locking is sharded per root. Mutation near the active batch only ever
//! contends on the one root region containing it.

use crate::cell::*;
use std::{
    cmp::Reverse,
    collections::{
        BinaryHeap,
        HashMap,
        HashSet,
    },
    sync::Arc,
};
use parking_lot::{
    Mutex,
    RwLock,
};
use vek::*;


const ROOT_LEVEL: u32 = 3;
const CHILD_FANOUT: u8 = 64;
const FULL: u64 = u64::MAX;
const FULL_BATCH: u16 = u16::MAX;


/// Concurrently updatable record of generated cells, supporting
/// nearest-first retrieval of not-yet-generated batches and missing-cell
/// counts within a radius.
#[derive(Debug)]
pub struct CoverageMap {
    roots: RwLock<HashMap<u64, Arc<Mutex<Node>>>>,
}

#[derive(Debug)]
struct Node {
    level: u32,
    // level-space coords: a node at level L covers 8^L batches per axis
    coord: Vec2<i32>,
    // bit i set iff child i is entirely generated (and evicted)
    full_mask: u64,
    children: HashMap<u8, Child>,
}

#[derive(Debug)]
enum Child {
    // levels >= 2
    Node(Box<Node>),
    // level 1: per-batch cell completion mask
    Batch(u16),
}

// what a traversal found at some region
enum RegionView {
    // entirely generated
    Done,
    // node's full mask, or 0 for never-touched space
    Mask(u64),
}

impl Node {
    fn new(level: u32, coord: Vec2<i32>) -> Self {
        Node {
            level,
            coord,
            full_mask: 0,
            children: HashMap::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.full_mask == FULL
    }

    fn mark(&mut self, batch: Vec2<i32>, bit: u32) {
        let idx = local_index(self.level, batch);
        if self.full_mask >> idx & 1 == 1 {
            return;
        }

        if self.level == 1 {
            let mask = match self.children.get(&idx) {
                Some(&Child::Batch(mask)) => mask,
                _ => 0,
            };
            let mask = mask | (1u16 << bit);
            if mask == FULL_BATCH {
                self.full_mask |= 1u64 << idx;
                self.children.remove(&idx);
            } else {
                self.children.insert(idx, Child::Batch(mask));
            }
        } else {
            let level = self.level;
            let coord = self.coord;
            let entry = self.children.entry(idx).or_insert_with(|| {
                Child::Node(Box::new(Node::new(level - 1, child_coord(coord, idx))))
            });
            let became_full = match entry {
                Child::Node(child) => {
                    child.mark(batch, bit);
                    child.is_full()
                }
                Child::Batch(_) => unreachable!("batch mask above level 1"),
            };
            if became_full {
                self.full_mask |= 1u64 << idx;
                self.children.remove(&idx);
            }
        }
    }
}

impl CoverageMap {
    /// Construct with nothing marked generated.
    pub fn new() -> Self {
        CoverageMap {
            roots: RwLock::new(HashMap::new()),
        }
    }

    /// Record a cell as generated. Idempotent. Saturation propagates upward:
    /// the 16th cell of a batch collapses the batch into its parent's full
    /// mask, the 64th full child collapses the node into _its_ parent, and
    /// so on up to the root.
    pub fn mark_complete(&self, cell: Vec2<i32>) {
        let batch = batch_of(cell);
        let root = self.root_of_or_create(batch);
        root.lock().mark(batch, batch_bit(cell));
    }

    /// Find the nearest batch to `center` that intersects `radius`, is not
    /// fully generated, and is not already claimed, claim it, and return its
    /// 16 cells. Distance is measured to the nearest edge of a candidate
    /// region, never center-to-center, so large virgin regions get no head
    /// start over small ones.
    ///
    /// Claiming is a single atomic insert into `claimed`: concurrent callers
    /// can never be handed the same batch.
    pub fn find_work(
        &self,
        center: Vec2<i32>,
        radius: i32,
        claimed: &Mutex<HashSet<u64>>,
    ) -> Option<Vec<Vec2<i32>>> {
        let cb = batch_of(center);
        let rb = ((radius + BATCH_EXTENT - 1) >> BATCH_SHIFT) as i64;
        let rb_sq = rb * rb;

        // frontier of candidate regions, nearest lower bound first
        let mut frontier = BinaryHeap::new();
        self.seed_roots(cb, rb, &mut frontier);

        while let Some(Reverse((_, level, x, z))) = frontier.pop() {
            let coord = Vec2 { x, y: z };

            if level == 0 {
                if self.is_batch_complete(coord) {
                    continue;
                }
                if claimed.lock().insert(cell_key(coord)) {
                    return Some(batch_cells(coord));
                }
                continue;
            }

            let mask = match self.region_view(level, coord) {
                RegionView::Done => continue,
                RegionView::Mask(mask) => mask,
            };
            let child_level = level - 1;
            let child_size = 1i64 << (3 * child_level);
            for idx in 0..CHILD_FANOUT {
                if mask >> idx & 1 == 1 {
                    continue;
                }
                let child = child_coord(coord, idx);
                let dist_sq = region_dist_sq(child, child_size, cb);
                if dist_sq <= rb_sq {
                    frontier.push(Reverse((dist_sq, child_level, child.x, child.y)));
                }
            }
        }
        None
    }

    /// Count cells within `radius` of `center` that are not yet generated.
    ///
    /// Regions outside the radius and regions known fully generated
    /// contribute nothing without being descended. Never-touched space is
    /// estimated analytically per batch rather than materialized, which
    /// slightly overcounts at the radius boundary; treat the result as an
    /// estimate.
    pub fn count_missing_in_range(&self, center: Vec2<i32>, radius: i32) -> u64 {
        let cb = batch_of(center);
        let rb = ((radius + BATCH_EXTENT - 1) >> BATCH_SHIFT) as i64;
        let rb_sq = rb * rb;

        let mut count = 0;
        for_each_root_in_range(cb, rb, |root_coord| {
            let root = self.root_of_coord(root_coord);
            count += match root {
                Some(root) => {
                    let guard = root.lock();
                    count_missing(Some(&guard), ROOT_LEVEL, root_coord, cb, rb_sq)
                }
                None => count_missing(None, ROOT_LEVEL, root_coord, cb, rb_sq),
            };
        });
        count
    }

    // get the root region containing a batch coord, if one exists
    fn root_of(&self, batch: Vec2<i32>) -> Option<Arc<Mutex<Node>>> {
        self.root_of_coord(batch.map(|c| c >> ROOT_SHIFT))
    }

    fn root_of_or_create(&self, batch: Vec2<i32>) -> Arc<Mutex<Node>> {
        let root_coord = batch.map(|c| c >> ROOT_SHIFT);
        let key = cell_key(root_coord);
        {
            let roots = self.roots.read();
            if let Some(root) = roots.get(&key) {
                return Arc::clone(root);
            }
        }
        let mut roots = self.roots.write();
        Arc::clone(roots.entry(key).or_insert_with(|| {
            Arc::new(Mutex::new(Node::new(ROOT_LEVEL, root_coord)))
        }))
    }

    fn root_of_coord(&self, root_coord: Vec2<i32>) -> Option<Arc<Mutex<Node>>> {
        self.roots.read().get(&cell_key(root_coord)).map(Arc::clone)
    }

    // push every root region intersecting the search radius, whether or not
    // a node exists for it: virgin space is work too
    fn seed_roots(
        &self,
        cb: Vec2<i32>,
        rb: i64,
        frontier: &mut BinaryHeap<Reverse<(i64, u32, i32, i32)>>,
    ) {
        let root_size = 1i64 << (3 * ROOT_LEVEL);
        for_each_root_in_range(cb, rb, |root_coord| {
            let dist_sq = region_dist_sq(root_coord, root_size, cb);
            if dist_sq <= rb * rb {
                frontier.push(Reverse((dist_sq, ROOT_LEVEL, root_coord.x, root_coord.y)));
            }
        });
    }

    // descend to the node covering the given region. a full-mask bit on the
    // way down means the whole region is generated; a missing child means
    // virgin space
    fn region_view(&self, level: u32, coord: Vec2<i32>) -> RegionView {
        // any batch inside the region works for navigation
        let repr_batch = coord.map(|c| c << (3 * level));
        let root = match self.root_of(repr_batch) {
            Some(root) => root,
            None => return RegionView::Mask(0),
        };
        let guard = root.lock();
        let mut node: &Node = &guard;
        while node.level > level {
            let idx = local_index(node.level, repr_batch);
            if node.full_mask >> idx & 1 == 1 {
                return RegionView::Done;
            }
            node = match node.children.get(&idx) {
                Some(Child::Node(child)) => child,
                _ => return RegionView::Mask(0),
            };
        }
        if node.is_full() {
            RegionView::Done
        } else {
            RegionView::Mask(node.full_mask)
        }
    }

    fn is_batch_complete(&self, batch: Vec2<i32>) -> bool {
        let root = match self.root_of(batch) {
            Some(root) => root,
            None => return false,
        };
        let guard = root.lock();
        let mut node: &Node = &guard;
        while node.level > 1 {
            let idx = local_index(node.level, batch);
            if node.full_mask >> idx & 1 == 1 {
                return true;
            }
            node = match node.children.get(&idx) {
                Some(Child::Node(child)) => child,
                _ => return false,
            };
        }
        node.full_mask >> local_index(1, batch) & 1 == 1
    }
}

// index of the child containing a batch, within a node at the given level
fn local_index(level: u32, batch: Vec2<i32>) -> u8 {
    let shift = (level - 1) * 3;
    let lx = (batch.x >> shift) & 7;
    let lz = (batch.y >> shift) & 7;
    (lx + (lz << 3)) as u8
}

// level-space coord of a node's idx'th child
fn child_coord(coord: Vec2<i32>, idx: u8) -> Vec2<i32> {
    Vec2 {
        x: (coord.x << NODE_SHIFT) + (idx & 7) as i32,
        y: (coord.y << NODE_SHIFT) + (idx >> 3) as i32,
    }
}

// squared distance in batch space from `cb` to the nearest cell of the
// square region at `coord` spanning `size` batches per axis
fn region_dist_sq(coord: Vec2<i32>, size: i64, cb: Vec2<i32>) -> i64 {
    let dx = (coord.x as i64 * size - cb.x as i64)
        .max(cb.x as i64 - (coord.x as i64 + 1) * size + 1)
        .max(0);
    let dz = (coord.y as i64 * size - cb.y as i64)
        .max(cb.y as i64 - (coord.y as i64 + 1) * size + 1)
        .max(0);
    dx * dx + dz * dz
}

fn for_each_root_in_range(cb: Vec2<i32>, rb: i64, mut f: impl FnMut(Vec2<i32>)) {
    let rb = rb as i32;
    let min = cb.map(|c| (c - rb) >> ROOT_SHIFT);
    let max = cb.map(|c| (c + rb) >> ROOT_SHIFT);
    for rz in min.y..=max.y {
        for rx in min.x..=max.x {
            f(Vec2 { x: rx, y: rz });
        }
    }
}

fn count_missing(node: Option<&Node>, level: u32, coord: Vec2<i32>, cb: Vec2<i32>, rb_sq: i64) -> u64 {
    let size = 1i64 << (3 * level);
    if region_dist_sq(coord, size, cb) > rb_sq {
        return 0;
    }
    if node.map_or(false, Node::is_full) {
        return 0;
    }

    if level == 1 {
        let mut count = 0;
        for idx in 0..CHILD_FANOUT {
            if let Some(node) = node {
                if node.full_mask >> idx & 1 == 1 {
                    continue;
                }
            }
            let batch = child_coord(coord, idx);
            if region_dist_sq(batch, 1, cb) <= rb_sq {
                let mask = match node.and_then(|n| n.children.get(&idx)) {
                    Some(&Child::Batch(mask)) => mask,
                    _ => 0,
                };
                count += CELLS_PER_BATCH as u64 - mask.count_ones() as u64;
            }
        }
        return count;
    }

    let mut count = 0;
    for idx in 0..CHILD_FANOUT {
        if let Some(node) = node {
            if node.full_mask >> idx & 1 == 1 {
                continue;
            }
        }
        let child = node
            .and_then(|n| n.children.get(&idx))
            .and_then(|child| match child {
                Child::Node(child) => Some(&**child),
                Child::Batch(_) => None,
            });
        count += count_missing(child, level - 1, child_coord(coord, idx), cb, rb_sq);
    }
    count
}
