//! Cell and batch coordinate math.
//!
//! A cell is an (x, z) coordinate in an unbounded 2D grid of terrain columns,
//! carried as a `Vec2<i32>` (the vector's y component holds the z axis).
//! Cells group into 4x4 batches, the smallest unit the coverage hierarchy
//! tracks and the smallest unit the scheduler dequeues.

use vek::*;


/// Cells per batch edge is `1 << BATCH_SHIFT`.
pub const BATCH_SHIFT: i32 = 2;
/// Cells per batch edge.
pub const BATCH_EXTENT: i32 = 1 << BATCH_SHIFT;
/// Cells per batch.
pub const CELLS_PER_BATCH: usize = (BATCH_EXTENT * BATCH_EXTENT) as usize;
/// Children per coverage node edge is `1 << NODE_SHIFT`.
pub const NODE_SHIFT: i32 = 3;
/// Batches per root region edge is `1 << ROOT_SHIFT` (three 8x8 levels).
pub const ROOT_SHIFT: i32 = 9;


/// Pack a coordinate pair into a single key, x in the low word, z in the
/// high word.
pub fn cell_key(cell: Vec2<i32>) -> u64 {
    (cell.x as u32 as u64) | ((cell.y as u32 as u64) << 32)
}

/// Inverse of `cell_key`.
pub fn key_to_cell(key: u64) -> Vec2<i32> {
    Vec2 {
        x: key as u32 as i32,
        y: (key >> 32) as u32 as i32,
    }
}

/// Coordinate of the batch containing a cell. Arithmetic shift, so this
/// floors correctly for negative coordinates.
pub fn batch_of(cell: Vec2<i32>) -> Vec2<i32> {
    cell.map(|c| c >> BATCH_SHIFT)
}

/// Key of the batch containing a cell.
pub fn batch_key(cell: Vec2<i32>) -> u64 {
    cell_key(batch_of(cell))
}

/// Index of a cell within its batch's 16-bit completion mask.
pub fn batch_bit(cell: Vec2<i32>) -> u32 {
    ((cell.x & 3) + ((cell.y & 3) << 2)) as u32
}

/// The 16 cells of a batch, row-major (z outer, x inner).
pub fn batch_cells(batch: Vec2<i32>) -> Vec<Vec2<i32>> {
    let mut cells = Vec::with_capacity(CELLS_PER_BATCH);
    for lz in 0..BATCH_EXTENT {
        for lx in 0..BATCH_EXTENT {
            cells.push(Vec2 {
                x: (batch.x << BATCH_SHIFT) + lx,
                y: (batch.y << BATCH_SHIFT) + lz,
            });
        }
    }
    cells
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip() {
        for cell in [
            Vec2::new(0, 0),
            Vec2::new(1, -1),
            Vec2::new(-1, 1),
            Vec2::new(123456, -654321),
            Vec2::new(i32::MIN, i32::MAX),
        ] {
            assert_eq!(key_to_cell(cell_key(cell)), cell);
        }
    }

    #[test]
    fn distinct_cells_distinct_keys() {
        assert_ne!(cell_key(Vec2::new(1, 0)), cell_key(Vec2::new(0, 1)));
        assert_ne!(cell_key(Vec2::new(-1, 0)), cell_key(Vec2::new(0, -1)));
    }

    #[test]
    fn batch_floor_division() {
        assert_eq!(batch_of(Vec2::new(3, 3)), Vec2::new(0, 0));
        assert_eq!(batch_of(Vec2::new(4, 7)), Vec2::new(1, 1));
        assert_eq!(batch_of(Vec2::new(-1, -4)), Vec2::new(-1, -1));
        assert_eq!(batch_of(Vec2::new(-5, -8)), Vec2::new(-2, -2));
    }

    #[test]
    fn batch_bits_cover_all_sixteen() {
        let mut seen = 0u16;
        for cell in batch_cells(Vec2::new(-3, 7)) {
            seen |= 1 << batch_bit(cell);
        }
        assert_eq!(seen, u16::MAX);
    }

    #[test]
    fn batch_cells_share_batch_key() {
        let batch = Vec2::new(-2, 5);
        for cell in batch_cells(batch) {
            assert_eq!(batch_of(cell), batch);
            assert_eq!(batch_key(cell), cell_key(batch));
        }
    }
}
