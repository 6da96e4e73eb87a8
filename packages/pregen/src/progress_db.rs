//! Durable record of completed cells, one saved set per world.
//!
//! A single-table redb database: key is the world id string, value is the
//! bincode-encoded sorted list of completed cell keys. Reads and writes are
//! blocking, which is fine because the scheduler only touches persistence on
//! context setup and teardown.

use crate::host::{
    ProgressStore,
    WorldId,
};
use std::{
    collections::HashSet,
    path::Path,
};
use anyhow::Result;
use redb::{
    Database,
    ReadableTable,
    TableDefinition,
    TableError,
};


const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("completed");


/// `ProgressStore` backed by a redb database file.
#[derive(Debug)]
pub struct ProgressDb {
    db: Database,
}

impl ProgressDb {
    /// Open existing database, or create one if the path is empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pre_existent = path.try_exists()?;
        trace!(?pre_existent, "opening progress database");
        Ok(ProgressDb {
            db: Database::create(path)?,
        })
    }
}

impl ProgressStore for ProgressDb {
    fn load(&self, world: &WorldId) -> Result<HashSet<u64>> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(TABLE) {
            Ok(table) => table,
            // nothing was ever saved
            Err(TableError::TableDoesNotExist(_)) => return Ok(HashSet::new()),
            Err(e) => return Err(e.into()),
        };
        let value = match table.get(world.as_str())? {
            Some(value) => value,
            None => return Ok(HashSet::new()),
        };
        let cells: Vec<u64> = bincode::deserialize(value.value())?;
        Ok(cells.into_iter().collect())
    }

    fn save(&self, world: &WorldId, cells: &HashSet<u64>) -> Result<()> {
        let mut sorted = cells.iter().copied().collect::<Vec<u64>>();
        sorted.sort_unstable();
        let buf = bincode::serialize(&sorted)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TABLE)?;
            table.insert(world.as_str(), buf.as_slice())?;
        }
        txn.commit()?;
        debug!(world = %world, cells = sorted.len(), "saved generation progress");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        env,
        fs,
        process,
        sync::atomic::{AtomicU64, Ordering},
    };

    // unique throwaway db path per test
    fn scratch_path(tag: &str) -> std::path::PathBuf {
        static CTR: AtomicU64 = AtomicU64::new(0);
        let n = CTR.fetch_add(1, Ordering::SeqCst);
        env::temp_dir().join(format!("pregen-test-{}-{}-{}.redb", tag, process::id(), n))
    }

    #[test]
    fn round_trip() {
        let path = scratch_path("round-trip");
        let world = WorldId::new("overworld");
        {
            let db = ProgressDb::open(&path).unwrap();
            let cells = [1u64, 99, 1 << 40].into_iter().collect::<HashSet<u64>>();
            db.save(&world, &cells).unwrap();
            assert_eq!(db.load(&world).unwrap(), cells);
        }
        // survives reopen
        let db = ProgressDb::open(&path).unwrap();
        assert_eq!(db.load(&world).unwrap().len(), 3);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_world_loads_empty() {
        let path = scratch_path("missing-world");
        let db = ProgressDb::open(&path).unwrap();
        assert!(db.load(&WorldId::new("nowhere")).unwrap().is_empty());

        // and a saved world doesn't bleed into others
        db.save(&WorldId::new("a"), &[7u64].into_iter().collect()).unwrap();
        assert!(db.load(&WorldId::new("b")).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn save_overwrites() {
        let path = scratch_path("overwrite");
        let db = ProgressDb::open(&path).unwrap();
        let world = WorldId::new("overworld");
        db.save(&world, &[1u64, 2].into_iter().collect()).unwrap();
        db.save(&world, &[3u64].into_iter().collect()).unwrap();
        assert_eq!(db.load(&world).unwrap(), [3u64].into_iter().collect());
        let _ = fs::remove_file(&path);
    }
}
