
use std::{
    path::Path,
    fs::File,
    io::{
        BufReader,
        BufWriter,
    },
};
use serde::{Serialize, Deserialize};
use anyhow::*;


pub const CONFIG_FILE_NAME: &'static str = "pregen.json";


/// Scheduler configuration. Re-read from disk when a reload is scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Master switch. When false the worker idles without claiming work.
    pub enabled: bool,
    /// Radius around the point of interest to generate, in cells.
    pub generation_radius: i32,
    /// Cap on concurrently outstanding generation requests.
    pub max_active_tasks: usize,
    /// Advisory queue bound for hosts that meter their own request queues.
    /// Not consulted on the hot path.
    pub max_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: true,
            generation_radius: 128,
            max_active_tasks: 20,
            max_queue_size: 20000,
        }
    }
}

impl Config {
    pub fn read(path: impl AsRef<Path>) -> Self {
        Self::try_read(path).unwrap_or_default()
    }

    pub fn try_read(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }
}
