
#[macro_use]
extern crate tracing;

use pregen::{
    cell::cell_key,
    config::{
        Config,
        CONFIG_FILE_NAME,
    },
    host::*,
    logging::init_logging,
    progress_db::ProgressDb,
    scheduler::{
        Hooks,
        Scheduler,
    },
    stats::eta,
};
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    env::args,
    path::Path,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            AtomicI64,
            AtomicU64,
            Ordering,
        },
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};
use bracket_noise::prelude::FastNoise;
use crossbeam_channel::{
    Receiver,
    Sender,
    unbounded,
};
use parking_lot::Mutex;
use rand::{
    Rng,
    SeedableRng,
};
use rand_pcg::Pcg64;
use vek::*;


const CLI_INTRO: &'static str = "pregen demo: background terrain pre-generation \
against a synthetic host simulation.";

const CLI_HELP: &'static str = r#"
Examples:

    [this command]
    Run until ctrl-c with default options.

    [this command] --ticks=1200 --save=demo.redb
    Run a bounded number of 50 ms host ticks against an explicit save file.

Options:
    --save=PATH     progress database path (default pregen-progress.redb)
    --config=PATH   config file path (default pregen.json)
    --ticks=N       stop after N host ticks (default: run until ctrl-c)

Env var examples:
    RUST_LOG=pregen=trace
    Changes logging levels"#;

/// Desired duration of a host tick.
const TICK: Duration = Duration::from_millis(50);

// host ticks between simulated dimension hops
const TICKS_PER_WORLD: u64 = 3600;

// columns per cell edge in the synthetic terrain
const CELL_EXTENT: i32 = 16;


/// What a synthetic generation produces: a column height field for one cell.
struct HeightField {
    heights: [i16; (CELL_EXTENT * CELL_EXTENT) as usize],
}

struct GenTask {
    world: WorldId,
    cell: Vec2<i32>,
    done: DoneCallback,
}

/// Synthetic single-threaded host: a mailbox drained once per tick plays the
/// main thread, and a small pool plays the expensive asynchronous generator.
struct SimHost {
    send_job: Sender<HostJob>,
    recv_job: Receiver<HostJob>,
    send_task: Sender<GenTask>,
    recv_task: Receiver<GenTask>,
    worlds: Mutex<HashMap<WorldId, HashSet<u64>>>,
}

impl SimHost {
    fn spawn() -> Arc<Self> {
        let (send_job, recv_job) = unbounded();
        let (send_task, recv_task) = unbounded();

        let host = Arc::new(SimHost {
            send_job,
            recv_job,
            send_task,
            recv_task,
            worlds: Mutex::new(HashMap::new()),
        });

        for i in 0..num_cpus::get() {
            let host = Arc::clone(&host);
            thread::spawn(move || gen_pool_body(i as u64, host));
        }

        host
    }

    /// Run everything submitted to the main thread since the last tick.
    fn run_pending_jobs(&self) {
        while let Ok(job) = self.recv_job.try_recv() {
            job();
        }
    }
}

impl WorldHost for SimHost {
    fn submit(&self, job: HostJob) {
        if self.send_job.send(job).is_err() {
            error!("host job receiver disconnected");
        }
    }

    fn is_generated(&self, world: &WorldId, cell: Vec2<i32>) -> bool {
        self.worlds.lock()
            .get(world)
            .map(|cells| cells.contains(&cell_key(cell)))
            .unwrap_or(false)
    }

    fn generate(&self, world: &WorldId, cell: Vec2<i32>, done: DoneCallback) {
        let task = GenTask {
            world: world.clone(),
            cell,
            done,
        };
        if self.send_task.send(task).is_err() {
            error!("generation pool task sender disconnected");
        }
    }
}

// body of one generation pool thread: compute a height field with some
// simulated latency, then land the result on the main thread
fn gen_pool_body(seed: u64, host: Arc<SimHost>) {
    let mut rng = Pcg64::seed_from_u64(seed);
    let mut noise = FastNoise::new();
    noise.set_frequency(1.0 / 75.0);

    while let Ok(task) = host.recv_task.recv() {
        thread::sleep(Duration::from_millis(rng.gen_range(2..20)));

        // the occasional failed generation keeps the retry path honest
        if rng.gen_bool(0.01) {
            (task.done)(GenOutcome::Failed);
            continue;
        }

        let mut heights = [0i16; (CELL_EXTENT * CELL_EXTENT) as usize];
        for z in 0..CELL_EXTENT {
            for x in 0..CELL_EXTENT {
                let height = noise.get_noise(
                    (task.cell.x * CELL_EXTENT + x) as f32,
                    (task.cell.y * CELL_EXTENT + z) as f32,
                ) / 2.0 * 20.0 + 40.0;
                heights[(z * CELL_EXTENT + x) as usize] = height.floor() as i16;
            }
        }

        let GenTask { world, cell, done } = task;
        let host_for_job = Arc::clone(&host);
        let job: HostJob = Box::new(move || {
            // world data only changes on the main thread
            host_for_job.worlds.lock()
                .entry(world)
                .or_default()
                .insert(cell_key(cell));
            done(GenOutcome::Generated(Some(ProducedChunk(Box::new(HeightField {
                heights,
            })))));
        });
        if host.send_job.send(job).is_err() {
            break;
        }
    }
}

// stands in for a mesh/LOD pipeline consuming produced chunks
struct SurveySink {
    ingested: AtomicU64,
    peak_height: AtomicI64,
}

impl IngestSink for SurveySink {
    fn probe(&self) -> bool {
        true
    }

    fn ingest(&self, chunk: ProducedChunk) -> anyhow::Result<()> {
        let field = chunk.0.downcast::<HeightField>()
            .map_err(|_| anyhow::anyhow!("unexpected produced chunk payload"))?;
        self.ingested.fetch_add(1, Ordering::SeqCst);
        let peak = field.heights.iter().copied().max().unwrap_or(0) as i64;
        self.peak_height.fetch_max(peak, Ordering::SeqCst);
        Ok(())
    }
}

fn main() {
    let mut save_path = "pregen-progress.redb".to_owned();
    let mut config_path = CONFIG_FILE_NAME.to_owned();
    let mut max_ticks = None;

    println!("{}", CLI_INTRO);
    for arg in args().skip(1) {
        if arg == "--help" {
            println!("{}", CLI_HELP);
            return;
        } else if let Some(path) = arg.strip_prefix("--save=") {
            save_path = path.to_owned();
        } else if let Some(path) = arg.strip_prefix("--config=") {
            config_path = path.to_owned();
        } else if let Some(n) = arg.strip_prefix("--ticks=") {
            max_ticks = n.parse::<u64>().ok();
        } else {
            println!("unrecognized argument {:?}; try --help", arg);
            return;
        }
    }

    init_logging();

    if !Path::new(&config_path).exists() {
        if let Err(e) = Config::default().write(&config_path) {
            warn!("unable to write default config file: {}", e);
        }
    }

    let host = SimHost::spawn();
    let store = match ProgressDb::open(&save_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("unable to open progress database {:?}: {}", save_path, e);
            return;
        }
    };

    let sink = Arc::new(SurveySink {
        ingested: AtomicU64::new(0),
        peak_height: AtomicI64::new(i64::MIN),
    });

    let mut hooks = Hooks::new(
        Arc::clone(&host) as Arc<dyn WorldHost>,
        store as Arc<dyn ProgressStore>,
        Box::new(move || Config::read(&config_path)),
    );
    hooks.ingest_sink = Some(Arc::clone(&sink) as Arc<dyn IngestSink>);
    let mut scheduler = Scheduler::start(hooks);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .expect("unable to install ctrl-c handler");
    }

    let worlds = [WorldId::new("overworld"), WorldId::new("underworld")];
    let mut tick = 0u64;
    let mut next_tick = Instant::now();
    let mut pos = Vec2::new(0.0f64, 0.0);

    while !stop.load(Ordering::SeqCst) && max_ticks.map(|n| tick < n).unwrap_or(true) {
        // play the host main thread for this tick
        host.run_pending_jobs();

        // the point of interest wanders, and hops worlds now and then
        let world = worlds[(tick / TICKS_PER_WORLD) as usize % worlds.len()].clone();
        pos.x += 0.05;
        pos.y += 0.02;
        let poi = Poi {
            world,
            cell: pos.map(|c| c.floor() as i32),
        };
        scheduler.tick(Some(poi));

        if tick % 20 == 0 {
            let status = scheduler.status();
            info!(
                active = status.active_tasks,
                remaining = status.remaining_in_radius,
                completed = status.completed,
                skipped = status.skipped,
                failed = status.failed,
                rate = status.cells_per_second,
                throttled = status.throttled,
                eta = ?eta(status.remaining_in_radius, status.cells_per_second),
                ingested = sink.ingested.load(Ordering::SeqCst),
                "progress"
            );
        }

        // schedule the next tick, skipping any we fell behind on
        tick += 1;
        next_tick += TICK;
        let now = Instant::now();
        if next_tick < now {
            let behind_nanos = (now - next_tick).as_nanos();
            // poor man's div_ceil
            let behind_ticks = match behind_nanos % TICK.as_nanos() {
                0 => behind_nanos / TICK.as_nanos(),
                _ => behind_nanos / TICK.as_nanos() + 1,
            };
            let behind_ticks = u32::try_from(behind_ticks).expect("time broke");
            warn!("running too slow, skipping {behind_ticks} ticks");
            next_tick += TICK * behind_ticks;
        } else {
            thread::sleep(next_tick - now);
        }
    }

    info!("stopping");
    scheduler.shutdown();
    // let queued host-side cleanups settle
    host.run_pending_jobs();
    info!(
        ingested = sink.ingested.load(Ordering::SeqCst),
        peak_height = sink.peak_height.load(Ordering::SeqCst),
        "demo finished"
    );
}
