//! Host tick health monitoring.

use std::{
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
    time::{
        Duration,
        Instant,
    },
};
use parking_lot::Mutex;


/// Number of recent tick durations kept.
pub const SAMPLE_WINDOW: usize = 20;

// throttle when the host drops below 18 ticks per second (mean tick above
// ~55.5 ms)
const THROTTLE_THRESHOLD: Duration = Duration::from_nanos(1_000_000_000 / 18);


/// Rolling view of how the host's tick loop is keeping up. The worker reads
/// the derived throttle flag without taking a lock.
#[derive(Debug)]
pub struct TickHealth {
    inner: Mutex<Inner>,
    throttled: AtomicBool,
}

#[derive(Debug)]
struct Inner {
    samples: [Duration; SAMPLE_WINDOW],
    index: usize,
    last_tick: Option<Instant>,
}

impl TickHealth {
    /// Construct with no history and the throttle flag clear.
    pub fn new() -> Self {
        TickHealth {
            inner: Mutex::new(Inner {
                samples: [Duration::ZERO; SAMPLE_WINDOW],
                index: 0,
                last_tick: None,
            }),
            throttled: AtomicBool::new(false),
        }
    }

    /// Record the start of a host tick. Call once per tick from the host
    /// thread.
    pub fn tick(&self) {
        self.sample(Instant::now());
    }

    /// Whether the mean recent tick duration exceeds the acceptable
    /// threshold. Safe to call from any thread.
    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::SeqCst)
    }

    /// Forget all history and clear the throttle flag.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.samples = [Duration::ZERO; SAMPLE_WINDOW];
        inner.index = 0;
        inner.last_tick = None;
        self.throttled.store(false, Ordering::SeqCst);
    }

    fn sample(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if let Some(last) = inner.last_tick {
            let delta = now.saturating_duration_since(last);
            let index = inner.index;
            inner.samples[index] = delta;
            inner.index = (index + 1) % SAMPLE_WINDOW;
        }
        inner.last_tick = Some(now);

        // unweighted mean of the samples recorded so far
        let mut total = Duration::ZERO;
        let mut count = 0u32;
        for &sample in &inner.samples {
            if sample > Duration::ZERO {
                total += sample;
                count += 1;
            }
        }
        let throttled = count > 0 && total / count > THROTTLE_THRESHOLD;
        self.throttled.store(throttled, Ordering::SeqCst);
    }
}
