//! Generation progress counters and throughput tracking.

use std::{
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
    time::{
        Duration,
        Instant,
    },
};
use parking_lot::Mutex;


/// Length of the per-second throughput window.
pub const RATE_WINDOW: usize = 10;

// rates below this are reported as no progress at all
const RATE_EPSILON: f64 = 1e-3;


/// Process-duration counters plus a rolling per-second completion window.
/// Counter updates are lock-free; the window rolls at most once per second
/// from the host tick.
#[derive(Debug)]
pub struct GenStats {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    window: Mutex<RateWindow>,
}

#[derive(Debug)]
struct RateWindow {
    history: [u64; RATE_WINDOW],
    index: usize,
    last_total: u64,
    last_roll: Option<Instant>,
}

impl GenStats {
    pub fn new() -> Self {
        GenStats {
            queued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            window: Mutex::new(RateWindow {
                history: [0; RATE_WINDOW],
                index: 0,
                last_total: 0,
                last_roll: None,
            }),
        }
    }

    pub fn add_queued(&self) { self.queued.fetch_add(1, Ordering::SeqCst); }
    pub fn add_completed(&self) { self.completed.fetch_add(1, Ordering::SeqCst); }
    pub fn add_failed(&self) { self.failed.fetch_add(1, Ordering::SeqCst); }
    pub fn add_skipped(&self) { self.skipped.fetch_add(1, Ordering::SeqCst); }

    pub fn queued(&self) -> u64 { self.queued.load(Ordering::SeqCst) }
    pub fn completed(&self) -> u64 { self.completed.load(Ordering::SeqCst) }
    pub fn failed(&self) -> u64 { self.failed.load(Ordering::SeqCst) }
    pub fn skipped(&self) -> u64 { self.skipped.load(Ordering::SeqCst) }

    /// Call once per host tick. Rolls the rate window when at least a second
    /// has passed since the last roll.
    pub fn tick(&self) {
        self.roll(Instant::now());
    }

    /// Smoothed completion rate over the window, in cells per second.
    pub fn cells_per_second(&self) -> f64 {
        let window = self.window.lock();
        window.history.iter().sum::<u64>() as f64 / RATE_WINDOW as f64
    }

    pub fn reset(&self) {
        self.queued.store(0, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.skipped.store(0, Ordering::SeqCst);
        let mut window = self.window.lock();
        window.history = [0; RATE_WINDOW];
        window.index = 0;
        window.last_total = 0;
        window.last_roll = None;
    }

    fn roll(&self, now: Instant) {
        let mut window = self.window.lock();
        let due = window.last_roll
            .map(|last| now.saturating_duration_since(last) >= Duration::from_secs(1))
            .unwrap_or(true);
        if !due {
            return;
        }

        let total = self.completed() + self.skipped();
        let delta = total.saturating_sub(window.last_total);
        let index = window.index;
        window.history[index] = delta;
        window.index = (index + 1) % RATE_WINDOW;
        window.last_total = total;
        window.last_roll = Some(now);
    }
}


/// Estimated time to finish the remaining work at the current rate.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Eta {
    /// Nothing remaining.
    Done,
    /// No measurable progress to extrapolate from.
    Unknown,
    /// Approximate remaining duration.
    About(Duration),
}

pub fn eta(remaining: u64, cells_per_second: f64) -> Eta {
    if remaining == 0 {
        Eta::Done
    } else if cells_per_second > RATE_EPSILON {
        Eta::About(Duration::from_secs_f64(remaining as f64 / cells_per_second))
    } else {
        Eta::Unknown
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_quiet_smooths_to_tenth() {
        let stats = GenStats::new();
        let mut now = Instant::now();

        for _ in 0..5 {
            stats.add_completed();
        }
        // first roll captures the burst, nine more capture silence
        for _ in 0..RATE_WINDOW {
            stats.roll(now);
            now += Duration::from_secs(1);
        }
        assert!((stats.cells_per_second() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn sub_second_ticks_do_not_roll() {
        let stats = GenStats::new();
        let now = Instant::now();
        stats.roll(now);
        stats.add_completed();
        // same second: the window must not advance
        stats.roll(now + Duration::from_millis(500));
        assert_eq!(stats.cells_per_second(), 0.0);
        stats.roll(now + Duration::from_secs(1));
        assert!((stats.cells_per_second() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn skips_count_toward_rate() {
        let stats = GenStats::new();
        let mut now = Instant::now();
        stats.roll(now);
        now += Duration::from_secs(1);
        for _ in 0..3 {
            stats.add_completed();
        }
        for _ in 0..7 {
            stats.add_skipped();
        }
        stats.roll(now);
        assert!((stats.cells_per_second() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reset_zeroes_everything() {
        let stats = GenStats::new();
        stats.add_queued();
        stats.add_completed();
        stats.add_failed();
        stats.add_skipped();
        stats.roll(Instant::now());
        stats.reset();
        assert_eq!(stats.queued(), 0);
        assert_eq!(stats.completed(), 0);
        assert_eq!(stats.failed(), 0);
        assert_eq!(stats.skipped(), 0);
        assert_eq!(stats.cells_per_second(), 0.0);
    }

    #[test]
    fn eta_edges() {
        assert_eq!(eta(0, 5.0), Eta::Done);
        assert_eq!(eta(100, 0.0), Eta::Unknown);
        match eta(100, 10.0) {
            Eta::About(d) => assert_eq!(d, Duration::from_secs(10)),
            other => panic!("unexpected eta: {:?}", other),
        }
    }
}
