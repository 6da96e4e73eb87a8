//! Resizable counting semaphore for bounding in-flight work.

use std::time::{
    Duration,
    Instant,
};
use parking_lot::{
    Mutex,
    Condvar,
};


/// Counting semaphore whose capacity can be changed while waiters are
/// blocked, and whose acquires always time out rather than wait forever.
///
/// Shrinking the capacity below the number of permits currently held leaves
/// the pool transiently negative; it becomes acquirable again as held
/// permits are released.
#[derive(Debug)]
pub struct Permits {
    inner: Mutex<Inner>,
    available_changed: Condvar,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    available: isize,
}

impl Permits {
    /// Construct with all permits available.
    pub fn new(capacity: usize) -> Self {
        Permits {
            inner: Mutex::new(Inner {
                capacity,
                available: capacity as isize,
            }),
            available_changed: Condvar::new(),
        }
    }

    /// Take one permit, waiting up to `timeout` for one to free up. Returns
    /// whether a permit was acquired.
    pub fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock();
        while guard.available <= 0 {
            if self.available_changed.wait_until(&mut guard, deadline).timed_out() {
                return false;
            }
        }
        guard.available -= 1;
        true
    }

    /// Return one permit.
    pub fn release(&self) {
        let mut guard = self.inner.lock();
        guard.available += 1;
        if guard.available > 0 {
            self.available_changed.notify_one();
        }
    }

    /// Change the capacity in place, adjusting availability by the
    /// difference. Permits currently held stay held.
    pub fn set_capacity(&self, capacity: usize) {
        let mut guard = self.inner.lock();
        let delta = capacity as isize - guard.capacity as isize;
        guard.capacity = capacity;
        guard.available += delta;
        if delta > 0 {
            self.available_changed.notify_all();
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Permits currently acquirable. Negative after a shrink below the
    /// number held.
    pub fn available(&self) -> isize {
        self.inner.lock().available
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::Arc,
        thread,
    };

    const SHORT: Duration = Duration::from_millis(10);
    const LONG: Duration = Duration::from_secs(2);

    #[test]
    fn bounded() {
        let permits = Permits::new(2);
        assert!(permits.acquire(SHORT));
        assert!(permits.acquire(SHORT));
        assert!(!permits.acquire(SHORT));
        permits.release();
        assert!(permits.acquire(SHORT));
    }

    #[test]
    fn release_wakes_waiter() {
        let permits = Arc::new(Permits::new(1));
        assert!(permits.acquire(SHORT));
        let waiter = {
            let permits = Arc::clone(&permits);
            thread::spawn(move || permits.acquire(LONG))
        };
        thread::sleep(Duration::from_millis(50));
        permits.release();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn grow_wakes_waiter() {
        let permits = Arc::new(Permits::new(1));
        assert!(permits.acquire(SHORT));
        let waiter = {
            let permits = Arc::clone(&permits);
            thread::spawn(move || permits.acquire(LONG))
        };
        thread::sleep(Duration::from_millis(50));
        permits.set_capacity(2);
        assert!(waiter.join().unwrap());
        assert_eq!(permits.capacity(), 2);
        assert_eq!(permits.available(), 0);
    }

    #[test]
    fn shrink_goes_negative_until_released() {
        let permits = Permits::new(2);
        assert!(permits.acquire(SHORT));
        assert!(permits.acquire(SHORT));
        permits.set_capacity(1);
        assert_eq!(permits.available(), -1);
        permits.release();
        assert!(!permits.acquire(SHORT));
        permits.release();
        assert!(permits.acquire(SHORT));
    }
}
