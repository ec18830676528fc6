use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use libc::c_void;
use lock_api::RawRwLock as RawRwLockTrait;
use parking_lot::RawRwLock;

/// Called with the new `current` after every ledger update.
pub type Callback = unsafe extern "C" fn(cookie: *mut c_void, current: usize);

/// A point-in-time copy of the ledger.
#[derive(Clone, Default, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Stats {
    /// Bytes requested and not yet released
    pub current: usize,
    /// Highest `current` seen since start or the last peak reset
    pub peak: usize,
    /// Bytes ever requested
    pub total: usize,
    /// Number of accounted allocations
    pub count: usize,
}

impl Stats {
    pub const fn new() -> Self {
        Self {
            current: 0,
            peak: 0,
            total: 0,
            count: 0,
        }
    }

    /// Activity since `origin` was taken. `current` and `peak` are kept as
    /// they are, they are levels rather than running sums.
    pub fn relative_to(&self, origin: &Self) -> Self {
        Self {
            current: self.current,
            peak: self.peak,
            total: self.total - origin.total,
            count: self.count - origin.count,
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "current {}, peak {}, total {}, allocations {}",
            self.current, self.peak, self.total, self.count
        )
    }
}

/// A counter updated with atomic read-modify-write operations, or with a
/// separate load and store when the `thread-safe` feature is off.
struct Counter(AtomicUsize);

impl Counter {
    const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline]
    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    fn set(&self, value: usize) {
        self.0.store(value, Ordering::Relaxed)
    }

    /// Returns the new value.
    #[inline]
    fn add(&self, n: usize) -> usize {
        if cfg!(feature = "thread-safe") {
            self.0.fetch_add(n, Ordering::Relaxed).wrapping_add(n)
        } else {
            let value = self.get().wrapping_add(n);
            self.set(value);
            value
        }
    }

    /// Subtract, stopping at zero. Returns `(new, underflowed)`.
    #[inline]
    fn sub_saturating(&self, n: usize) -> (usize, bool) {
        let prev = if cfg!(feature = "thread-safe") {
            match self
                .0
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                    Some(c.saturating_sub(n))
                }) {
                Ok(prev) | Err(prev) => prev,
            }
        } else {
            let prev = self.get();
            self.set(prev.saturating_sub(n));
            prev
        };
        (prev.saturating_sub(n), prev < n)
    }
}

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// The single callback slot.
///
/// Readers only ever `try_lock_shared`: a notification that races with
/// `set` is dropped rather than waiting, so the allocation path never parks.
struct Observer {
    lock: RawRwLock,
    slot: UnsafeCell<Option<(Callback, *mut c_void)>>,
}

impl Observer {
    const fn new() -> Self {
        Self {
            lock: RawRwLock::INIT,
            slot: UnsafeCell::new(None),
        }
    }

    fn set(&self, slot: Option<(Callback, *mut c_void)>) {
        self.lock.lock_exclusive();
        // SAFETY: exclusive lock held.
        unsafe {
            *self.slot.get() = slot;
            self.lock.unlock_exclusive();
        }
    }

    #[inline]
    fn notify(&self, current: usize) {
        if !self.lock.try_lock_shared() {
            return;
        }
        // SAFETY: shared lock held, writers are excluded.
        let slot = unsafe {
            let slot = *self.slot.get();
            self.lock.unlock_shared();
            slot
        };
        let Some((callback, cookie)) = slot else {
            return;
        };
        // Allocations made by the callback are accounted but not reported
        // back to it.
        let _ = IN_CALLBACK.try_with(|busy| {
            if busy.replace(true) {
                return;
            }
            // SAFETY: whoever registered the callback vouched for it and its
            // cookie.
            unsafe { callback(cookie, current) };
            busy.set(false);
        });
    }
}

/// Process-wide allocation counters plus the optional observer.
pub struct Ledger {
    current: Counter,
    peak: Counter,
    total: Counter,
    count: Counter,
    observer: Observer,
}

// SAFETY: the counters are atomics; the observer slot is guarded by its lock.
// The cookie pointer is opaque to us and only handed back to its callback.
unsafe impl Sync for Ledger {}

impl Ledger {
    pub const fn new() -> Self {
        Self {
            current: Counter::new(),
            peak: Counter::new(),
            total: Counter::new(),
            count: Counter::new(),
            observer: Observer::new(),
        }
    }

    /// Record an allocation of `size` bytes.
    pub fn account_alloc(&self, size: usize) {
        let current = self.current.add(size);
        // Plain compare-then-store: `peak` may lag slightly under contention.
        if current > self.peak.get() {
            self.peak.set(current);
        }
        self.total.add(size);
        self.count.add(1);
        self.observer.notify(current);
    }

    /// Record the release of `size` bytes.
    pub fn account_free(&self, size: usize) {
        let (current, underflow) = self.current.sub_saturating(size);
        if underflow {
            crate::diag!("free of {} bytes exceeds current usage, double free?", size);
        }
        self.observer.notify(current);
    }

    pub fn reset_peak(&self) {
        self.peak.set(self.current.get());
    }

    pub fn set_callback(&self, callback: Option<Callback>, cookie: *mut c_void) {
        self.observer.set(callback.map(|cb| (cb, cookie)));
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.current.get()
    }

    #[inline]
    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total.get()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.get()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            current: self.current(),
            peak: self.peak(),
            total: self.total(),
            count: self.count(),
        }
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_from_two_allocations() {
        let ledger = Ledger::new();
        ledger.account_alloc(100);
        assert_eq!(ledger.stats(), Stats { current: 100, peak: 100, total: 100, count: 1 });
        ledger.account_alloc(50);
        assert_eq!(ledger.stats(), Stats { current: 150, peak: 150, total: 150, count: 2 });
        ledger.account_free(100);
        assert_eq!(ledger.stats(), Stats { current: 50, peak: 150, total: 150, count: 2 });
        ledger.account_free(50);
        assert_eq!(ledger.current(), 0);
    }

    #[test]
    fn reset_peak_drops_to_current() {
        let ledger = Ledger::new();
        ledger.account_alloc(1000);
        ledger.account_free(900);
        assert_eq!(ledger.peak(), 1000);
        ledger.reset_peak();
        assert_eq!(ledger.peak(), ledger.current());
        assert_eq!(ledger.peak(), 100);
    }

    #[test]
    fn current_never_goes_negative() {
        let ledger = Ledger::new();
        ledger.account_alloc(10);
        ledger.account_free(20);
        assert_eq!(ledger.current(), 0);
        assert_eq!(ledger.total(), 10);
    }

    unsafe extern "C" fn record(cookie: *mut c_void, current: usize) {
        let seen = &*(cookie as *const AtomicUsize);
        seen.store(current, Ordering::SeqCst);
    }

    #[test]
    fn callback_sees_every_update() {
        let ledger = Ledger::new();
        let seen = AtomicUsize::new(usize::MAX);
        ledger.set_callback(Some(record), &seen as *const AtomicUsize as *mut c_void);

        ledger.account_alloc(64);
        assert_eq!(seen.load(Ordering::SeqCst), 64);
        ledger.account_alloc(36);
        assert_eq!(seen.load(Ordering::SeqCst), 100);
        ledger.account_free(64);
        assert_eq!(seen.load(Ordering::SeqCst), 36);

        ledger.set_callback(None, core::ptr::null_mut());
        ledger.account_free(36);
        assert_eq!(seen.load(Ordering::SeqCst), 36);
    }

    #[test]
    fn relative_stats_measure_a_region() {
        let ledger = Ledger::new();
        ledger.account_alloc(10);
        let origin = ledger.stats();
        ledger.account_alloc(5);
        ledger.account_alloc(7);
        let delta = ledger.stats().relative_to(&origin);
        assert_eq!(delta.total, 12);
        assert_eq!(delta.count, 2);
        assert_eq!(delta.current, 22);
        assert_eq!(
            ledger.stats().to_string(),
            "current 22, peak 22, total 22, allocations 3"
        );
    }

    #[cfg(feature = "thread-safe")]
    #[test]
    fn concurrent_updates_balance_out() {
        static LEDGER: Ledger = Ledger::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    for i in 1..=1000 {
                        LEDGER.account_alloc(i);
                        LEDGER.account_free(i);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(LEDGER.current(), 0);
        assert_eq!(LEDGER.count(), 8000);
        assert_eq!(LEDGER.total(), 8 * 500 * 1001);
        assert!(LEDGER.peak() >= 1000);
    }
}
