//! The allocation entry points.
//!
//! Every accounted block comes from the real allocator with a header in
//! front; blocks handed out before resolution come from the bootstrap arena
//! and are never accounted.

use crate::arena::{BootstrapArena, BOOTSTRAP_ARENA_SIZE};
use crate::config::{Config, SentinelPolicy};
use crate::header::{self, Decoded, HEADER_SIZE};
use crate::monitor::{Callback, Ledger, Stats};
use crate::resolver::{ResolveError, Resolver, SymbolSource};
use crate::{diag, diag::fatal};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering};
use libc::{c_int, c_void};

/// Allocation counter with its own resolver, bootstrap arena and ledger.
///
/// There is normally exactly one of these per process, [`MALLOC_COUNT`],
/// and everything that allocates goes through it. It is usable from the
/// moment it exists: until [`initialize`](Self::initialize) has run,
/// requests are served from a static arena of `N` bytes.
///
/// [`MALLOC_COUNT`]: crate::MALLOC_COUNT
pub struct MallocCount<const N: usize = BOOTSTRAP_ARENA_SIZE> {
    config: Config,
    resolver: Resolver,
    arena: BootstrapArena<N>,
    ledger: Ledger,
    finished: AtomicBool,
}

impl<const N: usize> MallocCount<N> {
    pub const fn new() -> Self {
        Self::with_config(Config::new())
    }

    pub const fn with_config(config: Config) -> Self {
        Self {
            config,
            resolver: Resolver::new(),
            arena: BootstrapArena::new(),
            ledger: Ledger::new(),
            finished: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn arena(&self) -> &BootstrapArena<N> {
        &self.arena
    }

    pub fn is_ready(&self) -> bool {
        self.resolver.is_ready()
    }

    /// Find the real allocator. Until this succeeds, allocations are served
    /// from the bootstrap arena.
    pub fn try_initialize<S: SymbolSource + ?Sized>(&self, source: &S) -> Result<(), ResolveError> {
        self.resolver.resolve(source)?;
        log::debug!(
            "real allocator resolved, {} of {} bootstrap bytes in use",
            self.arena.used(),
            self.arena.capacity()
        );
        Ok(())
    }

    /// Like [`try_initialize`](Self::try_initialize), but a failure
    /// terminates the process: without the real allocator nothing can be
    /// freed safely.
    pub fn initialize<S: SymbolSource + ?Sized>(&self, source: &S) {
        if let Err(e) = self.try_initialize(source) {
            fatal(format_args!("error {}", e));
        }
    }

    /// Print the exit summary. Only the first call prints.
    pub fn shutdown(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let stats = self.stats();
        diag!(
            "exiting, total: {}, peak: {}, current: {}",
            stats.total,
            stats.peak,
            stats.current
        );
        log::debug!("allocation summary: {}", stats);
    }

    pub fn current(&self) -> usize {
        self.ledger.current()
    }

    pub fn peak(&self) -> usize {
        self.ledger.peak()
    }

    pub fn reset_peak(&self) {
        self.ledger.reset_peak()
    }

    pub fn num_allocations(&self) -> usize {
        self.ledger.count()
    }

    pub fn total(&self) -> usize {
        self.ledger.total()
    }

    pub fn stats(&self) -> Stats {
        self.ledger.stats()
    }

    pub fn print_status(&self) {
        diag!("current {}, peak {}", self.current(), self.peak());
    }

    /// Register (or with `None`, remove) the observer called after every
    /// change of the current usage.
    pub fn set_callback(&self, callback: Option<Callback>, cookie: *mut c_void) {
        self.ledger.set_callback(callback, cookie);
        match callback {
            Some(_) => log::debug!("callback replaced, cookie {:p}", cookie),
            None => log::debug!("callback removed"),
        }
    }

    /// `malloc`. Zero-sized requests return null.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let Some(real) = self.resolver.get() else {
            return self.bootstrap_malloc(size);
        };
        let Some(request) = size.checked_add(HEADER_SIZE) else {
            return ptr::null_mut();
        };
        // SAFETY: the resolved source guarantees a working `malloc`.
        let Some(base) = NonNull::new(unsafe { (real.malloc)(request) } as *mut u8) else {
            return ptr::null_mut();
        };
        self.ledger.account_alloc(size);
        // SAFETY: `base` holds `HEADER_SIZE + size` bytes at malloc alignment.
        let user = unsafe { header::encode(base, size, 0) };
        if self.config.logs(size) {
            diag!(
                "malloc({}) = {:p}   (current {})",
                size,
                user,
                self.current()
            );
        }
        user.as_ptr()
    }

    #[cold]
    fn bootstrap_malloc(&self, size: usize) -> *mut u8 {
        let Some(base) = self.arena.allocate(size) else {
            fatal(format_args!("init heap full !!!"));
        };
        // SAFETY: the arena reserved `HEADER_SIZE + size` aligned bytes.
        let user = unsafe { header::encode(base, size, 0) };
        if self.config.log_bootstrap {
            diag!("malloc({}) = {:p}   on init heap", size, user);
        }
        user.as_ptr()
    }

    /// `aligned_alloc`. The result is a multiple of `alignment`.
    ///
    /// Over-aligned requests have no bootstrap path; one arriving before
    /// resolution terminates the process.
    pub fn aligned_alloc(&self, alignment: usize, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let Some(real) = self.resolver.get() else {
            fatal(format_args!("aligned_alloc in init heap"));
        };
        let extra = alignment.saturating_sub(HEADER_SIZE);
        let Some(request) = size
            .checked_add(HEADER_SIZE)
            .and_then(|n| n.checked_add(extra))
        else {
            return ptr::null_mut();
        };
        // SAFETY: the resolved source guarantees a working `aligned_alloc`.
        let raw = unsafe { (real.aligned_alloc)(alignment, request) } as *mut u8;
        if raw.is_null() {
            return ptr::null_mut();
        }
        self.ledger.account_alloc(size);
        // SAFETY: `raw` holds `extra + HEADER_SIZE + size` bytes. Shifting by
        // `extra` puts the user pointer at `raw + alignment` when the
        // alignment exceeds the header, and at `raw + HEADER_SIZE` (a multiple
        // of any smaller power of two) otherwise.
        let user = unsafe { header::encode(NonNull::new_unchecked(raw.add(extra)), size, extra) };
        if self.config.logs(size) {
            diag!(
                "aligned_alloc({}, {}) = {:p}   (current {})",
                alignment,
                size,
                user,
                self.current()
            );
        }
        user.as_ptr()
    }

    /// `memalign`, same as [`aligned_alloc`](Self::aligned_alloc).
    pub fn memalign(&self, alignment: usize, size: usize) -> *mut u8 {
        self.aligned_alloc(alignment, size)
    }

    /// `posix_memalign`: returns `EINVAL` for an alignment that is not a
    /// power of two multiple of the pointer size, `ENOMEM` when a non-empty
    /// request fails, `0` otherwise.
    pub fn posix_memalign(&self, out: &mut *mut u8, alignment: usize, size: usize) -> c_int {
        if !alignment.is_power_of_two() || alignment % core::mem::size_of::<*mut c_void>() != 0 {
            return libc::EINVAL;
        }
        let p = self.aligned_alloc(alignment, size);
        if p.is_null() && size != 0 {
            return libc::ENOMEM;
        }
        *out = p;
        0
    }

    /// `calloc`. A product that overflows `usize` yields null.
    pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        let Some(bytes) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        if bytes == 0 {
            return ptr::null_mut();
        }
        let p = self.malloc(bytes);
        if !p.is_null() {
            // SAFETY: `p` holds `bytes` writable bytes.
            unsafe { p.write_bytes(0, bytes) };
        }
        p
    }

    /// `free`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this instance.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(user) = NonNull::new(ptr) else {
            return;
        };
        if self.arena.owns(ptr) {
            if self.config.log_bootstrap {
                diag!("free({:p})   on init heap", ptr);
            }
            return;
        }
        let Some(real) = self.resolver.get() else {
            diag!("free({:p}) outside init heap and without real_free !!!", ptr);
            return;
        };
        let decoded = self.decode("free", user);
        self.ledger.account_free(decoded.size);
        if self.config.logs(decoded.size) {
            diag!(
                "free({:p}) -> {}   (current {})",
                ptr,
                decoded.size,
                self.current()
            );
        }
        (real.free)(decoded.allocation_base() as *mut c_void);
    }

    /// `realloc`. A null `ptr` allocates, a zero `new_size` frees and
    /// returns null. On failure null is returned and `ptr` stays valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this instance.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let Some(user) = NonNull::new(ptr) else {
            return self.malloc(new_size);
        };
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        if self.arena.owns(ptr) {
            return self.bootstrap_realloc(user, new_size);
        }
        let Some(real) = self.resolver.get() else {
            diag!("realloc({:p}) outside init heap and without real_realloc !!!", ptr);
            return ptr::null_mut();
        };

        let old = self.decode("realloc", user);
        if old.extra_alignment != 0 {
            // The real realloc would not keep the alignment, nor know about
            // the padding in front.
            return self.move_block(user, old.size, new_size);
        }
        let Some(request) = new_size.checked_add(HEADER_SIZE) else {
            return ptr::null_mut();
        };
        let base = (real.realloc)(old.header_base.as_ptr() as *mut c_void, request) as *mut u8;
        let Some(base) = NonNull::new(base) else {
            return ptr::null_mut();
        };
        self.ledger.account_free(old.size);
        self.ledger.account_alloc(new_size);
        let moved = base != old.header_base;
        let user = header::encode(base, new_size, 0);
        if self.config.logs(new_size) {
            if moved {
                diag!(
                    "realloc({} -> {}) = {:p} -> {:p}   (current {})",
                    old.size,
                    new_size,
                    ptr,
                    user,
                    self.current()
                );
            } else {
                diag!(
                    "realloc({} -> {}) = {:p}   (current {})",
                    old.size,
                    new_size,
                    user,
                    self.current()
                );
            }
        }
        user.as_ptr()
    }

    #[cold]
    unsafe fn bootstrap_realloc(&self, user: NonNull<u8>, new_size: usize) -> *mut u8 {
        if self.config.log_bootstrap {
            diag!("realloc({:p}) = on init heap", user);
        }
        let old = self.decode("realloc", user);
        if new_size <= old.size {
            header::set_size(user, new_size);
            return user.as_ptr();
        }
        self.move_block(user, old.size, new_size)
    }

    /// Allocate a fresh block through `malloc`, copy, release the old one.
    unsafe fn move_block(&self, user: NonNull<u8>, old_size: usize, new_size: usize) -> *mut u8 {
        let fresh = self.malloc(new_size);
        if fresh.is_null() {
            return fresh;
        }
        ptr::copy_nonoverlapping(user.as_ptr(), fresh, old_size.min(new_size));
        self.free(user.as_ptr());
        fresh
    }

    /// Read the header of `user`, applying the sentinel policy.
    unsafe fn decode(&self, op: &str, user: NonNull<u8>) -> Decoded {
        let decoded = header::decode(user);
        if !decoded.intact {
            match self.config.sentinel_policy {
                SentinelPolicy::Warn => {
                    diag!("{}({:p}) has no sentinel !!! memory corruption?", op, user)
                }
                SentinelPolicy::Abort => fatal(format_args!(
                    "{}({:p}) has no sentinel !!! memory corruption?",
                    op, user
                )),
            }
        }
        decoded
    }
}

impl<const N: usize> Default for MallocCount<N> {
    fn default() -> Self {
        Self::new()
    }
}
