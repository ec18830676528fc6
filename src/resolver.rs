//! Locating the allocator that does the real work.

use core::cell::UnsafeCell;
use core::mem::{self, MaybeUninit};
use core::sync::atomic::{AtomicU8, Ordering};
use libc::{c_char, c_void};
use std::ffi::CStr;
use thiserror::Error;

pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
/// `aligned_alloc(alignment, size)`.
pub type AlignedAllocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;

/// The four primitives every accounted allocation is delegated to.
#[derive(Clone, Copy, Debug)]
pub struct RealAllocator {
    pub malloc: MallocFn,
    pub free: FreeFn,
    pub realloc: ReallocFn,
    pub aligned_alloc: AlignedAllocFn,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ResolveError {
    #[error("cannot resolve real `{symbol}`")]
    Missing { symbol: &'static str },
}

/// Somewhere to find the real allocator.
///
/// # Safety
///
/// The returned functions must form one allocator: anything from `malloc`,
/// `realloc` or `aligned_alloc` must be accepted by the others' `free` and
/// `realloc`. `lookup` may allocate.
pub unsafe trait SymbolSource {
    fn lookup(&self) -> Result<RealAllocator, ResolveError>;
}

/// The C library's own entry points, as linked into this binary.
///
/// This is the right source when the crate is installed as a Rust
/// `#[global_allocator]` and the libc symbols are untouched.
pub struct Libc;

unsafe extern "C" fn libc_aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    let mut out = core::ptr::null_mut();
    let alignment = alignment.max(mem::size_of::<*mut c_void>());
    if libc::posix_memalign(&mut out, alignment, size) != 0 {
        return core::ptr::null_mut();
    }
    out
}

unsafe impl SymbolSource for Libc {
    fn lookup(&self) -> Result<RealAllocator, ResolveError> {
        Ok(RealAllocator {
            malloc: libc::malloc,
            free: libc::free,
            realloc: libc::realloc,
            aligned_alloc: libc_aligned_alloc,
        })
    }
}

/// The next definition after this library in the dynamic link chain, found
/// with `dlsym(RTLD_NEXT, ..)`. The right source when this library shadows
/// the libc symbols.
pub struct NextInChain;

impl NextInChain {
    fn symbol(name: &'static CStr) -> Result<*mut c_void, ResolveError> {
        let missing = ResolveError::Missing {
            symbol: name.to_str().unwrap_or("?"),
        };
        // SAFETY: `name` is NUL-terminated; dlerror only reads thread state.
        unsafe {
            libc::dlerror();
            let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char);
            if !libc::dlerror().is_null() || sym.is_null() {
                return Err(missing);
            }
            Ok(sym)
        }
    }
}

unsafe impl SymbolSource for NextInChain {
    fn lookup(&self) -> Result<RealAllocator, ResolveError> {
        let malloc = Self::symbol(c"malloc")?;
        let aligned_alloc = Self::symbol(c"aligned_alloc")?;
        let realloc = Self::symbol(c"realloc")?;
        let free = Self::symbol(c"free")?;
        // SAFETY: dlsym found the C library definitions of these names, and
        // those have exactly these signatures.
        unsafe {
            Ok(RealAllocator {
                malloc: mem::transmute::<*mut c_void, MallocFn>(malloc),
                free: mem::transmute::<*mut c_void, FreeFn>(free),
                realloc: mem::transmute::<*mut c_void, ReallocFn>(realloc),
                aligned_alloc: mem::transmute::<*mut c_void, AlignedAllocFn>(aligned_alloc),
            })
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ResolverState {
    Unresolved,
    /// Set while the source is being queried. Allocations seen in this state
    /// are served from the bootstrap arena.
    Resolving,
    Ready,
}

/// Holds the real allocator once it has been found.
pub struct Resolver {
    state: AtomicU8,
    real: UnsafeCell<MaybeUninit<RealAllocator>>,
}

// SAFETY: `real` is written once, before `state` is published as `Ready` with
// release ordering, and only read after an acquire load observes `Ready`.
unsafe impl Sync for Resolver {}

impl Resolver {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(ResolverState::Unresolved as u8),
            real: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub fn state(&self) -> ResolverState {
        match self.state.load(Ordering::Acquire) {
            0 => ResolverState::Unresolved,
            1 => ResolverState::Resolving,
            _ => ResolverState::Ready,
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state() == ResolverState::Ready
    }

    /// The real allocator, if resolution has finished.
    #[inline]
    pub fn get(&self) -> Option<&RealAllocator> {
        if self.is_ready() {
            // SAFETY: see the `Sync` impl.
            Some(unsafe { (*self.real.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Query `source` and publish the result. Resolving twice is a no-op; a
    /// failed attempt leaves the resolver unresolved.
    ///
    /// A call that finds another thread in the middle of resolving waits for
    /// it, and takes over with its own `source` if that attempt fails.
    pub fn resolve<S: SymbolSource + ?Sized>(&self, source: &S) -> Result<(), ResolveError> {
        loop {
            match self.state.compare_exchange_weak(
                ResolverState::Unresolved as u8,
                ResolverState::Resolving as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) if current == ResolverState::Ready as u8 => return Ok(()),
                Err(_) => core::hint::spin_loop(),
            }
        }

        match source.lookup() {
            Ok(real) => {
                // SAFETY: we own the `Resolving` state, nobody reads `real`.
                unsafe { (*self.real.get()).write(real) };
                self.state
                    .store(ResolverState::Ready as u8, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.state
                    .store(ResolverState::Unresolved as u8, Ordering::Release);
                Err(e)
            }
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    unsafe impl SymbolSource for Broken {
        fn lookup(&self) -> Result<RealAllocator, ResolveError> {
            Err(ResolveError::Missing { symbol: "malloc" })
        }
    }

    #[test]
    fn resolves_once() {
        let resolver = Resolver::new();
        assert_eq!(resolver.state(), ResolverState::Unresolved);
        assert!(resolver.get().is_none());

        resolver.resolve(&Libc).unwrap();
        assert!(resolver.is_ready());
        let first = resolver.get().unwrap().malloc as usize;

        resolver.resolve(&Broken).unwrap();
        assert_eq!(resolver.get().unwrap().malloc as usize, first);
    }

    #[test]
    fn failure_leaves_resolver_unresolved() {
        let resolver = Resolver::new();
        assert_eq!(
            resolver.resolve(&Broken),
            Err(ResolveError::Missing { symbol: "malloc" })
        );
        assert_eq!(resolver.state(), ResolverState::Unresolved);
        resolver.resolve(&Libc).unwrap();
        assert!(resolver.is_ready());
    }

    #[test]
    fn libc_aligned_alloc_honors_alignment() {
        let real = Libc.lookup().unwrap();
        unsafe {
            let p = (real.aligned_alloc)(4096, 10);
            assert!(!p.is_null());
            assert_eq!(p as usize % 4096, 0);
            (real.free)(p);
        }
    }

    #[test]
    fn error_messages_name_the_symbol() {
        let e = ResolveError::Missing { symbol: "free" };
        assert_eq!(e.to_string(), "cannot resolve real `free`");
    }

    struct Slow;

    unsafe impl SymbolSource for Slow {
        fn lookup(&self) -> Result<RealAllocator, ResolveError> {
            std::thread::sleep(std::time::Duration::from_millis(200));
            Libc.lookup()
        }
    }

    #[test]
    fn concurrent_resolve_waits_for_the_first() {
        static RESOLVER: Resolver = Resolver::new();
        let first = std::thread::spawn(|| RESOLVER.resolve(&Slow));
        while RESOLVER.state() == ResolverState::Unresolved && !first.is_finished() {
            std::thread::yield_now();
        }
        assert_eq!(RESOLVER.resolve(&Broken), Ok(()));
        assert!(RESOLVER.is_ready());
        assert_eq!(first.join().unwrap(), Ok(()));
    }

    struct SlowBroken;

    unsafe impl SymbolSource for SlowBroken {
        fn lookup(&self) -> Result<RealAllocator, ResolveError> {
            std::thread::sleep(std::time::Duration::from_millis(200));
            Err(ResolveError::Missing { symbol: "realloc" })
        }
    }

    #[test]
    fn waiter_takes_over_after_failed_attempt() {
        static RESOLVER: Resolver = Resolver::new();
        let first = std::thread::spawn(|| RESOLVER.resolve(&SlowBroken));
        while RESOLVER.state() == ResolverState::Unresolved && !first.is_finished() {
            std::thread::yield_now();
        }
        assert_eq!(RESOLVER.resolve(&Libc), Ok(()));
        assert!(RESOLVER.is_ready());
        assert_eq!(
            first.join().unwrap(),
            Err(ResolveError::Missing { symbol: "realloc" })
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn next_in_chain_finds_libc() {
        let real = NextInChain.lookup().unwrap();
        unsafe {
            let p = (real.malloc)(16);
            assert!(!p.is_null());
            (real.free)(p);
        }
    }
}
