//! C symbols that take over the process allocator when this library is
//! loaded ahead of libc, e.g. through `LD_PRELOAD`.

use crate::resolver::NextInChain;
use crate::MALLOC_COUNT;
use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};
use libc::{c_int, c_longlong, c_void, size_t};

#[no_mangle]
pub extern "C" fn malloc(size: size_t) -> *mut c_void {
    MALLOC_COUNT.malloc(size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    MALLOC_COUNT.free(ptr as *mut u8)
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    MALLOC_COUNT.realloc(ptr as *mut u8, size) as *mut c_void
}

#[no_mangle]
pub extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
    MALLOC_COUNT.calloc(count, size) as *mut c_void
}

#[no_mangle]
pub extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    MALLOC_COUNT.aligned_alloc(alignment, size) as *mut c_void
}

#[no_mangle]
pub extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    MALLOC_COUNT.memalign(alignment, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    out: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    let mut p = core::ptr::null_mut();
    let rc = MALLOC_COUNT.posix_memalign(&mut p, alignment, size);
    if rc == 0 {
        *out = p as *mut c_void;
    }
    rc
}

#[no_mangle]
pub extern "C" fn malloc_count_current() -> size_t {
    MALLOC_COUNT.current()
}

#[no_mangle]
pub extern "C" fn malloc_count_peak() -> size_t {
    MALLOC_COUNT.peak()
}

#[no_mangle]
pub extern "C" fn malloc_count_reset_peak() {
    MALLOC_COUNT.reset_peak()
}

#[no_mangle]
pub extern "C" fn malloc_count_num_allocs() -> size_t {
    MALLOC_COUNT.num_allocations()
}

#[no_mangle]
pub extern "C" fn malloc_count_print_status() {
    MALLOC_COUNT.print_status()
}

/// C flavour of [`Callback`](crate::Callback), current usage as `long long`.
pub type CCallback = unsafe extern "C" fn(cookie: *mut c_void, current: c_longlong);

static C_CALLBACK: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn trampoline(cookie: *mut c_void, current: usize) {
    let raw = C_CALLBACK.load(Ordering::Acquire);
    if raw != 0 {
        let callback = mem::transmute::<usize, CCallback>(raw);
        callback(cookie, current as c_longlong);
    }
}

#[no_mangle]
pub extern "C" fn malloc_count_set_callback(callback: Option<CCallback>, cookie: *mut c_void) {
    match callback {
        Some(cb) => {
            C_CALLBACK.store(cb as usize, Ordering::Release);
            MALLOC_COUNT.set_callback(Some(trampoline), cookie);
        }
        None => {
            MALLOC_COUNT.set_callback(None, cookie);
            C_CALLBACK.store(0, Ordering::Release);
        }
    }
}

extern "C" fn init() {
    MALLOC_COUNT.initialize(&NextInChain);
    // SAFETY: `finish` is a plain function with no preconditions.
    if unsafe { libc::atexit(finish) } != 0 {
        crate::diag!("cannot register exit summary");
    }
}

extern "C" fn finish() {
    MALLOC_COUNT.shutdown();
}

#[used]
#[cfg_attr(any(target_os = "linux", target_os = "android"), link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static INIT: extern "C" fn() = init;
