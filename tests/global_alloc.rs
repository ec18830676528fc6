//! Runs with `harness = false`: the test harness allocates on its own
//! threads, which would make exact counts impossible.

use malloc_count::{CountingAlloc, Stats, MALLOC_COUNT};
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(not(feature = "preload"))]
#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc::new(&MALLOC_COUNT);

static SEEN: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn on_change(cookie: *mut libc::c_void, current: usize) {
    (*(cookie as *const AtomicUsize)).store(current, Ordering::SeqCst);
}

#[repr(align(4096))]
struct Page([u8; 4096]);

fn bootstrap_is_not_counted() {
    let early = Box::new([7u8; 64]);
    assert!(MALLOC_COUNT.arena().owns(early.as_ptr()));
    assert_eq!(malloc_count::num_allocations(), 0);

    malloc_count::initialize();
    assert!(MALLOC_COUNT.is_ready());

    assert_eq!(early[63], 7);
    drop(early);
    assert_eq!(malloc_count::stats(), Stats::new());
}

fn vec_growth_is_exact() {
    let before = malloc_count::stats();
    let mut v: Vec<u8> = Vec::with_capacity(1000);
    assert_eq!(malloc_count::current(), before.current + 1000);
    v.extend_from_slice(&[1; 1000]);
    v.reserve_exact(1000);
    assert_eq!(malloc_count::current(), before.current + 2000);
    assert!(v.iter().all(|&b| b == 1));
    drop(v);

    let delta = malloc_count::stats().relative_to(&before);
    assert_eq!(delta.current, before.current);
    assert_eq!(delta.count, 2);
    assert_eq!(delta.total, 3000);
    assert!(malloc_count::peak() >= before.current + 2000);
}

fn over_aligned_box() {
    let before = malloc_count::current();
    let page = Box::new(Page([0; 4096]));
    assert_eq!(&*page as *const Page as usize % 4096, 0);
    assert!(page.0.iter().all(|&b| b == 0));
    assert_eq!(malloc_count::current(), before + 4096);
    drop(page);
    assert_eq!(malloc_count::current(), before);
}

fn peak_reset_and_callback() {
    malloc_count::reset_peak();
    assert_eq!(malloc_count::peak(), malloc_count::current());

    let before = malloc_count::current();
    malloc_count::set_callback(Some(on_change), &SEEN as *const AtomicUsize as *mut libc::c_void);
    let b = Box::new([0u64; 16]);
    assert_eq!(SEEN.load(Ordering::SeqCst), before + 128);
    drop(b);
    assert_eq!(SEEN.load(Ordering::SeqCst), before);
    malloc_count::set_callback(None, std::ptr::null_mut());
}

fn main() {
    if cfg!(feature = "preload") {
        return;
    }
    bootstrap_is_not_counted();
    vec_growth_is_exact();
    over_aligned_box();
    peak_reset_and_callback();

    malloc_count::print_status();
    malloc_count::shutdown();
    println!("global_alloc: ok");
}
