//! # `malloc_count`
//! Counts what the process allocates: bytes currently live, the peak, the
//! total ever requested and the number of allocations, with an optional
//! callback on every change.
//!
//! Every block gets a small hidden header recording its size, so the count
//! stays exact without any help from the caller. The real work is delegated
//! to the allocator found at [`initialize`]; anything requested earlier is
//! served from a static bootstrap arena and never counted.
//!
//! # Examples
//! ```rust,no_run
//! use malloc_count::{CountingAlloc, MALLOC_COUNT};
//!
//! // This needs to be done at the project root, i.e. `lib.rs` or `main.rs`
//! #[global_allocator]
//! static GLOBAL: CountingAlloc = CountingAlloc::new(&MALLOC_COUNT);
//!
//! fn main() {
//!     malloc_count::initialize();
//!
//!     let before = malloc_count::stats();
//!     let _buffer = Vec::<u8>::with_capacity(100);
//!     println!("{}", malloc_count::stats().relative_to(&before));
//!
//!     malloc_count::print_status();
//!     malloc_count::shutdown();
//! }
//! ```
//!
//! Built with the `preload` feature, the `cdylib` exports `malloc`, `free`
//! and friends and can be injected into any dynamically linked program with
//! `LD_PRELOAD`; the summary is then printed when the program exits.

mod alloc;
mod arena;
mod config;
mod context;
pub mod diag;
#[cfg(feature = "preload")]
mod ffi;
pub mod header;
mod monitor;
pub mod resolver;

pub use crate::alloc::CountingAlloc;
pub use arena::{BootstrapArena, BOOTSTRAP_ARENA_SIZE};
pub use config::*;
pub use context::MallocCount;
pub use monitor::*;
pub use resolver::{Libc, NextInChain, ResolveError, SymbolSource};

use libc::c_void;

/// The process-wide counter.
pub static MALLOC_COUNT: MallocCount = MallocCount::new();

/// Resolve the real allocator for [`MALLOC_COUNT`]. Call this once, as early
/// as possible; failure terminates the process.
pub fn initialize() {
    #[cfg(not(feature = "preload"))]
    MALLOC_COUNT.initialize(&Libc);
    // The libc symbols are our own exports in this build.
    #[cfg(feature = "preload")]
    MALLOC_COUNT.initialize(&NextInChain);
}

/// Print the exit summary for [`MALLOC_COUNT`].
pub fn shutdown() {
    MALLOC_COUNT.shutdown();
}

/// Bytes currently allocated.
pub fn current() -> usize {
    MALLOC_COUNT.current()
}

/// Highest [`current`] seen so far.
pub fn peak() -> usize {
    MALLOC_COUNT.peak()
}

/// Start peak tracking over from the current usage.
pub fn reset_peak() {
    MALLOC_COUNT.reset_peak()
}

pub fn num_allocations() -> usize {
    MALLOC_COUNT.num_allocations()
}

pub fn stats() -> Stats {
    MALLOC_COUNT.stats()
}

/// Print current and peak usage to stderr.
pub fn print_status() {
    MALLOC_COUNT.print_status()
}

/// Install `callback`, replacing any previous one. It runs inside the
/// allocator, so it should not do much.
pub fn set_callback(callback: Option<Callback>, cookie: *mut c_void) {
    MALLOC_COUNT.set_callback(callback, cookie)
}
