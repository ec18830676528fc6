/// What to do when a block handed to `free`/`realloc` has lost its sentinel.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum SentinelPolicy {
    /// Report the corruption and keep going with whatever the header says.
    Warn,
    /// Report the corruption and terminate the process.
    Abort,
}

/// Compile-time knobs for a [`MallocCount`](crate::MallocCount) instance.
///
/// All setters are `const fn` so a configured instance can still be built in
/// a `static` initializer:
///
/// ```rust
/// use malloc_count::{Config, MallocCount, SentinelPolicy};
///
/// static COUNTER: MallocCount = MallocCount::with_config(
///     Config::new()
///         .log_operations(true)
///         .log_threshold(64 * 1024)
///         .sentinel_policy(SentinelPolicy::Abort),
/// );
/// ```
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Config {
    pub log_operations: bool,
    /// Allocations smaller than this are not logged.
    pub log_threshold: usize,
    pub log_bootstrap: bool,
    pub sentinel_policy: SentinelPolicy,
}

impl Config {
    pub const DEFAULT_LOG_THRESHOLD: usize = 1024 * 1024;

    pub const fn new() -> Self {
        Self {
            log_operations: cfg!(feature = "log-operations"),
            log_threshold: Self::DEFAULT_LOG_THRESHOLD,
            log_bootstrap: false,
            sentinel_policy: SentinelPolicy::Warn,
        }
    }

    pub const fn log_operations(mut self, on: bool) -> Self {
        self.log_operations = on;
        self
    }

    pub const fn log_threshold(mut self, bytes: usize) -> Self {
        self.log_threshold = bytes;
        self
    }

    pub const fn log_bootstrap(mut self, on: bool) -> Self {
        self.log_bootstrap = on;
        self
    }

    pub const fn sentinel_policy(mut self, policy: SentinelPolicy) -> Self {
        self.sentinel_policy = policy;
        self
    }

    /// Whether an operation on `size` bytes should be logged.
    #[inline]
    pub(crate) fn logs(&self, size: usize) -> bool {
        self.log_operations && size >= self.log_threshold
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_gates_logging() {
        let config = Config::new().log_operations(true).log_threshold(100);
        assert!(!config.logs(99));
        assert!(config.logs(100));
        assert!(!config.log_operations(false).logs(1 << 30));
    }
}
