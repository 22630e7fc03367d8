//! Scheduler configuration constants.

/// Capacity of the global run queue.
pub const RUNQUEUE_SIZE: usize = 2048;

/// Capacity of the bottom-half queue.
pub const BHQUEUE_SIZE: usize = 2048;

/// Capacity of each per-CPU thread queue.
pub const THREAD_QUEUE_SIZE: usize = 256;

/// Shortest one-shot the platform timer is armed with.
pub const RUNLOOP_TIMER_MIN_PERIOD_US: u64 = 1_000;

/// Scheduler quantum; longest one-shot the platform timer is armed with.
pub const RUNLOOP_TIMER_MAX_PERIOD_US: u64 = 100_000;
