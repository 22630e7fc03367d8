//! The per-CPU cooperative scheduler and its shared state.
//!
//! Three work sources feed each CPU: the bottom-half queue (I/O
//! completions, drained outside the kernel lock), the global run queue
//! (drained under it), and per-CPU thread queues balanced by stealing
//! and donating between cores.

pub mod lock;
pub mod runloop;
pub mod thread;
pub mod timer;

extern crate alloc;
use alloc::boxed::Box;
use alloc::sync::Arc;

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crossbeam_queue::ArrayQueue;
use spin::{Once, RwLock};

use crate::constants::sched::{
    BHQUEUE_SIZE, RUNLOOP_TIMER_MAX_PERIOD_US, RUNLOOP_TIMER_MIN_PERIOD_US, RUNQUEUE_SIZE,
};
use crate::constants::MAX_CORES;
use crate::interrupts::{idt, x2apic};
use crate::shutdown::machine_halt;
use crate::smp::{self, cpu};
use crate::time::{microseconds, ClockId, Timestamp};

use timer::{Timer, TimerHandler, TimerHeap};

pub(crate) const RUNLOOP_TIMER_MIN: Timestamp = microseconds(RUNLOOP_TIMER_MIN_PERIOD_US);
pub(crate) const RUNLOOP_TIMER_MAX: Timestamp = microseconds(RUNLOOP_TIMER_MAX_PERIOD_US);

/// A deferred call, executed exactly once by whoever dequeues it.
pub struct Thunk(Box<dyn FnOnce() + Send>);

impl Thunk {
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> Thunk {
        Thunk(Box::new(f))
    }

    pub fn apply(self) {
        (self.0)()
    }
}

static RUNQUEUE: Once<ArrayQueue<Thunk>> = Once::new();
static BHQUEUE: Once<ArrayQueue<Thunk>> = Once::new();
static RUNLOOP_TIMERS: Once<TimerHeap> = Once::new();

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);
static WAKEUP_VECTOR: AtomicU8 = AtomicU8::new(0);
static SHUTDOWN_VECTOR: AtomicU8 = AtomicU8::new(0);

/// Deadline the platform timer was last armed for, shared across CPUs;
/// each CPU additionally tracks its own copy for quantum re-arming.
pub(crate) static LAST_TIMER_UPDATE: AtomicU64 = AtomicU64::new(0);

static MM_SERVICE: RwLock<Option<fn()>> = RwLock::new(None);

pub(crate) fn runqueue() -> &'static ArrayQueue<Thunk> {
    RUNQUEUE.get().expect("scheduler not initialized")
}

pub(crate) fn bhqueue() -> &'static ArrayQueue<Thunk> {
    BHQUEUE.get().expect("scheduler not initialized")
}

pub(crate) fn timers() -> &'static TimerHeap {
    RUNLOOP_TIMERS.get().expect("scheduler not initialized")
}

pub fn shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::SeqCst)
}

/// One bit per parked CPU. A CPU in idle state with an empty thread
/// queue always has its bit set; any CPU clears the bit when it decides
/// to wake the target.
pub struct IdleCpuMask {
    words: [AtomicU64; MAX_CORES / 64],
}

impl IdleCpuMask {
    const fn new() -> IdleCpuMask {
        IdleCpuMask {
            words: [const { AtomicU64::new(0) }; MAX_CORES / 64],
        }
    }

    pub fn set(&self, cpu: u32) {
        self.words[cpu as usize / 64].fetch_or(1 << (cpu % 64), Ordering::SeqCst);
    }

    pub fn clear(&self, cpu: u32) {
        self.words[cpu as usize / 64].fetch_and(!(1 << (cpu % 64)), Ordering::SeqCst);
    }

    /// Clear the bit, reporting whether it was set.
    pub fn test_and_clear(&self, cpu: u32) -> bool {
        let mask = 1 << (cpu % 64);
        self.words[cpu as usize / 64].fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    pub fn test(&self, cpu: u32) -> bool {
        self.words[cpu as usize / 64].load(Ordering::SeqCst) & (1 << (cpu % 64)) != 0
    }

    /// Lowest set bit in `[first, first + count)`, without wrapping.
    pub fn first_set_in(&self, first: u32, count: u32) -> Option<u32> {
        (first..first + count).find(|&cpu| self.test(cpu))
    }
}

static IDLE_CPU_MASK: IdleCpuMask = IdleCpuMask::new();

pub(crate) fn idle_cpu_mask() -> &'static IdleCpuMask {
    &IDLE_CPU_MASK
}

fn wakeup_ipi() {
    // Nothing to do; delivery alone breaks the target out of hlt.
}

fn shutdown_ipi() {
    machine_halt();
}

/// Queues, timer heap, and the scheduler's IPI vectors.
pub fn init_scheduler() {
    RUNQUEUE.call_once(|| ArrayQueue::new(RUNQUEUE_SIZE));
    BHQUEUE.call_once(|| ArrayQueue::new(BHQUEUE_SIZE));
    RUNLOOP_TIMERS.call_once(|| TimerHeap::new("runloop"));

    let wakeup = idt::allocate_ipi_vector().expect("out of IPI vectors");
    idt::register_interrupt(wakeup, wakeup_ipi, "wakeup ipi");
    WAKEUP_VECTOR.store(wakeup, Ordering::Release);

    let shutdown = idt::allocate_ipi_vector().expect("out of IPI vectors");
    idt::register_interrupt(shutdown, shutdown_ipi, "shutdown ipi");
    SHUTDOWN_VECTOR.store(shutdown, Ordering::Release);

    SHUTTING_DOWN.store(false, Ordering::SeqCst);
}

/// Size the per-CPU state once the processor count is known.
pub fn init_scheduler_cpus(count: usize) {
    cpu::init_cpus(count);
}

/// Register a timer on the run-loop timer heap.
pub fn kern_register_timer(
    clock_id: ClockId,
    val: Timestamp,
    absolute: bool,
    interval: Timestamp,
    handler: TimerHandler,
) -> Arc<Timer> {
    timers().register(clock_id, val, absolute, interval, handler)
}

/// Queue deferred work from interrupt context; runs outside the kernel
/// lock on the next pass.
pub fn enqueue_bhqueue(thunk: Thunk) -> Result<(), Thunk> {
    bhqueue().push(thunk)
}

/// Queue kernel work; runs under the kernel lock on the next pass.
pub fn enqueue_runqueue(thunk: Thunk) -> Result<(), Thunk> {
    runqueue().push(thunk)
}

/// Queue a thread on a specific CPU and make sure it notices.
pub fn enqueue_thread(cpu_id: u32, thunk: Thunk) -> Result<(), Thunk> {
    cpu::cpuinfo_from_id(cpu_id).thread_queue.push(thunk)?;
    wakeup_cpu(cpu_id);
    Ok(())
}

/// Wake `cpu_id` if it is parked.
pub fn wakeup_cpu(cpu_id: u32) {
    if IDLE_CPU_MASK.test_and_clear(cpu_id) {
        log::trace!("waking up CPU {}", cpu_id);
        x2apic::send_ipi(cpu_id, WAKEUP_VECTOR.load(Ordering::Acquire));
    }
}

/// Kick every other CPU, parked or not. Clearing the idle bit of a busy
/// CPU is harmless; the IPI still fires.
pub fn wakeup_or_interrupt_cpu_all() {
    let self_id = cpu::current_cpu().id();
    for id in 0..smp::total_processors() {
        if id != self_id {
            IDLE_CPU_MASK.clear(id);
            x2apic::send_ipi(id, WAKEUP_VECTOR.load(Ordering::Acquire));
        }
    }
}

/// Stop scheduling new work everywhere and halt the other CPUs.
pub fn begin_shutdown() {
    SHUTTING_DOWN.store(true, Ordering::SeqCst);
    let self_id = cpu::try_current().map(|ci| ci.id());
    for id in 0..smp::total_processors() {
        if Some(id) != self_id {
            x2apic::send_ipi(id, SHUTDOWN_VECTOR.load(Ordering::Acquire));
        }
    }
}

/// Background memory balancing, run under the kernel lock each pass.
pub fn set_mm_service(service: fn()) {
    *MM_SERVICE.write() = Some(service);
}

pub(crate) fn mm_service() {
    if let Some(service) = *MM_SERVICE.read() {
        service();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn queue_is_fifo_for_a_single_consumer() {
        use core::sync::atomic::AtomicU64;

        let queue = ArrayQueue::new(8);
        let order = Arc::new(AtomicU64::new(0));
        for i in 0..3u64 {
            let order = order.clone();
            queue
                .push(Thunk::new(move || {
                    // Each thunk appends its digit; FIFO yields 123.
                    order
                        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                            Some(v * 10 + i + 1)
                        })
                        .unwrap();
                }))
                .map_err(|_| ())
                .unwrap();
        }
        while let Some(thunk) = queue.pop() {
            thunk.apply();
        }
        assert_eq!(order.load(Ordering::Relaxed), 123);
    }

    #[test_case]
    fn full_queue_rejects_and_returns_the_thunk() {
        let queue: ArrayQueue<Thunk> = ArrayQueue::new(1);
        assert!(queue.push(Thunk::new(|| ())).is_ok());
        assert!(queue.push(Thunk::new(|| ())).is_err());
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
    }

    #[test_case]
    fn idle_mask_set_clear_scan() {
        let mask = IdleCpuMask::new();
        mask.set(1);
        mask.set(3);
        assert_eq!(mask.first_set_in(0, 4), Some(1));
        assert_eq!(mask.first_set_in(2, 2), Some(3));
        assert!(mask.test_and_clear(1));
        assert!(!mask.test_and_clear(1));
        assert_eq!(mask.first_set_in(0, 3), None);
        assert_eq!(mask.first_set_in(3, 1), Some(3));
    }

    #[test_case]
    fn idle_mask_search_order_matches_stealing() {
        // A CPU searches [id+1, total) before [0, id).
        let mask = IdleCpuMask::new();
        mask.set(0);
        mask.set(2);
        let id = 1u32;
        let total = 4u32;
        let above = mask.first_set_in(id + 1, total - id - 1);
        assert_eq!(above, Some(2));
        let below = mask.first_set_in(0, id);
        assert_eq!(below, Some(0));
    }
}
