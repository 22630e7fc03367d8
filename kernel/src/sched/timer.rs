//! Priority queue of absolute-deadline timers in a named clock domain.
//!
//! Handlers run under the kernel lock. A one-shot timer has left the
//! heap before its handler runs; a periodic timer is re-inserted one
//! interval past the deadline that fired.

extern crate alloc;
use alloc::boxed::Box;
use alloc::collections::binary_heap::BinaryHeap;
use alloc::sync::Arc;

use core::cmp::Ordering as CmpOrdering;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::time::{now, ClockId, Timestamp};

pub type TimerHandler = Box<dyn FnMut(Timestamp) + Send>;

pub struct Timer {
    clock_id: ClockId,
    deadline: AtomicU64,
    interval: Timestamp,
    handler: Mutex<TimerHandler>,
}

impl Timer {
    pub fn clock_id(&self) -> ClockId {
        self.clock_id
    }

    pub fn deadline(&self) -> Timestamp {
        self.deadline.load(Ordering::Acquire)
    }

    pub fn interval(&self) -> Timestamp {
        self.interval
    }
}

struct Entry {
    deadline: Timestamp,
    seq: u64,
    timer: Arc<Timer>,
}

// Min-heap on (deadline, insertion order), via reversed Ord.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
            .reverse()
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

pub struct TimerHeap {
    name: &'static str,
    heap: Mutex<BinaryHeap<Entry>>,
    seq: AtomicU64,
}

impl TimerHeap {
    pub fn new(name: &'static str) -> TimerHeap {
        TimerHeap {
            name,
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn insert(&self, timer: Arc<Timer>, deadline: Timestamp) {
        timer.deadline.store(deadline, Ordering::Release);
        self.heap.lock().push(Entry {
            deadline,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timer,
        });
    }

    /// Register a timer `val` from now (or at the absolute deadline
    /// `val`); `interval` of zero means one-shot.
    pub fn register(
        &self,
        clock_id: ClockId,
        val: Timestamp,
        absolute: bool,
        interval: Timestamp,
        handler: TimerHandler,
    ) -> Arc<Timer> {
        let deadline = if absolute { val } else { now(clock_id) + val };
        let timer = Arc::new(Timer {
            clock_id,
            deadline: AtomicU64::new(deadline),
            interval,
            handler: Mutex::new(handler),
        });
        self.insert(timer.clone(), deadline);
        timer
    }

    /// Earliest pending deadline; pure observation.
    pub fn check(&self) -> Option<Timestamp> {
        self.heap.lock().peek().map(|entry| entry.deadline)
    }

    /// Run every timer with `deadline <= now`, re-inserting periodic
    /// ones at their next deadline.
    pub fn service(&self, now: Timestamp) {
        loop {
            let entry = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(entry) if entry.deadline <= now => heap.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else {
                break;
            };
            (entry.timer.handler.lock())(now);
            if entry.timer.interval != 0 {
                self.insert(entry.timer.clone(), entry.deadline + entry.timer.interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::milliseconds;

    use core::sync::atomic::{AtomicU64, Ordering};

    fn counting_handler(counter: Arc<AtomicU64>) -> TimerHandler {
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test_case]
    fn check_reports_earliest_deadline() {
        let heap = TimerHeap::new("test");
        let fired = Arc::new(AtomicU64::new(0));
        heap.register(
            ClockId::MonotonicRaw,
            milliseconds(5),
            true,
            0,
            counting_handler(fired.clone()),
        );
        heap.register(
            ClockId::MonotonicRaw,
            milliseconds(1),
            true,
            0,
            counting_handler(fired.clone()),
        );
        assert_eq!(heap.check(), Some(milliseconds(1)));
        // Nothing expired yet.
        heap.service(milliseconds(1) - 1);
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        assert_eq!(heap.check(), Some(milliseconds(1)));
    }

    #[test_case]
    fn service_runs_expired_in_deadline_order() {
        let heap = TimerHeap::new("test");
        let order = Arc::new(AtomicU64::new(0));
        for deadline in [milliseconds(5), milliseconds(1), milliseconds(3)] {
            let order = order.clone();
            let tag = deadline / milliseconds(1);
            heap.register(
                ClockId::MonotonicRaw,
                deadline,
                true,
                0,
                Box::new(move |_| {
                    order
                        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                            Some(v * 10 + tag)
                        })
                        .unwrap();
                }),
            );
        }
        heap.service(milliseconds(10));
        assert_eq!(order.load(Ordering::Relaxed), 135);
        assert_eq!(heap.check(), None);
    }

    #[test_case]
    fn one_shot_timers_leave_the_heap_before_firing() {
        let heap: &'static TimerHeap = alloc::boxed::Box::leak(Box::new(TimerHeap::new("test")));
        let seen = Arc::new(AtomicU64::new(0));
        let observed = seen.clone();
        heap.register(
            ClockId::MonotonicRaw,
            milliseconds(1),
            true,
            0,
            Box::new(move |_| {
                observed.store(heap.check().unwrap_or(u64::MAX), Ordering::Relaxed);
            }),
        );
        heap.service(milliseconds(2));
        // The handler saw an empty heap: its own timer was gone.
        assert_eq!(seen.load(Ordering::Relaxed), u64::MAX);
    }

    #[test_case]
    fn periodic_timers_reinsert_at_next_interval() {
        let heap = TimerHeap::new("test");
        let fired = Arc::new(AtomicU64::new(0));
        let timer = heap.register(
            ClockId::MonotonicRaw,
            milliseconds(1),
            true,
            milliseconds(4),
            counting_handler(fired.clone()),
        );
        heap.service(milliseconds(1));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert_eq!(heap.check(), Some(milliseconds(5)));
        assert_eq!(timer.deadline(), milliseconds(5));
        heap.service(milliseconds(5));
        assert_eq!(fired.load(Ordering::Relaxed), 2);
        assert_eq!(heap.check(), Some(milliseconds(9)));
    }
}
