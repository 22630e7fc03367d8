//! Batched TLB invalidation.
//!
//! Unmaps queue the affected addresses for every CPU; each CPU flushes
//! its own batch on the next run-loop pass. Large batches degrade to a
//! full flush.

use spin::Mutex;
use x86_64::instructions::tlb;
use x86_64::VirtAddr;

use crate::constants::memory::PAGESIZE;
use crate::constants::MAX_CORES;

const BATCH_MAX: usize = 32;

struct Pending {
    full_flush: bool,
    count: usize,
    pages: [u64; BATCH_MAX],
}

impl Pending {
    const fn new() -> Pending {
        Pending {
            full_flush: false,
            count: 0,
            pages: [0; BATCH_MAX],
        }
    }

    fn add(&mut self, va: u64, length: u64) {
        if self.full_flush {
            return;
        }
        let npages = (length / PAGESIZE) as usize;
        if self.count + npages > BATCH_MAX {
            self.full_flush = true;
            self.count = 0;
            return;
        }
        for i in 0..npages {
            self.pages[self.count + i] = va + i as u64 * PAGESIZE;
        }
        self.count += npages;
    }
}

static PENDING: [Mutex<Pending>; MAX_CORES] = [const { Mutex::new(Pending::new()) }; MAX_CORES];

/// Queue `[va, va + length)` for invalidation on every CPU.
pub fn queue_invalidate(va: u64, length: u64) {
    for slot in PENDING.iter() {
        slot.lock().add(va, length);
    }
}

/// Apply this CPU's pending invalidations. Called with interrupts
/// disabled at the top of each run-loop pass.
pub fn flush_pending(cpu: u32) {
    let mut pending = PENDING[cpu as usize].lock();
    if pending.full_flush {
        tlb::flush_all();
    } else {
        for i in 0..pending.count {
            tlb::flush(VirtAddr::new(pending.pages[i]));
        }
    }
    pending.full_flush = false;
    pending.count = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn overflow_degrades_to_full_flush() {
        let mut p = Pending::new();
        p.add(0x1000, PAGESIZE * 4);
        assert_eq!(p.count, 4);
        assert!(!p.full_flush);
        p.add(0x100000, PAGESIZE * (BATCH_MAX as u64));
        assert!(p.full_flush);
        assert_eq!(p.count, 0);
    }
}
