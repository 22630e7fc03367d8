//! Heaps that hand out mapped kernel memory.

extern crate alloc;
use alloc::collections::btree_set::BTreeSet;

use spin::Mutex;

use crate::constants::memory::{LINEAR_BACKED_BASE, LINEAR_BACKED_LIMIT, PAGESIZE, PAGESIZE_2M};

use super::heap::{round_up, Heap};
use super::id_heap::IdHeap;
use super::paging::{self, PageFlags};

/// Pairs a virtual range with freshly allocated physical pages, mapped
/// on every allocation and torn down on dealloc.
pub struct PageBackedHeap {
    virtual_page: &'static IdHeap,
    physical: &'static IdHeap,
}

impl PageBackedHeap {
    pub fn new(virtual_page: &'static IdHeap, physical: &'static IdHeap) -> PageBackedHeap {
        PageBackedHeap {
            virtual_page,
            physical,
        }
    }
}

impl Heap for PageBackedHeap {
    fn alloc(&self, size: u64) -> Option<u64> {
        let length = round_up(size, PAGESIZE);
        let va = self.virtual_page.alloc(length)?;
        let pa = match self.physical.alloc(length) {
            Some(pa) => pa,
            None => {
                self.virtual_page.dealloc(va, length);
                return None;
            }
        };
        paging::map(va, pa, length, PageFlags::memory().writable());
        Some(va)
    }

    fn dealloc(&self, base: u64, size: u64) {
        let length = round_up(size, PAGESIZE);
        if let Some(pa) = paging::physical_of(base) {
            paging::unmap(base, length);
            self.physical.dealloc(pa, length);
        }
        self.virtual_page.dealloc(base, length);
    }

    fn pagesize(&self) -> u64 {
        PAGESIZE
    }

    fn thread_safe(&self) -> bool {
        true
    }
}

/// Hands out addresses inside the permanent window over physical
/// memory; no per-allocation mapping, so dealloc only releases the
/// physical range.
pub struct LinearBackedHeap {
    physical: &'static IdHeap,
    mapped_chunks: Mutex<BTreeSet<u64>>,
}

impl LinearBackedHeap {
    pub fn new(physical: &'static IdHeap) -> LinearBackedHeap {
        LinearBackedHeap {
            physical,
            mapped_chunks: Mutex::new(BTreeSet::new()),
        }
    }

    fn ensure_mapped(&self, pa: u64, length: u64) {
        let mut mapped = self.mapped_chunks.lock();
        let mut chunk = pa & !(PAGESIZE_2M - 1);
        while chunk < pa + length {
            if mapped.insert(chunk) {
                paging::map(
                    LINEAR_BACKED_BASE + chunk,
                    chunk,
                    PAGESIZE_2M,
                    PageFlags::memory().writable(),
                );
            }
            chunk += PAGESIZE_2M;
        }
    }
}

impl Heap for LinearBackedHeap {
    fn alloc(&self, size: u64) -> Option<u64> {
        let length = round_up(size, PAGESIZE_2M);
        let pa = self.physical.alloc_aligned(length, PAGESIZE_2M)?;
        debug_assert!(LINEAR_BACKED_BASE + pa + length <= LINEAR_BACKED_LIMIT);
        self.ensure_mapped(pa, length);
        Some(LINEAR_BACKED_BASE + pa)
    }

    fn dealloc(&self, base: u64, size: u64) {
        let length = round_up(size, PAGESIZE_2M);
        self.physical.dealloc(base - LINEAR_BACKED_BASE, length);
    }

    fn pagesize(&self) -> u64 {
        PAGESIZE_2M
    }

    fn thread_safe(&self) -> bool {
        true
    }
}
