//! Page-table mutation primitives: 2 MiB and 4 KiB mappings over the
//! active root.
//!
//! Table memory comes from three sources over the kernel's lifetime:
//! a bump cursor over the initial-pages region while the fresh root is
//! built, the remainder of that region once the MMU state is bound, and
//! the linear-backed heap after `init_page_tables`. Table words are
//! reached through whichever window is live for their physical address.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::PhysAddr;

use crate::constants::memory::{
    LINEAR_BACKED_BASE, PAGES_BASE, PAGESIZE, PAGESIZE_2M,
};
use crate::halt;

use super::heap::{round_up, Heap};
use super::tlb;

const ENTRIES: u64 = 512;
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Mapping attributes, built up from a read-only no-exec base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl PageFlags {
    pub fn memory() -> PageFlags {
        PageFlags(PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE)
    }

    pub fn writable(mut self) -> PageFlags {
        self.0.insert(PageTableFlags::WRITABLE);
        self
    }

    pub fn readonly(mut self) -> PageFlags {
        self.0.remove(PageTableFlags::WRITABLE);
        self
    }

    pub fn exec(mut self) -> PageFlags {
        self.0.remove(PageTableFlags::NO_EXECUTE);
        self
    }

    pub fn noexec(mut self) -> PageFlags {
        self.0.insert(PageTableFlags::NO_EXECUTE);
        self
    }

    pub fn is_writable(&self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    pub fn is_exec(&self) -> bool {
        !self.0.contains(PageTableFlags::NO_EXECUTE)
    }

    fn bits(self) -> u64 {
        self.0.bits()
    }
}

/// Where fresh table pages come from.
enum PtSource {
    None,
    /// Physical bump cursor over the initial-pages region.
    Range { cursor: u64, end: u64 },
    /// Linear-backed heap; returned addresses are window VAs.
    Heap(&'static dyn Heap),
}

static PT_SOURCE: Mutex<PtSource> = Mutex::new(PtSource::None);
static MAPPING_LOCK: Mutex<()> = Mutex::new(());

/// Physical root all mutations apply to.
static ROOT: AtomicU64 = AtomicU64::new(0);

static INITIAL_PAGES_BASE: AtomicU64 = AtomicU64::new(0);
static INITIAL_PAGES_LENGTH: AtomicU64 = AtomicU64::new(0);
static PAGES_WINDOW_LIVE: AtomicBool = AtomicBool::new(false);
static LINEAR_WINDOW_LIVE: AtomicBool = AtomicBool::new(false);

/// Virtual address through which a page-table page is read and written.
fn table_va(pa: u64) -> *mut u64 {
    let ip_base = INITIAL_PAGES_BASE.load(Ordering::Acquire);
    let ip_length = INITIAL_PAGES_LENGTH.load(Ordering::Acquire);
    if PAGES_WINDOW_LIVE.load(Ordering::Acquire) && pa >= ip_base && pa < ip_base + ip_length {
        return (PAGES_BASE + (pa - ip_base)) as *mut u64;
    }
    if LINEAR_WINDOW_LIVE.load(Ordering::Acquire) {
        (LINEAR_BACKED_BASE + pa) as *mut u64
    } else {
        // Early boot: the identity map is still in place.
        pa as *mut u64
    }
}

fn alloc_table_page() -> u64 {
    let mut source = PT_SOURCE.lock();
    let pa = match &mut *source {
        PtSource::None => halt!("page table allocation before MMU init"),
        PtSource::Range { cursor, end } => {
            if *cursor + PAGESIZE > *end {
                halt!("out of initial page-table pages");
            }
            let pa = *cursor;
            *cursor += PAGESIZE;
            pa
        }
        PtSource::Heap(heap) => match heap.alloc(PAGESIZE) {
            Some(va) => va - LINEAR_BACKED_BASE,
            None => halt!("page table allocation failed"),
        },
    };
    drop(source);
    unsafe {
        core::ptr::write_bytes(table_va(pa) as *mut u8, 0, PAGESIZE as usize);
    }
    pa
}

/// Start building a fresh root out of the initial-pages region. The
/// new (empty) top-level table is not loaded until `load_root`.
pub unsafe fn bootstrap_page_tables(initial_pages_base: u64, initial_pages_length: u64) {
    *PT_SOURCE.lock() = PtSource::Range {
        cursor: initial_pages_base,
        end: initial_pages_base + initial_pages_length,
    };
    let root = alloc_table_page();
    ROOT.store(root, Ordering::Release);
}

/// Point CR3 at the root built by `bootstrap_page_tables`.
pub unsafe fn load_root() {
    let root = ROOT.load(Ordering::Acquire);
    Cr3::write(
        PhysFrame::containing_address(PhysAddr::new(root)),
        Cr3Flags::empty(),
    );
}

/// Bind the MMU state: record the initial-pages region and, when the
/// root was handed over by a staged loader, adopt CR3 and the unused
/// remainder of the region for new tables.
pub fn init_mmu(initial_pages_base: u64, initial_pages_length: u64, loader_used: u64) {
    INITIAL_PAGES_BASE.store(initial_pages_base, Ordering::Release);
    INITIAL_PAGES_LENGTH.store(initial_pages_length, Ordering::Release);
    let mut source = PT_SOURCE.lock();
    if let PtSource::None = *source {
        let (frame, _) = Cr3::read();
        ROOT.store(frame.start_address().as_u64(), Ordering::Release);
        *source = PtSource::Range {
            cursor: initial_pages_base + loader_used,
            end: initial_pages_base + initial_pages_length,
        };
    }
}

/// Declare the fixed window over the initial-pages region usable. The
/// mapping itself is built by the boot path (or the staged loader).
pub fn init_page_initial_map() {
    PAGES_WINDOW_LIVE.store(true, Ordering::Release);
}

/// Switch table allocation to the linear-backed heap; from here on the
/// linear window also serves table access.
pub fn init_page_tables(heap: &'static dyn Heap) {
    LINEAR_WINDOW_LIVE.store(true, Ordering::Release);
    *PT_SOURCE.lock() = PtSource::Heap(heap);
}

fn index(va: u64, level: u32) -> u64 {
    (va >> (12 + 9 * level)) & (ENTRIES - 1)
}

/// Walk to the table at `level`, creating intermediate tables as needed.
/// Level 2 holds 2 MiB leaves, level 1 holds 4 KiB page tables.
unsafe fn descend(root: u64, va: u64, to_level: u32, create: bool) -> Option<u64> {
    let mut table = root;
    let mut level = 3;
    while level > to_level {
        let entry_ptr = table_va(table).add(index(va, level) as usize);
        let entry = entry_ptr.read_volatile();
        if entry & PageTableFlags::PRESENT.bits() == 0 {
            if !create {
                return None;
            }
            let new_table = alloc_table_page();
            entry_ptr.write_volatile(
                new_table | (PageTableFlags::PRESENT | PageTableFlags::WRITABLE).bits(),
            );
            table = new_table;
        } else {
            debug_assert!(
                entry & PageTableFlags::HUGE_PAGE.bits() == 0,
                "walk through leaf at {:#x}",
                va
            );
            table = entry & ADDR_MASK;
        }
        level -= 1;
    }
    Some(table)
}

/// Map `[v, v + length)` to `[p, p + length)`. Uses 2 MiB leaves where
/// virtual and physical stay 2 MiB-aligned and enough length remains;
/// existing leaf entries are overwritten, which is how the kernel image
/// gets its final protections.
pub fn map(v: u64, p: u64, length: u64, flags: PageFlags) {
    let _guard = MAPPING_LOCK.lock();
    let root = ROOT.load(Ordering::Acquire);
    assert!(root != 0, "map before MMU init");
    let length = round_up(length, PAGESIZE);
    let mut offset = 0;
    while offset < length {
        let va = v + offset;
        let pa = p + offset;
        unsafe {
            if va % PAGESIZE_2M == 0 && pa % PAGESIZE_2M == 0 && length - offset >= PAGESIZE_2M {
                let pd = descend(root, va, 1, true).unwrap();
                let entry = table_va(pd).add(index(va, 1) as usize);
                entry.write_volatile(pa | flags.bits() | PageTableFlags::HUGE_PAGE.bits());
                offset += PAGESIZE_2M;
            } else {
                let pt = descend(root, va, 0, true).unwrap();
                let entry = table_va(pt).add(index(va, 0) as usize);
                entry.write_volatile(pa | flags.bits());
                offset += PAGESIZE;
            }
        }
    }
}

/// Drop the translations covering `[v, v + length)`. Absent entries are
/// skipped; invalidations are queued for the next run-loop pass.
pub fn unmap(v: u64, length: u64) {
    let _guard = MAPPING_LOCK.lock();
    let root = ROOT.load(Ordering::Acquire);
    let length = round_up(length, PAGESIZE);
    let mut offset = 0;
    while offset < length {
        let va = v + offset;
        unsafe {
            if let Some(pd) = descend(root, va, 1, false) {
                let pd_entry_ptr = table_va(pd).add(index(va, 1) as usize);
                let pd_entry = pd_entry_ptr.read_volatile();
                if pd_entry & PageTableFlags::PRESENT.bits() == 0 {
                    offset += PAGESIZE_2M - va % PAGESIZE_2M;
                    continue;
                }
                if pd_entry & PageTableFlags::HUGE_PAGE.bits() != 0 {
                    debug_assert!(va % PAGESIZE_2M == 0 && length - offset >= PAGESIZE_2M);
                    pd_entry_ptr.write_volatile(0);
                    offset += PAGESIZE_2M;
                    continue;
                }
                let pt = pd_entry & ADDR_MASK;
                let entry = table_va(pt).add(index(va, 0) as usize);
                entry.write_volatile(0);
            }
        }
        offset += PAGESIZE;
    }
    tlb::queue_invalidate(v, length);
}

/// Physical address `va` currently translates to, if any.
pub fn physical_of(va: u64) -> Option<u64> {
    let root = ROOT.load(Ordering::Acquire);
    unsafe {
        let pd = descend(root, va, 1, false)?;
        let pd_entry = table_va(pd).add(index(va, 1) as usize).read_volatile();
        if pd_entry & PageTableFlags::PRESENT.bits() == 0 {
            return None;
        }
        if pd_entry & PageTableFlags::HUGE_PAGE.bits() != 0 {
            return Some((pd_entry & ADDR_MASK & !(PAGESIZE_2M - 1)) + va % PAGESIZE_2M);
        }
        let pt = pd_entry & ADDR_MASK;
        let entry = table_va(pt).add(index(va, 0) as usize).read_volatile();
        if entry & PageTableFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((entry & ADDR_MASK) + va % PAGESIZE)
    }
}

/// Write a transient 2 MiB-page mapping of `v -> p` into the tables the
/// hypervisor handed us, using the two donated table pages. Runs before
/// any window exists; everything is touched through the identity map.
///
/// # Safety
/// `pdpt` and `pdt` must be unused page-aligned physical pages and the
/// current root must identity-map them and itself.
pub unsafe fn map_setup_2mbpages(v: u64, p: u64, pages_2m: u64, flags: PageFlags, pdpt: u64, pdt: u64) {
    debug_assert!(pdpt % PAGESIZE == 0 && pdt % PAGESIZE == 0);
    core::ptr::write_bytes(pdpt as *mut u8, 0, PAGESIZE as usize);
    core::ptr::write_bytes(pdt as *mut u8, 0, PAGESIZE as usize);
    let table_flags = (PageTableFlags::PRESENT | PageTableFlags::WRITABLE).bits();
    let (frame, _) = Cr3::read();
    let pml4 = frame.start_address().as_u64() as *mut u64;
    pml4.add(index(v, 3) as usize).write_volatile(pdpt | table_flags);
    (pdpt as *mut u64)
        .add(index(v, 2) as usize)
        .write_volatile(pdt | table_flags);
    for i in 0..pages_2m {
        (pdt as *mut u64).add((index(v, 1) + i) as usize).write_volatile(
            (p + i * PAGESIZE_2M) | flags.bits() | PageTableFlags::HUGE_PAGE.bits(),
        );
    }
    x86_64::instructions::tlb::flush_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn pageflags_builders_are_monotonic() {
        let flags = PageFlags::memory();
        assert!(!flags.is_writable());
        assert!(!flags.is_exec());
        let rw = flags.writable();
        assert!(rw.is_writable());
        // Later constructors win: writable then readonly is read-only.
        let ro = rw.readonly();
        assert!(!ro.is_writable());
        assert!(flags.exec().is_exec());
        assert!(!flags.exec().noexec().is_exec());
    }

    #[test_case]
    fn table_indices() {
        let va = 0xffff_ffff_8000_0000u64;
        assert_eq!(index(va, 3), 511);
        assert_eq!(index(va, 2), 510);
        assert_eq!(index(va, 1), 0);
        assert_eq!(index(0x20_0000, 1), 1);
    }
}
