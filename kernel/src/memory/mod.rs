//! Kernel heap construction and the global allocation path.

pub mod backed;
pub mod bootstrap;
pub mod heap;
pub mod id_heap;
pub mod locking;
pub mod mcache;
pub mod paging;
pub mod tlb;

extern crate alloc;
use alloc::boxed::Box;

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::{Mutex, Once};

use crate::boot::regions::{self, RegionType};
use crate::constants::memory::{
    HUGE_PAGESIZE, INITIAL_MAP_SIZE, KMEM_BASE, KMEM_LIMIT, MAX_MCACHE_ORDER, MIN_MCACHE_ORDER,
    PAGESIZE, PAGESIZE_2M, TAGGED_REGION_SIZE,
};
use crate::halt;

use backed::{LinearBackedHeap, PageBackedHeap};
use bootstrap::BOOTSTRAP;
use heap::{round_up, Heap};
use id_heap::IdHeap;
use locking::Locking;
use mcache::MCache;
use paging::PageFlags;

/// Every long-lived allocator, built once during boot.
pub struct KernelHeaps {
    pub virtual_huge: &'static IdHeap,
    pub virtual_page: &'static IdHeap,
    pub physical: &'static IdHeap,
    pub page_backed: &'static PageBackedHeap,
    pub linear_backed: &'static LinearBackedHeap,
    /// Kernel-lock contexts only.
    pub general: &'static MCache,
    /// Safe from any context.
    pub locked: &'static Locking<MCache>,
}

static KERNEL_HEAPS: Once<KernelHeaps> = Once::new();
static HEAPS_LIVE: AtomicBool = AtomicBool::new(false);

pub fn get_kernel_heaps() -> &'static KernelHeaps {
    KERNEL_HEAPS.get().expect("kernel heaps not initialized")
}

/// Walk the region table and seed the physical heap with every usable
/// range, aligned inward to 2 MiB.
fn init_physical_id_heap() -> IdHeap {
    let physical = IdHeap::new(PAGESIZE);
    let mut found = false;
    regions::with_regions(|r| {
        if r.typ != RegionType::Physical {
            return;
        }
        let (base, length) = match align_region_2m(r.base, r.length) {
            Some(range) => range,
            None => return,
        };
        log::debug!("physical memory [{:#x}, {:#x})", base, base + length);
        if !physical.add_range(base, length) {
            halt!("id heap range add failed");
        }
        found = true;
    });
    if !found {
        halt!("no valid physical regions found; halt");
    }
    physical
}

/// Inward 2 MiB alignment: base rounds up, end rounds down. `None` when
/// nothing remains.
pub fn align_region_2m(base: u64, length: u64) -> Option<(u64, u64)> {
    let mask = PAGESIZE_2M - 1;
    let aligned_base = (base + mask) & !mask;
    let aligned_end = (base + length) & !mask;
    if aligned_base >= aligned_end {
        return None;
    }
    Some((aligned_base, aligned_end - aligned_base))
}

fn find_initial_pages() -> (u64, u64) {
    match regions::find(RegionType::InitialPages) {
        Some(r) => (r.base, r.length),
        None => halt!("no initial pages region found; halt"),
    }
}

fn leak<H>(heap: H) -> &'static H {
    Box::leak(Box::new(heap))
}

/// Build the kernel heaps in dependency order. Until this returns, all
/// allocation lands in the bootstrap region.
pub fn init_kernel_heaps(loader_pt_used: u64) {
    let virtual_huge = leak(
        IdHeap::with_range(HUGE_PAGESIZE, KMEM_BASE, KMEM_LIMIT - KMEM_BASE)
            .expect("virtual huge heap creation failed"),
    );
    let virtual_page = leak(IdHeap::backed(PAGESIZE, virtual_huge));
    let physical = leak(init_physical_id_heap());

    // Must occur after physical memory setup but before backed heap init.
    let (ip_base, ip_length) = find_initial_pages();
    paging::init_mmu(ip_base, ip_length, loader_pt_used);
    paging::init_page_initial_map();

    let page_backed = leak(PageBackedHeap::new(virtual_page, physical));
    let linear_backed = leak(LinearBackedHeap::new(physical));
    let general = leak(MCache::new(
        linear_backed,
        MIN_MCACHE_ORDER,
        MAX_MCACHE_ORDER,
        PAGESIZE_2M,
    ));
    let locked = leak(Locking::new(MCache::new(
        linear_backed,
        MIN_MCACHE_ORDER,
        MAX_MCACHE_ORDER,
        PAGESIZE_2M,
    )));

    KERNEL_HEAPS.call_once(|| KernelHeaps {
        virtual_huge,
        virtual_page,
        physical,
        page_backed,
        linear_backed,
        general,
        locked,
    });
    HEAPS_LIVE.store(true, Ordering::Release);
    log::debug!(
        "kernel heaps up, bootstrap used {} bytes",
        BOOTSTRAP.allocated()
    );
}

/// Return loader-era memory to the physical heap and drop the identity
/// window. One-time; every pointer into the identity range must have
/// been migrated before this runs.
pub fn reclaim_regions() {
    let kh = get_kernel_heaps();
    regions::with_regions(|r| {
        if r.typ != RegionType::Reclaim {
            return;
        }
        paging::unmap(r.base, r.length);
        if !kh.physical.add_range(r.base, r.length) {
            halt!(
                "reclaim: add range for physical heap failed [{:#x}, {:#x})",
                r.base,
                r.base + r.length
            );
        }
    });
    paging::unmap(PAGESIZE, INITIAL_MAP_SIZE - PAGESIZE);
}

/// Map the kernel ELF image read-only no-exec at a transient virtual
/// address and hand it to `f`, for symbol scanning.
pub fn with_kernel_image<F: FnOnce(u64, u64)>(f: F) {
    let kh = get_kernel_heaps();
    let image = match regions::find(RegionType::KernImage) {
        Some(r) => r,
        None => return,
    };
    let length = round_up(image.length, PAGESIZE);
    let va = kh
        .virtual_huge
        .alloc(length)
        .expect("kernel image map failed");
    paging::map(va, image.base, length, PageFlags::memory().noexec().readonly());
    f(va, image.length);
    paging::unmap(va, length);
}

/// Tags for regions holding a single kind of runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionTag {
    Tuple = 0,
    Symbol = 1,
    FunctionTuple = 2,
}

#[derive(Debug, Clone, Copy)]
pub struct TaggedRegion {
    pub base: u64,
    pub length: u64,
}

static TAGGED: Mutex<[Option<TaggedRegion>; 3]> = Mutex::new([None; 3]);

/// Carve the dedicated virtual span for `tag`-typed values.
pub fn allocate_tagged_region(kh: &KernelHeaps, tag: RegionTag) -> TaggedRegion {
    let base = kh
        .virtual_huge
        .alloc(TAGGED_REGION_SIZE)
        .expect("tagged region allocation failed");
    let region = TaggedRegion {
        base,
        length: TAGGED_REGION_SIZE,
    };
    TAGGED.lock()[tag as usize] = Some(region);
    region
}

pub fn tagged_region(tag: RegionTag) -> Option<TaggedRegion> {
    TAGGED.lock()[tag as usize]
}

/// SMBIOS entry point, published for the management collaborator.
static SMBIOS_ENTRY: AtomicU64 = AtomicU64::new(0);

pub fn set_smbios_entry(base: u64) {
    SMBIOS_ENTRY.store(base, Ordering::Release);
}

pub fn smbios_entry() -> Option<u64> {
    match SMBIOS_ENTRY.load(Ordering::Acquire) {
        0 => None,
        base => Some(base),
    }
}

/// Routes through the bootstrap bump until the kernel heaps exist, then
/// through the MT-safe mcache.
pub struct KernelAllocator;

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

fn alloc_size(layout: Layout) -> u64 {
    layout.size().max(layout.align()).max(1) as u64
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let addr = if HEAPS_LIVE.load(Ordering::Acquire) {
            get_kernel_heaps().locked.alloc(alloc_size(layout))
        } else {
            BOOTSTRAP.alloc_aligned(layout.size() as u64, layout.align())
        };
        addr.map(|a| a as *mut u8).unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Bootstrap-era objects are leaked.
        if bootstrap::BootstrapHeap::contains(ptr as u64) {
            return;
        }
        get_kernel_heaps().locked.dealloc(ptr as u64, alloc_size(layout));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::PAGESIZE_2M;

    #[test_case]
    fn inward_alignment_keeps_interior() {
        // [1 MiB, 512 MiB) tightens to [2 MiB, 512 MiB).
        let (base, length) = align_region_2m(0x10_0000, 0x2000_0000 - 0x10_0000).unwrap();
        assert_eq!(base, PAGESIZE_2M);
        assert_eq!(base + length, 0x2000_0000);
    }

    #[test_case]
    fn inward_alignment_drops_slivers() {
        assert!(align_region_2m(0x10_0000, 0x10_0000).is_none());
        assert!(align_region_2m(PAGESIZE_2M, 0x1000).is_none());
        // Exactly one aligned page survives.
        let (base, length) = align_region_2m(PAGESIZE_2M - 1, PAGESIZE_2M + 2).unwrap();
        assert_eq!(base, PAGESIZE_2M);
        assert_eq!(length, PAGESIZE_2M);
    }
}
