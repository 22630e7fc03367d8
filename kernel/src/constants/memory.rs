pub const PAGESIZE: u64 = 4096;
pub const PAGESIZE_2M: u64 = 2 * 1024 * 1024;
pub const PAGELOG_2M: u64 = 21;

/// Granularity of the huge virtual heap; the page virtual heap carves these.
pub const HUGE_PAGESIZE: u64 = 1 << 32;

/// Kernel virtual address window carved by the virtual heaps.
pub const KMEM_BASE: u64 = 0xffff_8000_0000_0000;
pub const KMEM_LIMIT: u64 = 0xffff_9000_0000_0000;

/// Fixed window through which page-table memory in the initial-pages
/// region is reached once the identity map is gone.
pub const PAGES_BASE: u64 = 0xffff_b000_0000_0000;

/// Base of the permanently mapped window over physical memory.
pub const LINEAR_BACKED_BASE: u64 = 0xffff_c000_0000_0000;
pub const LINEAR_BACKED_LIMIT: u64 = 0xffff_c080_0000_0000;

pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;
pub const KERNEL_BASE_PHYS: u64 = 0x20_0000;

/// Extent of the boot-time identity mapping.
pub const INITIAL_MAP_SIZE: u64 = 0x400_0000;
/// Physical memory set aside for the real page tables.
pub const INITIAL_PAGES_SIZE: u64 = 0x80_0000;

pub const MBR_ADDRESS: u64 = 0x7c00;

/// Static region backing all allocation until the kernel heaps exist.
pub const BOOTSTRAP_SIZE: usize = 2 * 1024 * 1024;

pub const KERNEL_STACK_PAGES: u64 = 32;
pub const STACK_ALIGNMENT: u64 = 16;

/// Size-class orders served by the mcache; larger requests fall through
/// to the parent heap.
pub const MIN_MCACHE_ORDER: u32 = 5;
pub const MAX_MCACHE_ORDER: u32 = 16;

/// Low-memory page the AP boot trampoline is copied to.
pub const AP_BOOT_PAGE: u64 = 0x8000;

/// Virtual span handed to each tagged-value region.
pub const TAGGED_REGION_SIZE: u64 = HUGE_PAGESIZE;
