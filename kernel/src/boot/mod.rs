//! Boot orchestration: entry, initial mappings, heap bring-up, and the
//! jump onto the permanent stack.

pub mod cmdline;
pub mod params;
pub mod regions;

use spin::Once;

use x86_64::registers::control::{Cr4, Cr4Flags};
use x86_64::registers::model_specific::{Efer, EferFlags};

use crate::constants::memory::{
    INITIAL_MAP_SIZE, INITIAL_PAGES_SIZE, KERNEL_BASE, KERNEL_BASE_PHYS, KERNEL_STACK_PAGES,
    MBR_ADDRESS, PAGELOG_2M, PAGES_BASE, PAGESIZE, PAGESIZE_2M, STACK_ALIGNMENT,
};
use crate::memory::heap::{round_up, Heap};
use crate::memory::paging::{self, PageFlags};
use crate::memory::{self, RegionTag};
use crate::random;
use crate::{halt, logging};

use regions::RegionType;

/// Runtime entry the kernel binary supplies; receives the finished heap
/// aggregate and never returns.
pub type RuntimeInit = fn(&'static memory::KernelHeaps) -> !;

static RUNTIME_INIT: Once<RuntimeInit> = Once::new();

pub fn set_runtime_init(entry: RuntimeInit) {
    RUNTIME_INIT.call_once(|| entry);
}

extern "C" {
    static _kernel_end: u8;
    static _writable_start: u8;
}

fn kernel_size() -> u64 {
    (unsafe { &_kernel_end } as *const u8 as u64) - KERNEL_BASE
}

/// Image offset where text and rodata end and data/bss begin.
fn writable_offset() -> u64 {
    (unsafe { &_writable_start } as *const u8 as u64) - KERNEL_BASE
}

/// Kernel entry. `rdi` carries the staged loader's handoff (or zero);
/// `rsi` points at the boot-parameter block when the hypervisor loaded
/// us directly.
///
/// # Safety
/// Must be called exactly once, on the boot processor, with the machine
/// state either loader handoff leaves behind.
pub unsafe fn init_service(rdi: u64, rsi: u64) -> ! {
    logging::init();
    log::debug!("init_service");
    // Mappings carry NX bits from the start.
    Efer::update(|flags| flags.insert(EferFlags::NO_EXECUTE_ENABLE));

    let params = rsi as *const u8;
    let mut cmdline = None;
    let mut loader_pt_used = 0;
    if !params.is_null() && params::is_direct_handoff(params) {
        cmdline = direct_handoff(params);
    } else if rdi != 0 {
        loader_pt_used = regions::install_from_loader(rdi);
    }

    memory::init_kernel_heaps(loader_pt_used);
    if let Some(cmdline) = cmdline {
        cmdline::parse(cmdline);
    }

    let kh = memory::get_kernel_heaps();
    let stack_size = KERNEL_STACK_PAGES * PAGESIZE;
    let stack = kh
        .page_backed
        .alloc(stack_size)
        .expect("kernel stack allocation failed");
    let top = stack + stack_size - STACK_ALIGNMENT;
    (top as *mut u64).write(0);
    switch_stack(top, init_service_new_stack)
}

/// The kernel was loaded by the hypervisor without a staged loader:
/// build regions from e820, get onto virtual addresses, and set up the
/// initial mappings the staged path would have provided.
unsafe fn direct_handoff(params: *const u8) -> Option<&'static str> {
    let image_size = kernel_size();
    let entries = params::e820_table(params);
    let (pdpt, pdt) = regions::with_table_mut(|table| {
        params::e820_to_regions(entries, image_size, table)
    })
    .unwrap_or_else(|| halt!("no memory region covers the kernel image"));

    // Transient 2 MiB mapping of the kernel, then run from virtual
    // addresses so statics and literals resolve.
    paging::map_setup_2mbpages(
        KERNEL_BASE,
        KERNEL_BASE_PHYS,
        round_up(image_size, PAGESIZE_2M) >> PAGELOG_2M,
        PageFlags::memory().writable().exec(),
        pdpt,
        pdt,
    );
    jump_to_virtual();

    let mut cmdline_ptr = params::cmdline_ptr(params);
    let cmdline_size = params::cmdline_size(params);
    let cmdline = if cmdline_ptr != 0 && cmdline_size != 0 {
        if cmdline_ptr + cmdline_size >= INITIAL_MAP_SIZE {
            // Outside the range we are about to map; the parameter
            // block itself is parsed already, so reuse its memory.
            assert!(params as u64 + cmdline_size < MBR_ADDRESS);
            core::ptr::copy(
                cmdline_ptr as *const u8,
                params as *mut u8,
                cmdline_size as usize,
            );
            *(params as *mut u8).add(cmdline_size as usize) = 0;
            cmdline_ptr = params as u64;
        }
        let bytes = core::slice::from_raw_parts(cmdline_ptr as *const u8, cmdline_size as usize);
        core::str::from_utf8(bytes)
            .ok()
            .map(|cmdline| cmdline.trim_end_matches('\0'))
    } else {
        None
    };

    regions::create_region(KERNEL_BASE_PHYS, image_size, RegionType::KernImage);

    // Real page tables, set up the same way the staged loader does it.
    let initial_pages = regions::with_table_mut(|table| table.carve_physical(INITIAL_PAGES_SIZE))
        .unwrap_or_else(|| halt!("no room for initial page tables"));
    regions::create_region(initial_pages, INITIAL_PAGES_SIZE, RegionType::InitialPages);
    paging::bootstrap_page_tables(initial_pages, INITIAL_PAGES_SIZE);

    let rwx = PageFlags::memory().writable().exec();
    // The first 2 MiB goes in as 4 KiB pages so reclaim can drop
    // everything above the zero page; the rest takes 2 MiB leaves.
    paging::map(0, 0, PAGESIZE, rwx);
    paging::map(PAGESIZE, PAGESIZE, PAGESIZE_2M - PAGESIZE, rwx);
    paging::map(
        PAGESIZE_2M,
        PAGESIZE_2M,
        INITIAL_MAP_SIZE - PAGESIZE_2M,
        rwx,
    );
    paging::map(
        PAGES_BASE,
        initial_pages,
        INITIAL_PAGES_SIZE,
        PageFlags::memory().writable(),
    );
    // Kernel text and rodata lock down to read-only + exec; data and
    // bss stay writable.
    let writable = writable_offset();
    paging::map(
        KERNEL_BASE,
        KERNEL_BASE_PHYS,
        writable,
        PageFlags::memory().readonly().exec(),
    );
    paging::map(
        KERNEL_BASE + writable,
        KERNEL_BASE_PHYS + writable,
        round_up(image_size - writable, PAGESIZE),
        PageFlags::memory().writable(),
    );
    paging::load_root();

    cmdline
}

/// Hop the instruction pointer from the identity alias onto the linked
/// (virtual) addresses.
unsafe fn jump_to_virtual() {
    core::arch::asm!(
        "mov $55f, {tmp}",
        "jmp *{tmp}",
        "55:",
        tmp = out(reg) _,
        options(att_syntax),
    );
}

unsafe fn switch_stack(stack_top: u64, target: unsafe extern "C" fn() -> !) -> ! {
    core::arch::asm!(
        "mov rsp, {stack}",
        "xor ebp, ebp",
        "jmp {target}",
        stack = in(reg) stack_top,
        target = in(reg) target,
        options(noreturn),
    )
}

/// Continue on the permanent stack: final page-table plumbing, tagged
/// regions, platform discovery, then the runtime entry.
unsafe extern "C" fn init_service_new_stack() -> ! {
    log::debug!("on permanent stack");
    let kh = memory::get_kernel_heaps();
    paging::init_page_tables(kh.linear_backed as &'static dyn Heap);

    memory::allocate_tagged_region(kh, RegionTag::Tuple);
    memory::allocate_tagged_region(kh, RegionTag::Symbol);
    memory::allocate_tagged_region(kh, RegionTag::FunctionTuple);

    if let Some(smbios) = regions::find(RegionType::Smbios) {
        memory::set_smbios_entry(smbios.base);
    }

    random::init_hwrand();
    init_cpu_features();

    let entry = RUNTIME_INIT
        .get()
        .unwrap_or_else(|| halt!("no runtime entry registered"));
    entry(kh)
}

fn init_cpu_features() {
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::NO_EXECUTE_ENABLE));
        Cr4::update(|flags| {
            flags.insert(Cr4Flags::PAGE_GLOBAL | Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE)
        });
    }
}
