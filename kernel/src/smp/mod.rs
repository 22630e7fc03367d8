//! Secondary processor bring-up.
//!
//! Processor count comes from the MADT (registered by the ACPI layer);
//! each AP is started with the INIT-SIPI-SIPI dance through a real-mode
//! trampoline staged in a page-backed buffer and copied to low memory.

pub mod cpu;

use core::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use x86_64::registers::control::Cr3;

use crate::constants::memory::{AP_BOOT_PAGE, KERNEL_STACK_PAGES, PAGESIZE, STACK_ALIGNMENT};
use crate::interrupts::{self, x2apic};
use crate::memory::heap::Heap;
use crate::memory::KernelHeaps;
use crate::sched;
use crate::time;

static PRESENT_PROCESSORS: AtomicU32 = AtomicU32::new(1);
static TOTAL_PROCESSORS: AtomicU32 = AtomicU32::new(1);
static MADT_VA: AtomicU64 = AtomicU64::new(0);

/// Processors the firmware reports as enabled.
pub fn present_processors() -> u32 {
    PRESENT_PROCESSORS.load(Ordering::Acquire)
}

/// Processors actually running a run loop.
pub fn total_processors() -> u32 {
    TOTAL_PROCESSORS.load(Ordering::Acquire)
}

/// Register the MADT location, as found by the ACPI layer.
pub fn set_madt(va: u64) {
    MADT_VA.store(va, Ordering::Release);
}

bitflags! {
    #[derive(Clone, Copy)]
    struct MadtLapicFlags: u32 {
        const ENABLED = 1 << 0;
        const ONLINE_CAPABLE = 1 << 1;
    }
}

const MADT_HEADER_LEN: usize = 44;
const MADT_ENTRY_LAPIC: u8 = 0;
const MADT_ENTRY_LAPIC_X2: u8 = 9;

/// Count enabled local APIC entries in a raw MADT.
fn count_madt(table: &[u8]) -> u32 {
    let mut count = 0;
    let mut offset = MADT_HEADER_LEN;
    while offset + 2 <= table.len() {
        let kind = table[offset];
        let length = table[offset + 1] as usize;
        if length < 2 || offset + length > table.len() {
            break;
        }
        let flags_offset = match kind {
            MADT_ENTRY_LAPIC => Some(offset + 4),
            MADT_ENTRY_LAPIC_X2 => Some(offset + 8),
            _ => None,
        };
        if let Some(flags_offset) = flags_offset {
            if flags_offset + 4 <= table.len() {
                let flags = MadtLapicFlags::from_bits_retain(u32::from_le_bytes(
                    table[flags_offset..flags_offset + 4].try_into().unwrap(),
                ));
                if flags.contains(MadtLapicFlags::ENABLED) {
                    count += 1;
                }
            }
        }
        offset += length;
    }
    count
}

fn count_processors() {
    let madt = MADT_VA.load(Ordering::Acquire);
    if madt == 0 {
        PRESENT_PROCESSORS.store(1, Ordering::Release);
        log::warn!("ACPI MADT not found, default to 1 processor");
        return;
    }
    let table = unsafe {
        let length = ((madt + 4) as *const u32).read_unaligned().min(0x10000) as usize;
        core::slice::from_raw_parts(madt as *const u8, length)
    };
    let count = count_madt(table).max(1);
    PRESENT_PROCESSORS.store(count, Ordering::Release);
    log::debug!("ACPI reports {} processors", count);
}

// Value comes from the LDMXCSR instruction reference; hypervisors do
// not always initialize the register.
const MXCSR_DEFAULT: u32 = 0x1F80;

fn init_mxcsr() {
    unsafe {
        core::arch::asm!("ldmxcsr [{}]", in(reg) &MXCSR_DEFAULT, options(nostack));
    }
}

core::arch::global_asm!(
    r#"
    .section .text
    .code16
    .global ap_boot_start
ap_boot_start:
    cli
    xorw %ax, %ax
    movw %ax, %ds
    lgdtl (ap_gdt_desc - ap_boot_start + 0x8000)
    movl %cr4, %eax
    orl $0xa0, %eax
    movl %eax, %cr4
    movl (ap_cr3 - ap_boot_start + 0x8000), %eax
    movl %eax, %cr3
    movl $0xc0000080, %ecx
    rdmsr
    orl $0x900, %eax
    wrmsr
    movl %cr0, %eax
    orl $0x80000001, %eax
    movl %eax, %cr0
    ljmpl $0x08, $(ap_long - ap_boot_start + 0x8000)
    .code64
ap_long:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    movq (ap_stack - ap_boot_start + 0x8000), %rsp
    xorl %ebp, %ebp
    movq (ap_entry - ap_boot_start + 0x8000), %rax
    jmpq *%rax
    .balign 8
    .global ap_cr3
ap_cr3:
    .quad 0
    .global ap_stack
ap_stack:
    .quad 0
    .global ap_entry
ap_entry:
    .quad 0
ap_gdt:
    .quad 0
    .quad 0x00af9a000000ffff
    .quad 0x00cf92000000ffff
ap_gdt_desc:
    .word ap_gdt_desc - ap_gdt - 1
    .long ap_gdt - ap_boot_start + 0x8000
    .global ap_boot_end
ap_boot_end:
"#,
    options(att_syntax)
);

extern "C" {
    static ap_boot_start: u8;
    static ap_boot_end: u8;
    static ap_cr3: u8;
    static ap_stack: u8;
    static ap_entry: u8;
}

fn stub_offset(symbol: &u8) -> usize {
    (symbol as *const u8 as usize) - (unsafe { &ap_boot_start } as *const u8 as usize)
}

/// Stage the trampoline in a page-backed buffer, ready for per-AP
/// patching.
fn allocate_apboot(heap: &dyn Heap) -> u64 {
    let staging = heap.alloc(PAGESIZE).expect("AP trampoline allocation failed");
    unsafe {
        let length = stub_offset(&ap_boot_end);
        assert!(length <= PAGESIZE as usize);
        core::ptr::copy_nonoverlapping(
            &ap_boot_start as *const u8,
            staging as *mut u8,
            length,
        );
        let (frame, _) = Cr3::read();
        *((staging + stub_offset(&ap_cr3) as u64) as *mut u64) = frame.start_address().as_u64();
        *((staging + stub_offset(&ap_entry) as u64) as *mut u64) = new_cpu as usize as u64;
    }
    staging
}

fn deallocate_apboot(heap: &dyn Heap, staging: u64) {
    heap.dealloc(staging, PAGESIZE);
}

/// First code an AP runs in long mode.
extern "C" fn new_cpu() -> ! {
    let id = x2apic::current_core_id();
    interrupts::init_ap(id);
    init_mxcsr();
    TOTAL_PROCESSORS.fetch_add(1, Ordering::SeqCst);
    log::debug!("AP {} initialized", id);
    // Cover the spurious hlt wakeup some hypervisors deliver after AP
    // start by parking; the first real interrupt enters the run loop.
    sched::runloop::kernel_sleep()
}

/// Wake every enabled secondary processor.
pub fn start_secondary_cores(kh: &KernelHeaps) {
    fence(Ordering::SeqCst);
    count_processors();
    init_mxcsr();

    let present = present_processors();
    sched::init_scheduler_cpus(present as usize);
    if present <= 1 {
        return;
    }

    let staging = allocate_apboot(kh.page_backed);
    let stack_size = KERNEL_STACK_PAGES * PAGESIZE;
    for id in 1..present {
        let stack = kh
            .page_backed
            .alloc(stack_size)
            .expect("AP stack allocation failed");
        unsafe {
            *((staging + stub_offset(&ap_stack) as u64) as *mut u64) =
                stack + stack_size - STACK_ALIGNMENT;
            core::ptr::copy_nonoverlapping(
                staging as *const u8,
                AP_BOOT_PAGE as *mut u8,
                PAGESIZE as usize,
            );
        }
        let before = total_processors();
        unsafe {
            x2apic::start_cpu(id, AP_BOOT_PAGE);
        }
        let mut spins = 0;
        while total_processors() == before {
            time::busy_wait_us(100);
            spins += 1;
            if spins > 10_000 {
                log::warn!("AP {} did not come up", id);
                break;
            }
        }
    }
    deallocate_apboot(kh.page_backed, staging);
    log::debug!("started {} total processors", total_processors());
}

#[cfg(test)]
mod tests {
    extern crate alloc;
    use alloc::vec::Vec;

    use super::*;

    fn madt_with(entries: &[&[u8]]) -> Vec<u8> {
        let mut table = alloc::vec![0u8; MADT_HEADER_LEN];
        for entry in entries {
            table.extend_from_slice(entry);
        }
        let length = table.len() as u32;
        table[4..8].copy_from_slice(&length.to_le_bytes());
        table
    }

    #[test_case]
    fn counts_enabled_lapics_of_both_kinds() {
        let lapic_on = [0u8, 8, 0, 0, 1, 0, 0, 0];
        let lapic_off = [0u8, 8, 1, 1, 0, 0, 0, 0];
        let x2_on = [9u8, 16, 0, 0, 4, 0, 0, 0, 1, 0, 0, 0, 4, 0, 0, 0];
        let io_apic = [1u8, 12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let table = madt_with(&[&lapic_on, &lapic_off, &x2_on, &io_apic]);
        assert_eq!(count_madt(&table), 2);
    }

    #[test_case]
    fn truncated_tables_do_not_overrun() {
        let table = madt_with(&[&[0u8, 8, 0, 0]]);
        assert_eq!(count_madt(&table), 0);
    }
}
