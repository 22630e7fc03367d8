//! CPU interrupt handling: GDT, IDT, and the x2APIC.

pub mod gdt;
pub mod idt;
pub mod x2apic;

use crate::halt;

/// Bring up interrupt handling on the boot processor. Failing to find a
/// usable timer source is fatal.
pub fn init_bsp() {
    gdt::init();
    idt::init_idt(0);
    if let Err(err) = x2apic::init_bsp() {
        halt!("timer initialization failed; no timer source ({:?})", err);
    }
}

/// Per-AP mirror of `init_bsp`; calibration is inherited.
pub fn init_ap(cpu_id: u32) {
    gdt::init();
    idt::init_idt(cpu_id);
    x2apic::init_ap().expect("AP APIC initialization failed");
}
