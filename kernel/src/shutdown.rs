//! VM exit and halt paths.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::RwLock;
use x86_64::instructions::port::Port;
use x86_64::instructions::{hlt, interrupts};
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use crate::constants::ports::QEMU_EXIT_PORT;

/// Platform-specific halt handler, e.g. an ACPI poweroff. Takes
/// precedence over the QEMU exit port.
pub type HaltHandler = fn(u8) -> !;

static VM_HALT: RwLock<Option<HaltHandler>> = RwLock::new(None);
static REBOOT_ON_EXIT: AtomicBool = AtomicBool::new(false);

pub fn set_vm_halt(handler: HaltHandler) {
    *VM_HALT.write() = Some(handler);
}

/// `reboot_on_exit` on the command line turns every exit into a reset.
pub fn set_reboot_on_exit() {
    REBOOT_ON_EXIT.store(true, Ordering::Release);
}

pub fn reboot_on_exit() -> bool {
    REBOOT_ON_EXIT.load(Ordering::Acquire)
}

/// Stop this CPU for good.
pub fn machine_halt() -> ! {
    interrupts::disable();
    loop {
        hlt();
    }
}

/// Reset the machine by faulting with no usable IDT.
pub fn triple_fault() -> ! {
    unsafe {
        let empty = DescriptorTablePointer {
            limit: 0,
            base: VirtAddr::new(0),
        };
        x86_64::instructions::tables::lidt(&empty);
        core::arch::asm!("int3", options(noreturn));
    }
}

/// Leave the VM with the given code.
pub fn vm_exit(code: u8) -> ! {
    if reboot_on_exit() {
        triple_fault();
    }
    if let Some(handler) = *VM_HALT.read() {
        handler(code);
    }
    unsafe {
        Port::<u32>::new(QEMU_EXIT_PORT).write(code as u32);
    }
    machine_halt()
}

/// Report an unrecoverable condition and stop the VM.
#[macro_export]
macro_rules! halt {
    ($($arg:tt)*) => {{
        $crate::serial_println!($($arg)*);
        $crate::shutdown::vm_exit(0xFF)
    }};
}
