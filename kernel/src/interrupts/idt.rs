//! Interrupt descriptor table and the IPI vector pool.
//!
//! Exception handlers are fixed; a small pool of vectors is handed out
//! at runtime for inter-processor interrupts, each dispatching through
//! a registration table. Every handler runs with the CPU marked
//! `Interrupt` so lock assertions can catch misuse.

use core::sync::atomic::{AtomicU8, Ordering};

use lazy_static::lazy_static;
use spin::RwLock;
use x86_64::instructions::interrupts;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::constants::x2apic::{IPI_VECTOR_BASE, IPI_VECTOR_COUNT, SPURIOUS_VECTOR, TIMER_VECTOR};
use crate::interrupts::x2apic;
use crate::smp::cpu::{self, CpuState};

#[derive(Clone, Copy)]
struct Registration {
    handler: fn(),
    name: &'static str,
}

static IPI_HANDLERS: RwLock<[Option<Registration>; IPI_VECTOR_COUNT as usize]> =
    RwLock::new([None; IPI_VECTOR_COUNT as usize]);

static NEXT_IPI_VECTOR: AtomicU8 = AtomicU8::new(0);

macro_rules! ipi_stub {
    ($name:ident, $slot:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            ipi_dispatch($slot);
        }
    };
}

ipi_stub!(ipi_stub_0, 0);
ipi_stub!(ipi_stub_1, 1);
ipi_stub!(ipi_stub_2, 2);
ipi_stub!(ipi_stub_3, 3);
ipi_stub!(ipi_stub_4, 4);
ipi_stub!(ipi_stub_5, 5);
ipi_stub!(ipi_stub_6, 6);
ipi_stub!(ipi_stub_7, 7);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_handler);
        idt[TIMER_VECTOR].set_handler_fn(timer_interrupt);
        idt[SPURIOUS_VECTOR].set_handler_fn(spurious_interrupt);
        idt[IPI_VECTOR_BASE].set_handler_fn(ipi_stub_0);
        idt[IPI_VECTOR_BASE + 1].set_handler_fn(ipi_stub_1);
        idt[IPI_VECTOR_BASE + 2].set_handler_fn(ipi_stub_2);
        idt[IPI_VECTOR_BASE + 3].set_handler_fn(ipi_stub_3);
        idt[IPI_VECTOR_BASE + 4].set_handler_fn(ipi_stub_4);
        idt[IPI_VECTOR_BASE + 5].set_handler_fn(ipi_stub_5);
        idt[IPI_VECTOR_BASE + 6].set_handler_fn(ipi_stub_6);
        idt[IPI_VECTOR_BASE + 7].set_handler_fn(ipi_stub_7);
        idt
    };
}

pub fn init_idt(_cpu_id: u32) {
    IDT.load();
}

pub fn enable() {
    interrupts::enable();
}

pub fn disable() {
    interrupts::disable();
}

/// Hand out the next free IPI vector.
pub fn allocate_ipi_vector() -> Option<u8> {
    let slot = NEXT_IPI_VECTOR.fetch_add(1, Ordering::Relaxed);
    if slot >= IPI_VECTOR_COUNT {
        return None;
    }
    Some(IPI_VECTOR_BASE + slot)
}

/// Attach `handler` to a vector from the IPI pool.
pub fn register_interrupt(vector: u8, handler: fn(), name: &'static str) {
    assert!((IPI_VECTOR_BASE..IPI_VECTOR_BASE + IPI_VECTOR_COUNT).contains(&vector));
    IPI_HANDLERS.write()[(vector - IPI_VECTOR_BASE) as usize] =
        Some(Registration { handler, name });
    log::debug!("vector {:#x} -> {}", vector, name);
}

/// Run `f` with this CPU accounted as being in interrupt context.
fn in_interrupt_state<F: FnOnce()>(f: F) {
    let previous = cpu::try_current().map(|ci| {
        let state = ci.state();
        ci.set_state(CpuState::Interrupt);
        state
    });
    f();
    if let Some(previous) = previous {
        cpu::current_cpu().set_state(previous);
    }
}

fn ipi_dispatch(slot: usize) {
    in_interrupt_state(|| {
        let registration = IPI_HANDLERS.read()[slot];
        if let Some(registration) = registration {
            log::trace!("ipi: {}", registration.name);
            (registration.handler)();
        }
        x2apic::send_eoi();
    });
}

/// The timer exists to break CPUs out of `hlt`; expiry handling happens
/// in the run loop.
extern "x86-interrupt" fn timer_interrupt(_frame: InterruptStackFrame) {
    in_interrupt_state(|| {
        x2apic::send_eoi();
    });
}

extern "x86-interrupt" fn spurious_interrupt(_frame: InterruptStackFrame) {}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::serial_println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT ({:#x})\n{:#?}",
        error_code, stack_frame
    );
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    panic!(
        "EXCEPTION: PAGE FAULT\nFaulting Address: {:?}\nError Code: {:?}\n{:#?}",
        Cr2::read(),
        error_code,
        stack_frame
    );
}
