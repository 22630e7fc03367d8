//! The kernel lock: one global spinlock gating timer service, run-queue
//! consumption, and memory-manager work.

use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::instructions::interrupts;

use crate::smp::cpu::{current_cpu, CpuState};

static KERNEL_LOCK: AtomicBool = AtomicBool::new(false);

fn try_acquire() -> bool {
    KERNEL_LOCK
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
}

/// Take the kernel lock, spinning with interrupts enabled so bottom
/// halves keep flowing, and disabling them again before returning.
/// Only legal with the CPU in kernel state.
pub fn kern_lock() {
    let ci = current_cpu();
    assert_eq!(ci.state(), CpuState::Kernel);

    interrupts::enable();
    while !try_acquire() {
        core::hint::spin_loop();
    }
    ci.set_have_kernel_lock(true);
    interrupts::disable();
}

/// One attempt at the lock. Must not be called from interrupt context:
/// the interrupted code may be the holder.
pub fn kern_try_lock() -> bool {
    let ci = current_cpu();
    assert!(ci.state() != CpuState::Interrupt);
    if !try_acquire() {
        return false;
    }
    ci.set_have_kernel_lock(true);
    true
}

/// Release the lock; caller must be the holding CPU.
pub fn kern_unlock() {
    let ci = current_cpu();
    assert!(ci.state() != CpuState::Interrupt);
    assert!(ci.have_kernel_lock());
    ci.set_have_kernel_lock(false);
    KERNEL_LOCK.store(false, Ordering::Release);
}
