//! x2APIC driver: identification, IPIs, and the platform one-shot
//! timer, calibrated once against the PIT.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use raw_cpuid::CpuId;
use x86_64::instructions::port::Port;
use x86_64::registers::model_specific::Msr;

use crate::constants::ports::{PIT_CHANNEL_0, PIT_COMMAND};
use crate::constants::x2apic::{SPURIOUS_VECTOR, TIMER_VECTOR};
use crate::time;

#[derive(Debug)]
pub enum X2ApicError {
    NotSupported,
    CalibrationFailed,
}

/// Mode the timer is operating in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    TscDeadline,
    Oneshot,
}

// MSR constants
const IA32_APIC_BASE_MSR: u32 = 0x1B;
const IA32_X2APIC_APICID: u32 = 0x802;
const IA32_TSC_DEADLINE: u32 = 0x6E0;
const X2APIC_MSR_BASE: u32 = 0x800;

// Register offsets
const OFFSET_EOI: u32 = 0x0B;
const OFFSET_SVR: u32 = 0x0F;
const OFFSET_ICR: u32 = 0x30;
const OFFSET_LVT_TIMER: u32 = 0x32;
const OFFSET_TIMER_INITIAL_COUNT: u32 = 0x38;
const OFFSET_TIMER_CURRENT_COUNT: u32 = 0x39;
const OFFSET_TIMER_DIVIDE_CONFIG: u32 = 0x3E;

const APIC_BASE_X2APIC_ENABLE: u64 = 1 << 10;
const APIC_BASE_GLOBAL_ENABLE: u64 = 1 << 11;
const TSC_DEADLINE_MODE: u64 = 1 << 18;
const SVR_APIC_ENABLE: u64 = 0x100;

// ICR delivery modes
const ICR_LEVEL_ASSERT: u64 = 1 << 14;
const ICR_DELIVERY_INIT: u64 = 5 << 8;
const ICR_DELIVERY_STARTUP: u64 = 6 << 8;

static APIC_PER_MS: AtomicU64 = AtomicU64::new(0);
static TIMER_MODE: AtomicU8 = AtomicU8::new(0);

fn timer_mode() -> TimerMode {
    if TIMER_MODE.load(Ordering::Acquire) == 1 {
        TimerMode::TscDeadline
    } else {
        TimerMode::Oneshot
    }
}

unsafe fn init_pit_oneshot(count: u16) {
    let mut command_port: Port<u8> = Port::new(PIT_COMMAND);
    let mut data_port: Port<u8> = Port::new(PIT_CHANNEL_0);

    command_port.write(0x30);
    data_port.write(count as u8);
    data_port.write((count >> 8) as u8);
}

unsafe fn wait_pit_complete() {
    let mut command_port: Port<u8> = Port::new(PIT_COMMAND);
    let mut status_port: Port<u8> = Port::new(PIT_CHANNEL_0);

    command_port.write(0xE2);

    loop {
        let status = status_port.read();
        if (status & 0x80) != 0 {
            break;
        }
        core::hint::spin_loop();
    }
}

/// Run the APIC timer and the TSC against the PIT for ~50ms and derive
/// both per-millisecond rates.
unsafe fn calibrate() -> Result<(u64, u64), X2ApicError> {
    const PIT_CALIBRATION_CYCLES: u16 = 59660; // ~50ms at 1.193182 MHz
    const CALIBRATION_MS: u64 = 50;

    Msr::new(X2APIC_MSR_BASE + OFFSET_TIMER_DIVIDE_CONFIG).write(0b1011);
    Msr::new(X2APIC_MSR_BASE + OFFSET_TIMER_INITIAL_COUNT).write(u32::MAX as u64);

    let start_tsc = core::arch::x86_64::_rdtsc();
    init_pit_oneshot(PIT_CALIBRATION_CYCLES);
    wait_pit_complete();
    let end_tsc = core::arch::x86_64::_rdtsc();

    let tsc_diff = end_tsc - start_tsc;
    let apic_counted =
        u32::MAX - Msr::new(X2APIC_MSR_BASE + OFFSET_TIMER_CURRENT_COUNT).read() as u32;
    Msr::new(X2APIC_MSR_BASE + OFFSET_TIMER_INITIAL_COUNT).write(0);

    let tsc_per_ms = tsc_diff / CALIBRATION_MS;
    let apic_per_ms = apic_counted as u64 / CALIBRATION_MS;
    log::debug!("calibrated: {} tsc/ms, {} apic/ms", tsc_per_ms, apic_per_ms);

    if tsc_per_ms == 0 || apic_per_ms == 0 {
        return Err(X2ApicError::CalibrationFailed);
    }
    if tsc_per_ms < 50_000 {
        log::warn!(
            "low TSC rate ({}/ms), running under heavy virtualization",
            tsc_per_ms
        );
    }

    Ok((tsc_per_ms, apic_per_ms))
}

unsafe fn enable_x2apic() -> Result<(), X2ApicError> {
    if !CpuId::new().get_feature_info().map_or(false, |f| f.has_x2apic()) {
        return Err(X2ApicError::NotSupported);
    }
    let mut apic_base = Msr::new(IA32_APIC_BASE_MSR);
    let value = apic_base.read();
    apic_base.write(value | APIC_BASE_GLOBAL_ENABLE | APIC_BASE_X2APIC_ENABLE);
    Msr::new(X2APIC_MSR_BASE + OFFSET_SVR).write(SVR_APIC_ENABLE | SPURIOUS_VECTOR as u64);
    Ok(())
}

unsafe fn setup_lvt_timer() {
    match timer_mode() {
        TimerMode::TscDeadline => {
            Msr::new(X2APIC_MSR_BASE + OFFSET_LVT_TIMER)
                .write(TSC_DEADLINE_MODE | TIMER_VECTOR as u64);
        }
        TimerMode::Oneshot => {
            Msr::new(X2APIC_MSR_BASE + OFFSET_LVT_TIMER).write(TIMER_VECTOR as u64);
            Msr::new(X2APIC_MSR_BASE + OFFSET_TIMER_DIVIDE_CONFIG).write(0b1011);
        }
    }
}

/// Boot-processor bring-up: enable x2APIC mode, calibrate, pick the
/// timer mode, and program the local vector table.
pub fn init_bsp() -> Result<(), X2ApicError> {
    unsafe {
        enable_x2apic()?;
        let (tsc_per_ms, apic_per_ms) = calibrate()?;
        time::init_clock(tsc_per_ms);
        APIC_PER_MS.store(apic_per_ms, Ordering::Release);

        let deadline_capable = CpuId::new()
            .get_feature_info()
            .map_or(false, |f| f.has_tsc_deadline());
        TIMER_MODE.store(deadline_capable as u8, Ordering::Release);
        log::debug!(
            "apic timer mode: {:?}",
            if deadline_capable {
                TimerMode::TscDeadline
            } else {
                TimerMode::Oneshot
            }
        );
        setup_lvt_timer();
    }
    Ok(())
}

/// Application-processor bring-up; inherits the BSP's calibration.
pub fn init_ap() -> Result<(), X2ApicError> {
    unsafe {
        enable_x2apic()?;
        setup_lvt_timer();
    }
    Ok(())
}

pub fn current_core_id() -> u32 {
    unsafe { Msr::new(IA32_X2APIC_APICID).read() as u32 }
}

/// Arm the local one-shot to fire `ns` from now.
pub fn runloop_timer(ns: u64) {
    unsafe {
        match timer_mode() {
            TimerMode::TscDeadline => {
                let ticks = (ns as u128 * time::tsc_per_ms() as u128 / 1_000_000) as u64;
                let deadline = core::arch::x86_64::_rdtsc() + ticks.max(1);
                Msr::new(IA32_TSC_DEADLINE).write(deadline);
            }
            TimerMode::Oneshot => {
                let ticks =
                    (ns as u128 * APIC_PER_MS.load(Ordering::Acquire) as u128 / 1_000_000) as u64;
                let ticks = ticks.clamp(1, u32::MAX as u64);
                Msr::new(X2APIC_MSR_BASE + OFFSET_TIMER_INITIAL_COUNT).write(ticks);
            }
        }
    }
}

pub fn send_eoi() {
    unsafe {
        Msr::new(X2APIC_MSR_BASE + OFFSET_EOI).write(0);
    }
}

/// Fixed-delivery IPI to one CPU.
pub fn send_ipi(apic_id: u32, vector: u8) {
    unsafe {
        Msr::new(X2APIC_MSR_BASE + OFFSET_ICR)
            .write(((apic_id as u64) << 32) | ICR_LEVEL_ASSERT | vector as u64);
    }
}

/// INIT followed by two STARTUPs, the classic AP wake sequence.
///
/// # Safety
/// `start_page` must hold a real-mode trampoline.
pub unsafe fn start_cpu(apic_id: u32, start_page: u64) {
    let mut icr = Msr::new(X2APIC_MSR_BASE + OFFSET_ICR);
    let dest = (apic_id as u64) << 32;
    let vector = (start_page >> 12) & 0xFF;
    icr.write(dest | ICR_DELIVERY_INIT | ICR_LEVEL_ASSERT);
    time::busy_wait_us(10_000);
    icr.write(dest | ICR_DELIVERY_STARTUP | vector);
    time::busy_wait_us(200);
    icr.write(dest | ICR_DELIVERY_STARTUP | vector);
}
