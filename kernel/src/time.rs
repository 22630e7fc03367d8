//! TSC-driven kernel clocks.
//!
//! All timestamps are nanoseconds. The TSC rate comes from the one-time
//! PIT calibration done while the APIC is brought up; until then the
//! clocks read zero.

use core::sync::atomic::{AtomicU64, Ordering};

pub type Timestamp = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockId {
    MonotonicRaw,
    Monotonic,
}

static BOOT_TSC: AtomicU64 = AtomicU64::new(0);
static TSC_PER_MS: AtomicU64 = AtomicU64::new(0);

pub const fn microseconds(us: u64) -> Timestamp {
    us * 1_000
}

pub const fn milliseconds(ms: u64) -> Timestamp {
    ms * 1_000_000
}

pub const fn seconds(s: u64) -> Timestamp {
    s * 1_000_000_000
}

/// Record the calibrated TSC rate and the epoch all clocks count from.
pub fn init_clock(tsc_per_ms: u64) {
    TSC_PER_MS.store(tsc_per_ms, Ordering::Release);
    BOOT_TSC.store(rdtsc(), Ordering::Release);
}

pub fn tsc_per_ms() -> u64 {
    TSC_PER_MS.load(Ordering::Acquire)
}

#[inline]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Current time in the given clock domain. Both monotonic domains are
/// served by the invariant TSC; they diverge only once an external time
/// source starts steering `Monotonic`.
pub fn now(_id: ClockId) -> Timestamp {
    let rate = TSC_PER_MS.load(Ordering::Acquire);
    if rate == 0 {
        return 0;
    }
    let ticks = rdtsc().wrapping_sub(BOOT_TSC.load(Ordering::Acquire));
    ((ticks as u128 * 1_000_000) / rate as u128) as u64
}

/// Spin for the given number of microseconds.
pub fn busy_wait_us(us: u64) {
    let rate = TSC_PER_MS.load(Ordering::Acquire);
    if rate == 0 {
        // Uncalibrated; guess at a few cycles per nanosecond.
        for _ in 0..us * 1_000 {
            core::hint::spin_loop();
        }
        return;
    }
    let end = rdtsc() + us * rate / 1_000;
    while rdtsc() < end {
        core::hint::spin_loop();
    }
}
