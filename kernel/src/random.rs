//! Hardware random number sourcing.

use core::arch::x86_64::{_rdrand64_step, _rdseed64_step};
use core::sync::atomic::{AtomicBool, Ordering};

use raw_cpuid::CpuId;

use crate::time::{now, ClockId};

static HAVE_RDSEED: AtomicBool = AtomicBool::new(false);
static HAVE_RDRAND: AtomicBool = AtomicBool::new(false);

const HW_SEED_ATTEMPTS: u32 = 128;

/// Probe CPUID for RDSEED and RDRAND support.
pub fn init_hwrand() {
    let cpuid = CpuId::new();
    if cpuid
        .get_extended_feature_info()
        .map_or(false, |f| f.has_rdseed())
    {
        HAVE_RDSEED.store(true, Ordering::Relaxed);
    }
    if cpuid.get_feature_info().map_or(false, |f| f.has_rdrand()) {
        HAVE_RDRAND.store(true, Ordering::Relaxed);
    }
    log::debug!(
        "hwrand: rdseed {} rdrand {}",
        HAVE_RDSEED.load(Ordering::Relaxed),
        HAVE_RDRAND.load(Ordering::Relaxed)
    );
}

fn hw_seed(rdseed: bool) -> Option<u64> {
    for _ in 0..HW_SEED_ATTEMPTS {
        let mut value = 0u64;
        let ok = unsafe {
            if rdseed {
                _rdseed64_step(&mut value)
            } else {
                _rdrand64_step(&mut value)
            }
        };
        if ok == 1 {
            return Some(value);
        }
    }
    None
}

/// Best-effort seed: RDSEED, then RDRAND, then the raw clock.
pub fn random_seed() -> u64 {
    if HAVE_RDSEED.load(Ordering::Relaxed) {
        if let Some(seed) = hw_seed(true) {
            return seed;
        }
    }
    if HAVE_RDRAND.load(Ordering::Relaxed) {
        if let Some(seed) = hw_seed(false) {
            return seed;
        }
    }
    now(ClockId::MonotonicRaw)
}
