//! The per-CPU run loop.
//!
//! Each pass: pause the outgoing thread, flush TLB work, drain bottom
//! halves without the kernel lock, then (lock permitting) service
//! timers, drain the run queue, run the memory manager, and reprogram
//! the platform timer. After that, pick one thread, stealing from or
//! donating to other CPUs as their idle bits dictate, and run it.
//! With nothing left, park in `wait_for_interrupt`.

use x86_64::instructions::interrupts;

use crate::interrupts::x2apic;
use crate::memory::tlb;
use crate::smp::{self, cpu};
use crate::time::{now, ClockId, Timestamp};

use crate::smp::cpu::{CpuInfo, CpuState};

use super::thread::sched_thread_pause;
use super::{
    bhqueue, idle_cpu_mask, lock, runqueue, shutting_down, timers, Thunk, LAST_TIMER_UPDATE,
    RUNLOOP_TIMER_MAX, RUNLOOP_TIMER_MIN,
};

fn run_thunk(thunk: Thunk, ci: &CpuInfo) {
    log::trace!("run thunk, state {}", ci.state().as_str());
    thunk.apply();
}

/// Clamp a deadline delta into the platform timer's working range.
fn clamp_timeout(delta: i64, min: Timestamp, max: Timestamp) -> Timestamp {
    if delta > min as i64 {
        (delta as Timestamp).min(max)
    } else {
        min
    }
}

/// Reprogram the platform one-shot for the earliest pending deadline.
/// Called with the kernel lock held. Returns whether the timer was
/// touched; an unchanged deadline is left alone so repeated passes
/// converge.
fn update_timer(ci: &CpuInfo) -> bool {
    use core::sync::atomic::Ordering;

    let next = match timers().check() {
        Some(next) => next,
        None => return false,
    };
    let last = LAST_TIMER_UPDATE.load(Ordering::Acquire);
    if last != 0 && next == last {
        return false;
    }
    let delta = next as i64 - now(ClockId::MonotonicRaw) as i64;
    let timeout = clamp_timeout(delta, RUNLOOP_TIMER_MIN, RUNLOOP_TIMER_MAX);
    log::trace!("set platform timer: delta {:#x}, timeout {:#x}", delta, timeout);
    let armed = (next as i128 + timeout as i128 - delta as i128) as u64;
    LAST_TIMER_UPDATE.store(armed, Ordering::Release);
    ci.set_last_timer_update(armed);
    x2apic::runloop_timer(timeout);
    true
}

/// Pull a thread from idle CPUs in `[first, first + count)`, waking any
/// whose queues still hold work. Stealing from an idle CPU is preferred
/// over a busy one: nobody has to be interrupted for it.
fn migrate_to_self(mut thunk: Option<Thunk>, mut first: u32, mut count: u32) -> Option<Thunk> {
    while count > 0 {
        let target = match idle_cpu_mask().first_set_in(first, count) {
            Some(target) => target,
            None => break,
        };
        let other = cpu::cpuinfo_from_id(target);
        if thunk.is_none() {
            thunk = other.thread_queue.pop();
            if thunk.is_some() {
                log::trace!("migrating thread from idle CPU {} to self", target);
            }
        }
        if thunk.is_some() && !other.thread_queue.is_empty() {
            super::wakeup_cpu(target);
        }
        count -= target - first + 1;
        first = target + 1;
    }
    thunk
}

/// Wake idle CPUs in `[first, first + count)` that have queued threads,
/// donating one of ours to each idle CPU with an empty queue.
fn migrate_from_self(ci: &CpuInfo, mut first: u32, mut count: u32) {
    while count > 0 {
        let target = match idle_cpu_mask().first_set_in(first, count) {
            Some(target) => target,
            None => break,
        };
        let other = cpu::cpuinfo_from_id(target);
        if !other.thread_queue.is_empty() {
            super::wakeup_cpu(target);
        } else if let Some(thunk) = ci.thread_queue.pop() {
            log::trace!("migrating thread from self to idle CPU {}", target);
            if let Err(thunk) = other.thread_queue.push(thunk) {
                // Target filled up behind our emptiness check; put the
                // thread back. If our own queue also filled meanwhile,
                // the thread is lost, which must not pass silently.
                if ci.thread_queue.push(thunk).is_err() {
                    log::warn!(
                        "thread queues full on CPU {} and CPU {}, dropping a thread",
                        ci.id(),
                        target
                    );
                }
            }
            super::wakeup_cpu(target);
        }
        count -= target - first + 1;
        first = target + 1;
    }
}

/// Last resort: take a queued thread from a CPU that is busy running
/// another one, searching round-robin from our own id.
fn steal_from_running(ci: &CpuInfo, total: u32) -> Option<Thunk> {
    let mut target = ci.id() + 1;
    loop {
        if target == total {
            target = 0;
        }
        if target == ci.id() {
            return None;
        }
        let other = cpu::cpuinfo_from_id(target);
        if other.state() == CpuState::User {
            if let Some(thunk) = other.thread_queue.pop() {
                log::trace!("migrating thread from CPU {} to self", target);
                return Some(thunk);
            }
        }
        target += 1;
    }
}

fn wait_for_interrupt() {
    interrupts::enable_and_hlt();
    interrupts::disable();
}

/// The run loop proper; never returns.
pub fn runloop() -> ! {
    loop {
        sched_thread_pause();
        interrupts::disable();
        let ci = cpu::current_cpu();
        log::trace!(
            "runloop from {} b:{} r:{} t:{}{}",
            ci.state().as_str(),
            bhqueue().len(),
            runqueue().len(),
            ci.thread_queue.len(),
            if ci.have_kernel_lock() { " locked" } else { "" }
        );
        ci.set_state(CpuState::Kernel);
        // Make sure TLB entries are appropriately flushed before doing
        // any work.
        tlb::flush_pending(ci.id());

        // Bottom halves are for operations outside the realm of the
        // kernel lock, e.g. storage I/O completions.
        while let Some(thunk) = bhqueue().pop() {
            run_thunk(thunk, ci);
        }

        let mut timer_updated = false;
        if lock::kern_try_lock() {
            ci.set_state(CpuState::Kernel);
            timers().service(now(ClockId::MonotonicRaw));

            while let Some(thunk) = runqueue().pop() {
                run_thunk(thunk, ci);
            }

            super::mm_service();
            timer_updated = update_timer(ci);
            lock::kern_unlock();
        }

        if !shutting_down() {
            let total = smp::total_processors();
            let mut thunk = ci.thread_queue.pop();
            if thunk.is_none() {
                // Steal from idle CPUs first (nobody needs waking for
                // that), waking any whose queues still hold threads.
                if ci.id() + 1 < total {
                    thunk = migrate_to_self(thunk, ci.id() + 1, total - ci.id() - 1);
                }
                if ci.id() > 0 {
                    thunk = migrate_to_self(thunk, 0, ci.id());
                }
                if thunk.is_none() {
                    thunk = steal_from_running(ci, total);
                }
            } else {
                // We have work: wake idle CPUs holding threads, and
                // spread ours onto the empty ones.
                if ci.id() + 1 < total {
                    migrate_from_self(ci, ci.id() + 1, total - ci.id() - 1);
                }
                if ci.id() > 0 {
                    migrate_from_self(ci, 0, ci.id());
                }
            }
            if let Some(thunk) = thunk {
                if !timer_updated && total > 1 {
                    // No deadline was armed this pass; bound our share
                    // of the CPU so queued threads elsewhere get a turn.
                    let here = now(ClockId::MonotonicRaw);
                    let remaining = ci.last_timer_update() as i64 - here as i64;
                    if remaining < 0 || remaining as u64 > RUNLOOP_TIMER_MAX {
                        log::trace!("setting CPU scheduler timer");
                        x2apic::runloop_timer(RUNLOOP_TIMER_MAX);
                        ci.set_last_timer_update(here + RUNLOOP_TIMER_MAX);
                    }
                }
                run_thunk(thunk, ci);
            }
        }

        sched_thread_pause();
        let ci = cpu::current_cpu();
        log::trace!("sleep");
        ci.set_state(CpuState::Idle);
        idle_cpu_mask().set(ci.id());
        wait_for_interrupt();
    }
}

/// Park until an interrupt arrives, then fall into the run loop. The
/// AP entry path; also covers spurious hlt wakeups after AP start.
pub fn kernel_sleep() -> ! {
    interrupts::disable();
    let ci = cpu::current_cpu();
    log::trace!("sleep");
    ci.set_state(CpuState::Idle);
    idle_cpu_mask().set(ci.id());
    loop {
        wait_for_interrupt();
        runloop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{microseconds, milliseconds};

    #[test_case]
    fn timeout_clamps_into_the_platform_range() {
        let min = microseconds(1_000);
        let max = microseconds(100_000);
        // Past or imminent deadlines arm the minimum.
        assert_eq!(clamp_timeout(-5, min, max), min);
        assert_eq!(clamp_timeout(min as i64, min, max), min);
        // Mid-range deadlines arm exactly their delta.
        assert_eq!(clamp_timeout(milliseconds(5) as i64, min, max), milliseconds(5));
        // Far deadlines arm the quantum.
        assert_eq!(clamp_timeout(milliseconds(500) as i64, min, max), max);
    }

    #[test_case]
    fn armed_deadline_converges_for_repeat_passes() {
        // With a 1 ms deadline in range, the recorded update equals the
        // deadline itself, so an unchanged heap skips the next arm.
        let next = milliseconds(1);
        let now = milliseconds(0);
        let delta = next as i64 - now as i64;
        let timeout = clamp_timeout(delta, microseconds(1_000), microseconds(100_000));
        let armed = (next as i128 + timeout as i128 - delta as i128) as u64;
        assert_eq!(armed, next);
        // Out-of-range deadline: the armed value records the actual
        // wakeup, min from now.
        let far = milliseconds(500);
        let delta = far as i64 - now as i64;
        let timeout = clamp_timeout(delta, microseconds(1_000), microseconds(100_000));
        let armed = (far as i128 + timeout as i128 - delta as i128) as u64;
        assert_eq!(armed, now + microseconds(100_000));
    }
}
