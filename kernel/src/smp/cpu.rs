//! Per-processor state.
//!
//! One `CpuInfo` per CPU, indexed by APIC id. The state word is written
//! only by the owning CPU; other CPUs read it when deciding where to
//! steal work from. The thread queue is safe to push and pop from any
//! CPU.

extern crate alloc;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use spin::{Mutex, Once};

use crate::constants::sched::THREAD_QUEUE_SIZE;
use crate::interrupts::x2apic;
use crate::sched::thread::KernelThread;
use crate::sched::Thunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CpuState {
    NotPresent = 0,
    Idle = 1,
    Kernel = 2,
    Interrupt = 3,
    User = 4,
}

impl CpuState {
    fn from_u32(value: u32) -> CpuState {
        match value {
            1 => CpuState::Idle,
            2 => CpuState::Kernel,
            3 => CpuState::Interrupt,
            4 => CpuState::User,
            _ => CpuState::NotPresent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CpuState::NotPresent => "not present",
            CpuState::Idle => "idle",
            CpuState::Kernel => "kernel",
            CpuState::Interrupt => "interrupt",
            CpuState::User => "user",
        }
    }
}

pub struct CpuInfo {
    id: u32,
    state: AtomicU32,
    pub thread_queue: ArrayQueue<Thunk>,
    have_kernel_lock: AtomicBool,
    last_timer_update: AtomicU64,
    current_thread: Mutex<Option<Arc<dyn KernelThread>>>,
}

impl CpuInfo {
    fn new(id: u32) -> CpuInfo {
        CpuInfo {
            id,
            state: AtomicU32::new(CpuState::NotPresent as u32),
            thread_queue: ArrayQueue::new(THREAD_QUEUE_SIZE),
            have_kernel_lock: AtomicBool::new(false),
            last_timer_update: AtomicU64::new(0),
            current_thread: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> CpuState {
        CpuState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: CpuState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn have_kernel_lock(&self) -> bool {
        self.have_kernel_lock.load(Ordering::Acquire)
    }

    pub fn set_have_kernel_lock(&self, held: bool) {
        self.have_kernel_lock.store(held, Ordering::Release);
    }

    pub fn last_timer_update(&self) -> u64 {
        self.last_timer_update.load(Ordering::Acquire)
    }

    pub fn set_last_timer_update(&self, value: u64) {
        self.last_timer_update.store(value, Ordering::Release);
    }

    pub fn set_current_thread(&self, thread: Arc<dyn KernelThread>) {
        *self.current_thread.lock() = Some(thread);
    }

    pub fn clear_current_thread(&self) {
        *self.current_thread.lock() = None;
    }

    pub fn current_thread(&self) -> Option<Arc<dyn KernelThread>> {
        self.current_thread.lock().clone()
    }
}

static CPUS: Once<Vec<CpuInfo>> = Once::new();

/// Size the CPU array; called once when the processor count is known.
pub fn init_cpus(count: usize) {
    CPUS.call_once(|| (0..count as u32).map(CpuInfo::new).collect());
}

pub fn cpu_count() -> usize {
    CPUS.get().map_or(0, Vec::len)
}

pub fn cpuinfo_from_id(id: u32) -> &'static CpuInfo {
    &CPUS.get().expect("cpu array not initialized")[id as usize]
}

/// The calling CPU's info, if the array is up and covers it.
pub fn try_current() -> Option<&'static CpuInfo> {
    CPUS.get()?.get(x2apic::current_core_id() as usize)
}

pub fn current_cpu() -> &'static CpuInfo {
    try_current().expect("cpu array not initialized")
}
