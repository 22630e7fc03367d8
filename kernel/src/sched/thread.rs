//! User threads as the scheduler sees them.
//!
//! A thread is a value with a pause hook and a resume thunk; the
//! scheduler queues resume thunks on per-CPU queues and dispatches one
//! per pass. The running thread registers itself so the next pass can
//! pause it.

extern crate alloc;
use alloc::sync::Arc;

use crate::smp::cpu;

pub trait KernelThread: Send + Sync {
    /// Save the thread's user context and make it schedulable again.
    fn pause(&self);
}

/// Mark `thread` as running on the calling CPU.
pub fn set_current_thread(thread: Arc<dyn KernelThread>) {
    cpu::current_cpu().set_current_thread(thread);
}

pub fn clear_current_thread() {
    cpu::current_cpu().clear_current_thread();
}

pub fn current_thread() -> Option<Arc<dyn KernelThread>> {
    cpu::try_current().and_then(|ci| ci.current_thread())
}

/// Pause whatever thread was running here, unless the VM is going down.
pub(crate) fn sched_thread_pause() {
    if super::shutting_down() {
        return;
    }
    if let Some(thread) = current_thread() {
        thread.pause();
    }
}
