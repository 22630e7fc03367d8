//! Serial-backed `log` facade.
//!
//! Every record is tagged with the CPU that produced it, so the
//! interleaved traces of several run loops stay attributable. This is
//! the runtime replacement for the original compile-time scheduler
//! debug switch: scheduler internals log at trace level and are
//! filtered out of release builds by the level cap.

use log::{LevelFilter, Log, Metadata, Record};

use crate::smp::cpu;

struct KernelLog;

static KERNEL_LOG: KernelLog = KernelLog;

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Until the CPU array exists only the boot processor runs, and
        // it logs without an id.
        match cpu::try_current() {
            Some(ci) => crate::serial_println!(
                "[{} {:02}] {}",
                record.level(),
                ci.id(),
                record.args()
            ),
            None => crate::serial_println!("[{}] {}", record.level(), record.args()),
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger; later calls are no-ops. Debug builds keep
/// scheduler tracing, release builds cap at info.
pub fn init() {
    if log::set_logger(&KERNEL_LOG).is_ok() {
        log::set_max_level(if cfg!(debug_assertions) {
            LevelFilter::Trace
        } else {
            LevelFilter::Info
        });
    }
}
