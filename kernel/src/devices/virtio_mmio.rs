//! Collection point for `virtio_mmio.*` command-line device specs.
//!
//! The transport driver walks this list when it probes; the kernel core
//! only records the specs it was handed.

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

static SPECS: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Record one device spec, e.g. `device=4K@0xd0000000:10`.
pub fn parse(spec: &str) {
    log::debug!("virtio_mmio spec: {}", spec);
    SPECS.lock().push(String::from(spec));
}

/// Hand the accumulated specs to the driver, leaving the list empty.
pub fn take_specs() -> Vec<String> {
    core::mem::take(&mut *SPECS.lock())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn records_and_drains_specs() {
        parse("device=4K@0xd0000000:10");
        let specs = take_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0], "device=4K@0xd0000000:10");
        assert!(take_specs().is_empty());
    }
}
