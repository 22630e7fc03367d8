//! Kernel command-line parsing.
//!
//! Space-delimited tokens. A `virtio_mmio.<spec>` token forwards its
//! suffix to the virtio-mmio spec list; the bare `reboot_on_exit` token
//! flips the exit behavior. Everything else is ignored.

use crate::devices::virtio_mmio;
use crate::shutdown;

pub fn parse(cmdline: &str) {
    for token in cmdline.split(' ') {
        if token.is_empty() {
            continue;
        }
        if let Some(dot) = token.find('.') {
            let (prefix, rest) = token.split_at(dot);
            if prefix == "virtio_mmio" {
                virtio_mmio::parse(&rest[1..]);
            }
        } else if token == "reboot_on_exit" {
            shutdown::set_reboot_on_exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio_mmio::take_specs;

    #[test_case]
    fn forwards_virtio_mmio_and_ignores_unknown() {
        parse("virtio_mmio.device=4K@0xd0000000:10 quiet");
        let specs = take_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0], "device=4K@0xd0000000:10");
    }

    #[test_case]
    fn unknown_prefixes_are_ignored() {
        parse("pci.off console.ttyS0  extra");
        assert!(take_specs().is_empty());
    }
}
