pub mod serial;
pub mod virtio_mmio;
