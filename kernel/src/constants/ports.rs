//! I/O port definitions.

/// Base I/O port address for the first serial port (COM1).
pub const SERIAL_PORT: u16 = 0x3F8;

/// QEMU isa-debug-exit device.
pub const QEMU_EXIT_PORT: u16 = 0xF4;

/// Programmable interval timer, used once for TSC/APIC calibration.
pub const PIT_CHANNEL_0: u16 = 0x40;
pub const PIT_COMMAND: u16 = 0x43;
