//! Interrupt vector assignments.

/// Vector the platform one-shot timer fires on.
pub const TIMER_VECTOR: u8 = 0x20;

/// First vector of the pool handed out for inter-processor interrupts.
pub const IPI_VECTOR_BASE: u8 = 0xF0;
pub const IPI_VECTOR_COUNT: u8 = 8;

pub const SPURIOUS_VECTOR: u8 = 0xFF;
