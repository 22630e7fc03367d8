//! The boot console, a 16550 UART on COM1.
//!
//! Everything user-visible funnels through here: log records, panic
//! reports, and the `halt!` diagnostics. One lock serializes all of
//! them so interleaved run loops stay readable.

use core::fmt::{self, Write};

use spin::{Lazy, Mutex};
use uart_16550::SerialPort;

use crate::constants::ports::SERIAL_PORT;

pub struct Console {
    port: Mutex<SerialPort>,
}

impl Console {
    fn write(&self, args: fmt::Arguments) {
        // A UART write cannot fail; swallowing the result keeps the
        // halt path from recursing into panic.
        let _ = self.port.lock().write_fmt(args);
    }
}

static CONSOLE: Lazy<Console> = Lazy::new(|| {
    let mut port = unsafe { SerialPort::new(SERIAL_PORT) };
    port.init();
    Console {
        port: Mutex::new(port),
    }
});

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    CONSOLE.write(args);
}

/// Print to the boot console.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Print a line to the boot console.
#[macro_export]
macro_rules! serial_println {
    () => {
        $crate::serial::_print(format_args!("\n"))
    };
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}
