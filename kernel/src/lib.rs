#![no_std]
#![cfg_attr(test, no_main)]
#![feature(abi_x86_interrupt)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

pub mod boot;
pub mod constants;
pub mod devices;
pub mod interrupts;
pub mod logging;
pub mod memory;
pub mod random;
pub mod sched;
pub mod shutdown;
pub mod smp;
pub mod time;

pub use devices::serial;

pub mod prelude {
    pub use crate::halt;
    pub use crate::serial_print;
    pub use crate::serial_println;
}

pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    serial_println!("test result: ok");
    shutdown::vm_exit(0x10)
}

#[cfg(test)]
#[no_mangle]
extern "C" fn _start() -> ! {
    test_main();
    shutdown::machine_halt()
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("[failed]\n{}", info);
    shutdown::vm_exit(0x18)
}
