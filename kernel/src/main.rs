#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(skiff::test_runner)]
#![reexport_test_harness_main = "test_main"]

use skiff::memory::KernelHeaps;
use skiff::{boot, interrupts, memory, sched, serial_println, shutdown, smp};

/// Entry from the loader: `rdi` carries the staged handoff pointer (or
/// zero), `rsi` the boot-parameter block for the direct path.
#[no_mangle]
unsafe extern "sysv64" fn _start(rdi: u64, rsi: u64) -> ! {
    #[cfg(test)]
    test_main();

    boot::set_runtime_init(kernel_runtime_init);
    boot::init_service(rdi, rsi)
}

/// Runs on the permanent stack with heaps in place: bring up the
/// platform timer, the scheduler, and the secondary cores, release
/// loader memory, and hand the CPU to the run loop.
fn kernel_runtime_init(kh: &'static KernelHeaps) -> ! {
    interrupts::init_bsp();
    sched::init_scheduler();

    memory::with_kernel_image(|va, length| {
        log::debug!("kernel image mapped at {:#x}, {} bytes", va, length);
    });

    smp::start_secondary_cores(kh);
    memory::reclaim_regions();

    log::info!(
        "{} of {} processors online, entering run loop",
        smp::total_processors(),
        smp::present_processors()
    );
    sched::runloop::runloop()
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Kernel panic: {}", info);
    shutdown::machine_halt()
}
