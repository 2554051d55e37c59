//! In-kernel test runner: tests execute in kernel context during the
//! single-threaded boot phase, report over the debug port, and exit QEMU
//! through the isa-debug-exit device.

use crate::debug_print;
use crate::debug_println;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    unsafe {
        x86::io::outl(0xF4, exit_code as u32);
    }
    loop {
        unsafe { x86::halt() };
    }
}

pub trait Testable {
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        debug_print!("{}...\t", core::any::type_name::<T>());
        self();
        debug_println!("[ok]");
    }
}

pub fn test_runner(tests: &[&dyn Testable]) {
    debug_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    debug_println!("[failed]\n");
    debug_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed);
}
