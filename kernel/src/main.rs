#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(crate::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

mod console;
mod cpu;
mod errors;
mod interrupts;
mod keyboard;
mod memory;
mod ramdisk;
mod scheduler;
mod sync;
mod testing;
mod user;
mod vm;

use core::panic::PanicInfo;

use multiboot::information::{MemoryManagement, Multiboot, PAddr};

const MULTIBOOT_MAGIC: u32 = 0x1BAD_B002;
const MULTIBOOT_BOOTED_MAGIC: u32 = 0x2BAD_B002;
const MULTIBOOT_FLAGS: u32 = 0x3; // page-aligned modules, memory info

#[repr(C, align(4))]
struct MultibootHeader {
    magic: u32,
    flags: u32,
    checksum: u32,
}

#[used]
#[unsafe(link_section = ".multiboot")]
static MULTIBOOT_HEADER: MultibootHeader = MultibootHeader {
    magic: MULTIBOOT_MAGIC,
    flags: MULTIBOOT_FLAGS,
    checksum: 0u32
        .wrapping_sub(MULTIBOOT_MAGIC)
        .wrapping_sub(MULTIBOOT_FLAGS),
};

const BOOT_STACK_SIZE: usize = 16 * 4096;
static mut BOOT_STACK: [u8; BOOT_STACK_SIZE] = [0; BOOT_STACK_SIZE];

#[unsafe(naked)]
#[unsafe(no_mangle)]
unsafe extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        "mov esp, offset {stack}",
        "add esp, {size}",
        "push ebx", // multiboot info
        "push eax", // multiboot magic
        "call {main}",
        "2: hlt",
        "jmp 2b",
        stack = sym BOOT_STACK,
        size = const BOOT_STACK_SIZE,
        main = sym kernel_main,
    );
}

extern "C" fn kernel_main(magic: u32, mbinfo: u32) -> ! {
    console::clear();
    kernel_log!("booting");

    cpu::init();
    unsafe { memory::init_heap() };
    let total_mem = boot_memory_bound(magic, mbinfo);
    interrupts::init();
    memory::init(total_mem);
    vm::init();
    scheduler::init();
    user::init();
    keyboard::init();
    ramdisk::init(ramdisk::builtin_files());
    kernel_log!(
        "{} MiB total, {} user frames free",
        total_mem / (1024 * 1024),
        memory::free_frame_count()
    );

    #[cfg(test)]
    test_main();

    user::run_first_task("init")
}

struct IdentityMapped;

impl MemoryManagement for IdentityMapped {
    unsafe fn paddr_to_slice(&self, addr: PAddr, length: usize) -> Option<&'static [u8]> {
        // Paging is not enabled yet; physical addresses are usable as-is.
        Some(unsafe { core::slice::from_raw_parts(addr as usize as *const u8, length) })
    }

    unsafe fn allocate(&mut self, _length: usize) -> Option<(PAddr, &mut [u8])> {
        None
    }

    unsafe fn deallocate(&mut self, addr: PAddr) {
        assert_eq!(addr, 0, "no multiboot allocations to free");
    }
}

/// Total physical memory per the multiboot info, with a conservative
/// fallback when the bootloader handed us nothing usable.
fn boot_memory_bound(magic: u32, mbinfo: u32) -> u32 {
    const FALLBACK: u32 = 64 * 1024 * 1024;
    if magic != MULTIBOOT_BOOTED_MAGIC {
        return FALLBACK;
    }
    let mut mapping = IdentityMapped;
    let info = unsafe { Multiboot::from_ptr(mbinfo as PAddr, &mut mapping) };
    match info.and_then(|i| i.upper_memory_bound()) {
        Some(upper_kb) => (1024 + upper_kb).saturating_mul(1024),
        None => FALLBACK,
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // The debug port first: it cannot deadlock on a held console lock.
    debug_println!("panicked: {}", info);
    console::write_fmt(format_args!("panicked: {}\n", info));
    unsafe { x86::irq::disable() };
    loop {
        unsafe { x86::halt() };
    }
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    testing::test_panic_handler(info)
}
