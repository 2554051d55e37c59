//! IDT construction and the low-level trap surface.
//!
//! Hardware interrupts get interrupt gates (interrupts masked on entry);
//! system calls get DPL-3 trap gates so user code can raise them and
//! interrupts stay enabled while they run. Every entry stub saves the
//! register file with `pusha` on the current kernel stack in the layout
//! `TrapFrame` describes, which is also the layout context switching and
//! fork splice into.

use core::mem::size_of;

use lazy_static::lazy_static;
use x86::dtables::{DescriptorTablePointer, lidt};
use x86::io::{inb, outb};

use crate::user::constants::*;
use crate::{console, cpu, keyboard, scheduler, user};

/// Register file saved by a trap entry, lowest address first. The `esp`
/// and `ss` slots exist only for traps that crossed from ring 3.
#[repr(C)]
pub struct TrapFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_kernel: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl TrapFrame {
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// Like `TrapFrame`, for exceptions that push an error code.
#[repr(C)]
pub struct FaultFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_kernel: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl FaultFrame {
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// Entry stub for traps without an error code.
#[macro_export]
macro_rules! trap_entry {
    ($name:ident, $handler:path) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "pusha",
                "push esp",
                "call {handler}",
                "add esp, 4",
                "popa",
                "iretd",
                handler = sym $handler,
            );
        }
    };
}

/// Entry stub for exceptions that push an error code.
#[macro_export]
macro_rules! fault_entry {
    ($name:ident, $handler:path) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "pusha",
                "push esp",
                "call {handler}",
                "add esp, 4",
                "popa",
                "add esp, 4",
                "iretd",
                handler = sym $handler,
            );
        }
    };
}

/// Shared trap epilogue. Freshly crafted kernel stacks end with a return
/// into this, so first entry into a thread and a normal trap return are
/// the same path.
#[unsafe(naked)]
pub unsafe extern "C" fn trap_return() {
    core::arch::naked_asm!("popa", "iretd");
}

/// Run a closure with interrupts disabled, restoring the previous state
/// afterwards.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let flags: u32;
    unsafe { core::arch::asm!("pushfd", "pop {}", out(reg) flags) };
    let was_enabled = flags & 0x200 != 0;
    unsafe { x86::irq::disable() };
    let result = f();
    if was_enabled {
        unsafe { x86::irq::enable() };
    }
    result
}

#[derive(Clone, Copy)]
#[repr(C)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    attrs: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> IdtEntry {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            zero: 0,
            attrs: 0,
            offset_high: 0,
        }
    }

    fn gate(handler: unsafe extern "C" fn(), attrs: u8) -> IdtEntry {
        let offset = handler as usize as u32;
        IdtEntry {
            offset_low: offset as u16,
            selector: cpu::KERNEL_CODE_SELECTOR.bits(),
            zero: 0,
            attrs,
            offset_high: (offset >> 16) as u16,
        }
    }

    /// Interrupts masked on entry, kernel only.
    fn interrupt_gate(handler: unsafe extern "C" fn()) -> IdtEntry {
        IdtEntry::gate(handler, 0x8E)
    }

    /// Interrupts stay enabled, kernel only. Used for faults the kernel
    /// itself may take and service at length.
    fn trap_gate(handler: unsafe extern "C" fn()) -> IdtEntry {
        IdtEntry::gate(handler, 0x8F)
    }

    /// Trap gate reachable from ring 3: the system-call flavor.
    fn trap_gate_user(handler: unsafe extern "C" fn()) -> IdtEntry {
        IdtEntry::gate(handler, 0xEF)
    }
}

lazy_static! {
    static ref IDT: [IdtEntry; 256] = {
        let mut idt = [IdtEntry::missing(); 256];

        idt[0] = IdtEntry::trap_gate(divide_error_entry);
        idt[6] = IdtEntry::trap_gate(invalid_opcode_entry);
        idt[8] = IdtEntry::interrupt_gate(double_fault_entry);
        idt[13] = IdtEntry::interrupt_gate(general_protection_entry);
        idt[14] = IdtEntry::trap_gate(page_fault_entry);

        idt[TIMER_VECTOR as usize] = IdtEntry::interrupt_gate(timer_entry);
        idt[KEYBOARD_VECTOR as usize] = IdtEntry::interrupt_gate(keyboard_entry);

        for (vector, entry) in user::syscalls::gate_table() {
            idt[vector as usize] = IdtEntry::trap_gate_user(entry);
        }

        idt
    };
}

pub fn init() {
    let pointer = DescriptorTablePointer {
        limit: (size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: IDT.as_ptr(),
    };
    unsafe { lidt(&pointer) };
    init_pics();
    init_pit();
}

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// Remap the cascaded 8259s above the exception range and mask everything
/// but the timer and the keyboard.
fn init_pics() {
    unsafe {
        outb(PIC1_CMD, 0x11);
        outb(PIC2_CMD, 0x11);
        outb(PIC1_DATA, TIMER_VECTOR);
        outb(PIC2_DATA, TIMER_VECTOR + 8);
        outb(PIC1_DATA, 4);
        outb(PIC2_DATA, 2);
        outb(PIC1_DATA, 1);
        outb(PIC2_DATA, 1);
        outb(PIC1_DATA, 0xFC);
        outb(PIC2_DATA, 0xFF);
    }
}

pub fn end_of_interrupt(irq: u8) {
    unsafe {
        if irq >= 8 {
            outb(PIC2_CMD, 0x20);
        }
        outb(PIC1_CMD, 0x20);
    }
}

const PIT_BASE_HZ: u32 = 1_193_182;
pub const TIMER_HZ: u32 = 100;

/// PIT channel 0, square wave, 10 ms period.
fn init_pit() {
    let divisor = PIT_BASE_HZ / TIMER_HZ;
    unsafe {
        outb(0x43, 0x36);
        outb(0x40, divisor as u8);
        outb(0x40, (divisor >> 8) as u8);
    }
}

trap_entry!(timer_entry, timer_handler);
trap_entry!(keyboard_entry, keyboard_handler);
trap_entry!(divide_error_entry, divide_error_handler);
trap_entry!(invalid_opcode_entry, invalid_opcode_handler);
fault_entry!(double_fault_entry, double_fault_handler);
fault_entry!(general_protection_entry, general_protection_handler);
fault_entry!(page_fault_entry, page_fault_handler);

extern "C" fn timer_handler(_frame: &mut TrapFrame) {
    scheduler::timer_tick();
    end_of_interrupt(0);
    scheduler::preempt();
}

extern "C" fn keyboard_handler(_frame: &mut TrapFrame) {
    let scancode = unsafe { inb(0x60) };
    keyboard::enqueue_scancode(scancode);
    end_of_interrupt(1);
    keyboard::notify_input();
}

extern "C" fn divide_error_handler(frame: &mut TrapFrame) {
    if frame.from_user() {
        console::putbytes(b"Divide error\n");
        user::kill_current(KILLED_STATUS);
    }
    panic!("kernel divide error at {:#010x}", frame.eip);
}

extern "C" fn invalid_opcode_handler(frame: &mut TrapFrame) {
    if frame.from_user() {
        console::putbytes(b"Invalid opcode\n");
        user::kill_current(KILLED_STATUS);
    }
    panic!("kernel invalid opcode at {:#010x}", frame.eip);
}

extern "C" fn double_fault_handler(frame: &mut FaultFrame) {
    panic!("double fault, eip {:#010x}", frame.eip);
}

extern "C" fn general_protection_handler(frame: &mut FaultFrame) {
    if frame.from_user() {
        console::putbytes(b"General protection fault\n");
        user::kill_current(KILLED_STATUS);
    }
    panic!(
        "kernel protection fault, error {:#x}, eip {:#010x}",
        frame.error_code, frame.eip
    );
}

/// Page-fault policy: copy-on-write resolution first, then the task's
/// registered user fault handler, then death.
extern "C" fn page_fault_handler(frame: &mut FaultFrame) {
    let addr = unsafe { x86::controlregs::cr2() } as u32;
    let is_write = frame.error_code & 0x2 != 0;

    if is_write {
        if let Some(task) = user::current_task() {
            let resolved = {
                let mut space = task.addr_space.lock();
                if space.is_cow(addr) {
                    Some(space.resolve_cow(addr))
                } else {
                    None
                }
            };
            drop(task);
            match resolved {
                Some(Ok(())) => return,
                Some(Err(_)) => {
                    // Frame pool exhausted mid-copy: fatal for this task.
                    console::putbytes(b"Out of memory\n");
                    user::kill_current(KILLED_STATUS);
                }
                None => {}
            }
        }
    }

    if frame.from_user() {
        if user::syscalls::deliver_fault(frame, addr) {
            return;
        }
        console::putbytes(b"Segmentation fault\n");
        user::kill_current(KILLED_STATUS);
    }

    panic!(
        "kernel page fault at {:#010x}, error {:#x}, eip {:#010x}",
        addr, frame.error_code, frame.eip
    );
}
