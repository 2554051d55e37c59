//! System-call trap gates and the calls small enough to live here.
//!
//! Every call takes a single value in `%esi`: either a scalar or a pointer
//! to an argument packet. Handlers validate every user pointer against the
//! current address space before dereferencing it, and results travel back
//! in the saved `eax` slot that the trap epilogue pops.

pub mod console_io;
pub mod lifecycle;
pub mod memory;

use alloc::string::String;
use alloc::vec::Vec;
use core::mem::size_of;

use crate::errors::{KernelError, KernelResult};
use crate::interrupts::{FaultFrame, TrapFrame, without_interrupts};
use crate::scheduler;
use crate::user::constants::*;
use crate::user::{self, FaultHandler};
use crate::{console, cpu, trap_entry};

/// Gate assignments for the IDT: every system call is a DPL-3 trap gate.
pub fn gate_table() -> [(u8, unsafe extern "C" fn()); 17] {
    [
        (GETTID_VECTOR, gettid_entry as unsafe extern "C" fn()),
        (YIELD_VECTOR, yield_entry),
        (SLEEP_VECTOR, sleep_entry),
        (DESCHEDULE_VECTOR, deschedule_entry),
        (MAKE_RUNNABLE_VECTOR, make_runnable_entry),
        (GET_TICKS_VECTOR, get_ticks_entry),
        (FORK_VECTOR, lifecycle::fork_entry),
        (EXEC_VECTOR, lifecycle::exec_entry),
        (SET_STATUS_VECTOR, lifecycle::set_status_entry),
        (VANISH_VECTOR, lifecycle::vanish_entry),
        (WAIT_VECTOR, lifecycle::wait_entry),
        (NEW_PAGES_VECTOR, memory::new_pages_entry),
        (REMOVE_PAGES_VECTOR, memory::remove_pages_entry),
        (PRINT_VECTOR, console_io::print_entry),
        (READLINE_VECTOR, console_io::readline_entry),
        (HALT_VECTOR, halt_entry),
        (SWEXN_VECTOR, swexn_entry),
    ]
}

pub fn result_to_ret(result: KernelResult<i32>) -> u32 {
    match result {
        Ok(v) => v as u32,
        Err(err) => err.code() as u32,
    }
}

/// Every page of `[addr, addr + len)` must be mapped user-readable in the
/// current task.
pub fn validate_read(addr: u32, len: u32) -> KernelResult<()> {
    let task = user::current_task().ok_or(KernelError::Failure)?;
    if task.addr_space.lock().range_mapped_user(addr, len) {
        Ok(())
    } else {
        Err(KernelError::Invalid)
    }
}

/// Like validate_read, but the pages must be writable (copy-on-write
/// counts: the write-protect fault path materialises the private copy).
pub fn validate_write(addr: u32, len: u32) -> KernelResult<()> {
    let task = user::current_task().ok_or(KernelError::Failure)?;
    if task.addr_space.lock().range_writable_user(addr, len) {
        Ok(())
    } else {
        Err(KernelError::Invalid)
    }
}

/// Read a word through the current mapping. Caller has validated.
pub fn read_user_u32(addr: u32) -> u32 {
    unsafe { (addr as *const u32).read_unaligned() }
}

pub fn copy_from_user(addr: u32, buf: &mut [u8]) {
    unsafe { core::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
}

pub fn copy_to_user(addr: u32, bytes: &[u8]) {
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
}

/// Copy a NUL-terminated user string of at most `cap` bytes into kernel
/// memory, validating page by page.
pub fn copy_user_cstr(addr: u32, cap: usize) -> KernelResult<String> {
    let mut bytes = Vec::new();
    for i in 0..=cap {
        let p = addr.checked_add(i as u32).ok_or(KernelError::Invalid)?;
        validate_read(p, 1)?;
        let byte = unsafe { (p as *const u8).read() };
        if byte == 0 {
            return String::from_utf8(bytes).map_err(|_| KernelError::Invalid);
        }
        bytes.push(byte);
    }
    Err(KernelError::Invalid)
}

trap_entry!(gettid_entry, gettid_handler);
trap_entry!(yield_entry, yield_handler);
trap_entry!(sleep_entry, sleep_handler);
trap_entry!(deschedule_entry, deschedule_handler);
trap_entry!(make_runnable_entry, make_runnable_handler);
trap_entry!(get_ticks_entry, get_ticks_handler);
trap_entry!(halt_entry, halt_handler);
trap_entry!(swexn_entry, swexn_handler);

extern "C" fn gettid_handler(frame: &mut TrapFrame) {
    frame.eax = scheduler::current_tid();
}

extern "C" fn yield_handler(frame: &mut TrapFrame) {
    frame.eax = result_to_ret(scheduler::yield_to(frame.esi as i32).map(|_| 0));
}

extern "C" fn sleep_handler(frame: &mut TrapFrame) {
    frame.eax = result_to_ret(scheduler::sleep(frame.esi as i32).map(|_| 0));
}

extern "C" fn deschedule_handler(frame: &mut TrapFrame) {
    frame.eax = result_to_ret(do_deschedule(frame.esi));
}

/// Atomically re-check the reject word and block. A nonzero reject means
/// someone already made us runnable-to-be: return without blocking.
fn do_deschedule(reject_ptr: u32) -> KernelResult<i32> {
    validate_read(reject_ptr, 4)?;
    without_interrupts(|| {
        let reject = unsafe { (reject_ptr as *const i32).read_volatile() };
        if reject == 0 {
            scheduler::deschedule_current();
        }
        Ok(0)
    })
}

extern "C" fn make_runnable_handler(frame: &mut TrapFrame) {
    frame.eax = result_to_ret(scheduler::make_runnable(frame.esi as i32).map(|_| 0));
}

extern "C" fn get_ticks_handler(frame: &mut TrapFrame) {
    frame.eax = scheduler::ticks();
}

extern "C" fn halt_handler(_frame: &mut TrapFrame) {
    crate::kernel_log!("halt requested by tid {}", scheduler::current_tid());
    console::putbytes(b"System halted.\n");
    unsafe { x86::irq::disable() };
    loop {
        unsafe { x86::halt() };
    }
}

/// Register snapshot delivered to a user fault handler, and accepted back
/// from swexn when a handler asks to resume an interrupted context.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UReg {
    pub cause: u32,
    pub cr2: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub zero: u32,
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

/// EFLAGS bits a user context may choose freely.
const EFLAGS_USER_MODIFIABLE: u32 = 0x0CD5;

fn sanitize_eflags(eflags: u32) -> u32 {
    (eflags & EFLAGS_USER_MODIFIABLE) | EFLAGS_USER
}

extern "C" fn swexn_handler(frame: &mut TrapFrame) {
    frame.eax = result_to_ret(do_swexn(frame.esi, frame));
}

/// Packet: `{esp3, eip, arg, ureg*}`. A zero esp3 or eip deregisters; a
/// non-null ureg adopts that context on return.
fn do_swexn(packet: u32, frame: &mut TrapFrame) -> KernelResult<i32> {
    validate_read(packet, 16)?;
    let esp3 = read_user_u32(packet);
    let eip = read_user_u32(packet + 4);
    let arg = read_user_u32(packet + 8);
    let newureg = read_user_u32(packet + 12);

    let task = user::current_task().ok_or(KernelError::Failure)?;
    if esp3 == 0 || eip == 0 {
        *task.fault_handler.lock() = None;
    } else {
        validate_read(eip, 1)?;
        let stack_probe = esp3.checked_sub(4).ok_or(KernelError::Invalid)?;
        validate_write(stack_probe, 4)?;
        *task.fault_handler.lock() = Some(FaultHandler { esp3, eip, arg });
    }

    if newureg != 0 {
        validate_read(newureg, size_of::<UReg>() as u32)?;
        let ureg = unsafe { (newureg as *const UReg).read_unaligned() };
        frame.edi = ureg.edi;
        frame.esi = ureg.esi;
        frame.ebp = ureg.ebp;
        frame.ebx = ureg.ebx;
        frame.edx = ureg.edx;
        frame.ecx = ureg.ecx;
        frame.eax = ureg.eax;
        frame.eip = ureg.eip;
        frame.cs = cpu::USER_CODE_SELECTOR.bits() as u32;
        frame.eflags = sanitize_eflags(ureg.eflags);
        frame.esp = ureg.esp;
        frame.ss = cpu::USER_DATA_SELECTOR.bits() as u32;
    }
    Ok(0)
}

/// Hand a faulting user thread to its registered handler, if any. The
/// registration is one-shot: it is consumed here, and the handler must
/// re-register via swexn if it wants another delivery.
pub fn deliver_fault(frame: &mut FaultFrame, fault_addr: u32) -> bool {
    let Some(task) = user::current_task() else {
        return false;
    };
    let Some(handler) = task.fault_handler.lock().take() else {
        return false;
    };

    let ureg = UReg {
        cause: 14,
        cr2: fault_addr,
        ds: cpu::USER_DATA_SELECTOR.bits() as u32,
        es: cpu::USER_DATA_SELECTOR.bits() as u32,
        fs: cpu::USER_DATA_SELECTOR.bits() as u32,
        gs: cpu::USER_DATA_SELECTOR.bits() as u32,
        edi: frame.edi,
        esi: frame.esi,
        ebp: frame.ebp,
        zero: 0,
        ebx: frame.ebx,
        edx: frame.edx,
        ecx: frame.ecx,
        eax: frame.eax,
        error_code: frame.error_code,
        eip: frame.eip,
        cs: frame.cs,
        eflags: frame.eflags,
        esp: frame.esp,
        ss: frame.ss,
    };

    let ureg_addr = handler
        .esp3
        .wrapping_sub(size_of::<UReg>() as u32)
        & !3;
    let args_addr = ureg_addr.wrapping_sub(12);
    let span = handler.esp3.wrapping_sub(args_addr);
    let writable = task
        .addr_space
        .lock()
        .range_writable_user(args_addr, span);
    if !writable {
        return false;
    }
    drop(task);

    unsafe {
        (ureg_addr as *mut UReg).write_unaligned(ureg);
        (args_addr as *mut u32).write_unaligned(0);
        ((args_addr + 4) as *mut u32).write_unaligned(handler.arg);
        ((args_addr + 8) as *mut u32).write_unaligned(ureg_addr);
    }

    frame.eip = handler.eip;
    frame.esp = args_addr;
    frame.eflags = sanitize_eflags(frame.eflags);
    true
}
