//! Memory-management calls: new_pages and remove_pages.

use crate::errors::{KernelError, KernelResult};
use crate::interrupts::TrapFrame;
use crate::trap_entry;
use crate::user;
use crate::user::syscalls::{read_user_u32, result_to_ret, validate_read};

trap_entry!(new_pages_entry, new_pages_handler);
trap_entry!(remove_pages_entry, remove_pages_handler);

extern "C" fn new_pages_handler(frame: &mut TrapFrame) {
    frame.eax = result_to_ret(do_new_pages(frame.esi));
}

/// Packet: `{base*, len}`.
fn do_new_pages(packet: u32) -> KernelResult<i32> {
    validate_read(packet, 8)?;
    let base = read_user_u32(packet);
    let len = read_user_u32(packet + 4);
    if (len as i32) <= 0 {
        return Err(KernelError::Invalid);
    }
    let task = user::current_task().ok_or(KernelError::Failure)?;
    task.addr_space.lock().new_pages(base, len)?;
    Ok(0)
}

extern "C" fn remove_pages_handler(frame: &mut TrapFrame) {
    frame.eax = result_to_ret(do_remove_pages(frame.esi));
}

fn do_remove_pages(base: u32) -> KernelResult<i32> {
    let task = user::current_task().ok_or(KernelError::Failure)?;
    task.addr_space.lock().remove_pages(base)?;
    Ok(0)
}
