//! Console calls: print and readline.

use alloc::vec;

use crate::console;
use crate::errors::{KernelError, KernelResult};
use crate::interrupts::TrapFrame;
use crate::keyboard;
use crate::trap_entry;
use crate::user::syscalls::{
    copy_from_user, copy_to_user, read_user_u32, result_to_ret, validate_read, validate_write,
};

trap_entry!(print_entry, print_handler);
trap_entry!(readline_entry, readline_handler);

extern "C" fn print_handler(frame: &mut TrapFrame) {
    frame.eax = result_to_ret(do_print(frame.esi));
}

/// Packet: `{len, buf*}`. The bytes are staged through kernel memory so
/// the console lock is never held across a user-space access.
fn do_print(packet: u32) -> KernelResult<i32> {
    validate_read(packet, 8)?;
    let len = read_user_u32(packet) as i32;
    let buf = read_user_u32(packet + 4);
    if len < 0 {
        return Err(KernelError::Invalid);
    }
    validate_read(buf, len as u32)?;
    let mut bytes = vec![0u8; len as usize];
    copy_from_user(buf, &mut bytes);
    console::putbytes(&bytes);
    Ok(0)
}

extern "C" fn readline_handler(frame: &mut TrapFrame) {
    frame.eax = result_to_ret(do_readline(frame.esi));
}

/// Packet: `{len, buf*}`. Blocks until a full line is available, then
/// copies up to `len` bytes of it out.
fn do_readline(packet: u32) -> KernelResult<i32> {
    validate_read(packet, 8)?;
    let len = read_user_u32(packet) as i32;
    let buf = read_user_u32(packet + 4);
    if len < 0 {
        return Err(KernelError::Invalid);
    }
    validate_write(buf, len as u32)?;
    let mut line = vec![0u8; len as usize];
    let n = keyboard::readline(&mut line);
    copy_to_user(buf, &line[..n]);
    Ok(n as i32)
}
