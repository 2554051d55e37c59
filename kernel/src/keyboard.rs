//! Scancode queue and line discipline behind the readline system call.
//!
//! The interrupt handler only queues raw scancodes and pokes the condition
//! variable; decoding, echo and line assembly happen in the reader's
//! context under the input mutex.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;
use pc_keyboard::{DecodedKey, HandleControl, Keyboard, ScancodeSet1, layouts};

use crate::console;
use crate::sync::{Condvar, Mutex};

const SCANCODE_QUEUE_SIZE: usize = 1024;
const LINE_MAX: usize = 1024;

static SCANCODES: OnceCell<ArrayQueue<u8>> = OnceCell::uninit();
static INPUT: OnceCell<Mutex<InputState>> = OnceCell::uninit();
static LINE_READY: Condvar = Condvar::new();

struct InputState {
    decoder: Keyboard<layouts::Us104Key, ScancodeSet1>,
    current: Vec<u8>,
    complete: VecDeque<u8>,
}

pub fn init() {
    let _ = SCANCODES.try_init_once(|| ArrayQueue::new(SCANCODE_QUEUE_SIZE));
    let _ = INPUT.try_init_once(|| {
        Mutex::new(InputState {
            decoder: Keyboard::new(ScancodeSet1::new(), layouts::Us104Key, HandleControl::Ignore),
            current: Vec::new(),
            complete: VecDeque::new(),
        })
    });
}

/// Queue a raw scancode from the interrupt handler. A full queue drops the
/// scancode rather than blocking.
pub fn enqueue_scancode(scancode: u8) {
    if let Some(queue) = SCANCODES.get() {
        let _ = queue.push(scancode);
    }
}

/// Wake any thread blocked in readline. Called from the interrupt handler
/// after the PIC ack.
pub fn notify_input() {
    LINE_READY.notify_one();
}

/// Block until a full input line is available, then copy up to
/// `buf.len()` bytes of it (newline included). Anything not copied stays
/// buffered for the next call.
pub fn readline(buf: &mut [u8]) -> usize {
    let mut input = INPUT.get().expect("keyboard not initialised").lock();
    loop {
        drain_scancodes(&mut input);
        if let Some(newline) = input.complete.iter().position(|b| *b == b'\n') {
            let take = (newline + 1).min(buf.len());
            for slot in buf[..take].iter_mut() {
                *slot = input.complete.pop_front().expect("line shorter than scanned");
            }
            return take;
        }
        input = LINE_READY.wait(input);
    }
}

fn drain_scancodes(input: &mut InputState) {
    let queue = SCANCODES.get().expect("keyboard not initialised");
    while let Some(scancode) = queue.pop() {
        if let Ok(Some(event)) = input.decoder.add_byte(scancode) {
            if let Some(DecodedKey::Unicode(c)) = input.decoder.process_keyevent(event) {
                handle_char(input, c);
            }
        }
    }
}

fn handle_char(input: &mut InputState, c: char) {
    match c {
        '\x08' => {
            if input.current.pop().is_some() {
                console::putbytes(b"\x08");
            }
        }
        '\n' | '\r' => {
            input.current.push(b'\n');
            console::putbytes(b"\n");
            let line: Vec<u8> = input.current.drain(..).collect();
            input.complete.extend(line);
        }
        c if c.is_ascii() && !c.is_control() => {
            if input.current.len() < LINE_MAX - 1 {
                input.current.push(c as u8);
                console::putbytes(&[c as u8]);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn scancodes_assemble_into_lines() {
        init();
        // 'a', 'b', backspace, 'c', enter (scancode set 1 make codes)
        for scancode in [0x1E, 0x30, 0x0E, 0x2E, 0x1C] {
            enqueue_scancode(scancode);
        }
        let mut buf = [0u8; 16];
        let n = readline(&mut buf);
        assert_eq!(&buf[..n], b"ac\n");
    }

    #[test_case]
    fn short_buffer_leaves_the_rest() {
        init();
        for scancode in [0x1E, 0x30, 0x2E, 0x1C] {
            enqueue_scancode(scancode);
        }
        let mut buf = [0u8; 2];
        assert_eq!(readline(&mut buf), 2);
        assert_eq!(&buf, b"ab");
        let mut rest = [0u8; 8];
        let n = readline(&mut rest);
        assert_eq!(&rest[..n], b"c\n");
    }
}
