//! Caps, memory-map conventions and trap vector numbers shared by the
//! loader, the VM layer and the system-call surface.

/// First byte of physical memory handed to user frames. Everything below is
/// kernel memory, covered by the shared direct map.
pub const USER_MEM_START: u32 = 16 * 1024 * 1024;

/// Exclusive top of the initial user stack.
pub const STACK_START: u32 = 0xC000_0000;

/// Bytes of initial user stack mapped at load time.
pub const DEFAULT_STACK_SIZE: u32 = 1024;

/// Every thread owns one kernel stack of this many bytes (two pages).
pub const KERNEL_STACK_SIZE: usize = 2 * 4096;

/// Cap on the length of a program name passed to exec.
pub const EXECNAME_MAX: usize = 255;

/// Cap on the length of a single argv string.
pub const ARGNAME_MAX: usize = 255;

/// Cap on the number of argv entries.
pub const NUM_ARGS_MAX: usize = 16;

/// EFLAGS image for entering ring 3: reserved bit 1 set, IF set, IOPL 0,
/// AC clear.
pub const EFLAGS_USER: u32 = 0x0000_0202;

/// EFLAGS image restored mid-switch, before the thread reaches its `iret`
/// frame: reserved bit only, interrupts still off.
pub const EFLAGS_SUSPENDED: u32 = 0x0000_0002;

// Trap vectors. Hardware IRQs sit at the PIC remap base; system calls get
// their own DPL-3 trap gates above them.
pub const TIMER_VECTOR: u8 = 0x20;
pub const KEYBOARD_VECTOR: u8 = 0x21;

pub const GETTID_VECTOR: u8 = 0x40;
pub const YIELD_VECTOR: u8 = 0x41;
pub const SLEEP_VECTOR: u8 = 0x42;
pub const DESCHEDULE_VECTOR: u8 = 0x43;
pub const MAKE_RUNNABLE_VECTOR: u8 = 0x44;
pub const GET_TICKS_VECTOR: u8 = 0x45;
pub const FORK_VECTOR: u8 = 0x46;
pub const EXEC_VECTOR: u8 = 0x47;
pub const SET_STATUS_VECTOR: u8 = 0x48;
pub const VANISH_VECTOR: u8 = 0x49;
pub const WAIT_VECTOR: u8 = 0x4A;
pub const NEW_PAGES_VECTOR: u8 = 0x4B;
pub const REMOVE_PAGES_VECTOR: u8 = 0x4C;
pub const PRINT_VECTOR: u8 = 0x4D;
pub const READLINE_VECTOR: u8 = 0x4E;
pub const HALT_VECTOR: u8 = 0x4F;
pub const SWEXN_VECTOR: u8 = 0x50;

/// Exit status recorded for a task killed by an unhandled fault.
pub const KILLED_STATUS: i32 = -2;
