//! Tasks and the thread factory: task records, the tid → thread index,
//! kernel-stack crafting for first entry into user mode, and the program
//! loader.

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use alloc::collections::btree_map::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use spin::RwLock;

use crate::errors::{KernelError, KernelResult};
use crate::interrupts::{self, TrapFrame};
use crate::scheduler::{self, KERNEL_STACK_WORDS, Status, Thread, ThreadRef};
use crate::sync::{Condvar, Mutex};
use crate::vm::AddressSpace;
use crate::{cpu, ramdisk, vm};

pub mod constants;
pub mod elf;
pub mod syscalls;

use self::constants::*;

pub struct Children {
    pub alive: Vec<TaskRef>,
    pub dead: Vec<TaskRef>,
}

pub struct FaultHandler {
    pub esp3: u32,
    pub eip: u32,
    pub arg: u32,
}

/// The protection domain a group of threads runs in.
///
/// Parent links are weak: the parent's record may be reaped while a child
/// still holds the link, so every use revalidates under the appropriate
/// lock. Children hold strong references, released by wait.
pub struct Task {
    pub id: u32,
    pub addr_space: spin::Mutex<AddressSpace>,
    /// Cached physical base of the page directory, readable without the
    /// address-space lock. Context switch loads this; exec rewrites it.
    pd_base: AtomicU32,
    pub parent: RwLock<Weak<Task>>,
    pub children: Mutex<Children>,
    pub exit_cv: Condvar,
    pub threads: Mutex<Vec<ThreadRef>>,
    pub vanish_lock: Mutex<()>,
    pub exit_status: AtomicI32,
    pub fault_handler: spin::Mutex<Option<FaultHandler>>,
}

pub type TaskRef = Arc<Task>;

impl Task {
    pub fn pd_base(&self) -> u32 {
        self.pd_base.load(Ordering::Relaxed)
    }

    /// Swap in a fresh address space (exec), returning the old one so the
    /// caller can drop it after the CPU has moved off its tables.
    pub fn replace_address_space(&self, new: AddressSpace) -> AddressSpace {
        let mut space = self.addr_space.lock();
        self.pd_base.store(new.pd_base(), Ordering::Relaxed);
        core::mem::replace(&mut *space, new)
    }
}

static THREADS: OnceCell<RwLock<BTreeMap<u32, ThreadRef>>> = OnceCell::uninit();
static INIT_TASK: OnceCell<TaskRef> = OnceCell::uninit();

pub fn init() {
    THREADS.init_once(|| RwLock::new(BTreeMap::new()));
}

fn thread_index() -> &'static RwLock<BTreeMap<u32, ThreadRef>> {
    THREADS.get().expect("thread index not initialised")
}

/// The tid → thread map. Never touched from interrupt context or with
/// interrupts disabled: the map allocates, and the heap lock must not be
/// spun on from an uninterruptible section.
pub fn lookup_thread(tid: u32) -> Option<ThreadRef> {
    thread_index().read().get(&tid).cloned()
}

fn index_thread(thread: ThreadRef) {
    let tid = scheduler::with_thread(&thread, |t| t.tid);
    thread_index().write().insert(tid, thread);
}

pub fn unindex_thread(tid: u32) {
    thread_index().write().remove(&tid);
}

pub fn init_task() -> TaskRef {
    INIT_TASK.get().expect("init task not created").clone()
}

pub fn current_task() -> Option<TaskRef> {
    scheduler::current_thread().and_then(|t| scheduler::with_thread(&t, |t| t.task.upgrade()))
}

/// Allocate a task record around `space` together with its first thread.
/// The task's id is its first thread's tid. The thread is RUNNABLE but not
/// queued; the caller crafts its kernel stack first.
pub fn create_task(parent: Option<&TaskRef>, space: AddressSpace) -> (TaskRef, ThreadRef) {
    scheduler::reap_dead_threads();
    // Until it is queued or indexed, the new thread is invisible to the
    // scheduler and its lock is uncontended.
    let thread = Arc::new(spin::Mutex::new(Thread::new(Weak::new(), false)));
    let tid = thread.lock().tid;
    let task = Arc::new(Task {
        id: tid,
        pd_base: AtomicU32::new(space.pd_base()),
        addr_space: spin::Mutex::new(space),
        parent: RwLock::new(parent.map(Arc::downgrade).unwrap_or_default()),
        children: Mutex::new(Children {
            alive: Vec::new(),
            dead: Vec::new(),
        }),
        exit_cv: Condvar::new(),
        threads: Mutex::new(vec![thread.clone()]),
        vanish_lock: Mutex::new(()),
        exit_status: AtomicI32::new(0),
        fault_handler: spin::Mutex::new(None),
    });
    thread.lock().task = Arc::downgrade(&task);
    index_thread(thread.clone());
    if let Some(parent) = parent {
        parent.children.lock().alive.push(task.clone());
    }
    (task, thread)
}

/// Words in a ring-3 trap frame: the pusha block plus the five-word iret
/// frame.
pub const TRAP_FRAME_WORDS: usize = 13;

/// Craft `thread`'s kernel stack for a first entry into user mode at
/// `eip`/`user_esp`: an iret frame over a zeroed register block, a return
/// into the trap epilogue, and the callee-saved block the stack switch
/// pops.
pub fn craft_user_entry(thread: &ThreadRef, eip: u32, user_esp: u32) {
    scheduler::with_thread(thread, |t| {
        let frame_base = KERNEL_STACK_WORDS - TRAP_FRAME_WORDS;
        for word in &mut t.kstack[frame_base..frame_base + 8] {
            *word = 0;
        }
        t.kstack[frame_base + 8] = eip;
        t.kstack[frame_base + 9] = cpu::USER_CODE_SELECTOR.bits() as u32;
        t.kstack[frame_base + 10] = EFLAGS_USER;
        t.kstack[frame_base + 11] = user_esp;
        t.kstack[frame_base + 12] = cpu::USER_DATA_SELECTOR.bits() as u32;
        finish_craft(t, frame_base);
    });
}

/// Craft a forked child's kernel stack: the parent's trap frame verbatim,
/// except that the child's saved eax reads 0.
pub fn craft_forked_entry(thread: &ThreadRef, parent_frame: &TrapFrame) {
    let src = unsafe {
        core::slice::from_raw_parts(
            parent_frame as *const TrapFrame as *const u32,
            TRAP_FRAME_WORDS,
        )
    };
    scheduler::with_thread(thread, |t| {
        let frame_base = KERNEL_STACK_WORDS - TRAP_FRAME_WORDS;
        t.kstack[frame_base..].copy_from_slice(src);
        t.kstack[frame_base + 7] = 0;
        finish_craft(t, frame_base);
    });
}

fn finish_craft(t: &mut Thread, frame_base: usize) {
    t.kstack[frame_base - 1] = interrupts::trap_return as usize as u32;
    let switch_base = frame_base - 6;
    t.kstack[switch_base] = EFLAGS_SUSPENDED;
    for word in &mut t.kstack[switch_base + 1..frame_base - 1] {
        *word = 0;
    }
    t.context.esp = t.kstack_word_addr(switch_base);
}

/// Read `name` from the ramdisk, build and populate an address space for
/// it, and lay argv out on the new user stack. Nothing about the current
/// task changes; all failures leave only garbage to drop.
pub fn load_program(name: &str, args: &[String]) -> KernelResult<(AddressSpace, u32, u32)> {
    let size = ramdisk::file_size(name)?;
    let mut image = vec![0u8; size];
    ramdisk::getbytes(name, 0, &mut image)?;
    let parsed = elf::parse(&image)?;
    let mut space = vm::address_space_for_program(&parsed)?;
    for section in [&parsed.text, &parsed.rodata, &parsed.data] {
        if section.len > 0 {
            let lo = section.offset as usize;
            let hi = lo + section.len as usize;
            space.write_bytes(section.start, &image[lo..hi])?;
        }
    }
    let user_esp = push_arguments(&mut space, args)?;
    Ok((space, parsed.entry, user_esp))
}

/// Initial user stack: argv strings at the very top, the pointer array
/// below them, then `(argc, argv, stack_low, stack_high)` under a dummy
/// return address.
fn push_arguments(space: &mut AddressSpace, args: &[String]) -> KernelResult<u32> {
    let mut sp = STACK_START;
    let mut arg_addrs = Vec::with_capacity(args.len());
    for arg in args {
        let bytes = arg.as_bytes();
        sp = sp
            .checked_sub(bytes.len() as u32 + 1)
            .ok_or(KernelError::Invalid)?;
        space.write_bytes(sp, bytes)?;
        space.write_bytes(sp + bytes.len() as u32, &[0])?;
        arg_addrs.push(sp);
    }
    sp &= !3;
    sp -= 4 * (args.len() as u32 + 1);
    let argv = sp;
    for (i, addr) in arg_addrs.iter().enumerate() {
        space.write_bytes(argv + 4 * i as u32, &addr.to_le_bytes())?;
    }
    space.write_bytes(argv + 4 * args.len() as u32, &0u32.to_le_bytes())?;

    sp -= 20;
    let call_frame = [
        0u32,
        args.len() as u32,
        argv,
        STACK_START - DEFAULT_STACK_SIZE,
        STACK_START,
    ];
    for (i, word) in call_frame.iter().enumerate() {
        space.write_bytes(sp + 4 * i as u32, &word.to_le_bytes())?;
    }
    Ok(sp)
}

/// Record an unhandled-fault exit status and tear the task down.
pub fn kill_current(status: i32) -> ! {
    if let Some(task) = current_task() {
        task.exit_status.store(status, Ordering::Relaxed);
    }
    syscalls::lifecycle::do_vanish()
}

/// Load the first user program, install it as the init task and transfer
/// control to ring 3 via the shared trap epilogue. Never returns.
pub fn run_first_task(name: &str) -> ! {
    let args = vec![String::from(name)];
    let (space, entry, user_esp) = match load_program(name, &args) {
        Ok(loaded) => loaded,
        Err(err) => panic!("cannot load {name}: {err:?}"),
    };
    let (task, thread) = create_task(None, space);
    INIT_TASK.init_once(|| task.clone());
    craft_user_entry(&thread, entry, user_esp);

    let (frame_esp, kstack_top) = {
        let mut t = thread.lock();
        t.status = Status::Running;
        // Enter through the trap frame directly; the switch preamble on
        // the crafted stack is only for entries via context switch.
        (
            t.kstack_word_addr(KERNEL_STACK_WORDS - TRAP_FRAME_WORDS),
            t.kstack_top(),
        )
    };
    let pd_base = task.pd_base();

    scheduler::start_with(thread.clone());

    unsafe { x86::irq::disable() };
    cpu::set_kernel_stack(kstack_top);
    cpu::load_user_data_segments();
    vm::load_page_directory(pd_base);

    drop(thread);
    drop(task);
    unsafe { enter_first_task(frame_esp) }
}

#[unsafe(naked)]
unsafe extern "fastcall" fn enter_first_task(_frame_esp: u32) -> ! {
    core::arch::naked_asm!(
        "mov esp, ecx",
        "jmp {epilogue}",
        epilogue = sym interrupts::trap_return,
    );
}
