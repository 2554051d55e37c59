use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::cpu;
use crate::errors::{KernelError, KernelResult};
use crate::interrupts::without_interrupts;
use crate::user::Task;
use crate::user::constants::{EFLAGS_SUSPENDED, KERNEL_STACK_SIZE};
use crate::vm;

pub const KERNEL_STACK_WORDS: usize = KERNEL_STACK_SIZE / 4;

static NEXT_TID: AtomicU32 = AtomicU32::new(1);
static MULTITASKING: AtomicBool = AtomicBool::new(false);
pub static TICKS: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Runnable,
    Waiting,
    Exited,
}

/// Saved stack pointer of a suspended thread. Everything else a thread needs
/// to resume lives on its kernel stack.
#[derive(Default)]
pub struct Context {
    pub esp: u32,
}

pub struct Thread {
    pub tid: u32,
    pub context: Context,
    /// Kernel stack, two pages. The backing allocation must never move; it
    /// is only ever dropped after the thread has switched off it for good.
    pub kstack: Vec<u32>,
    pub task: Weak<Task>,
    pub status: Status,
    pub wake_tick: u32,
    /// Set while the thread is blocked in deschedule, so make_runnable can
    /// tell it apart from other WAITING threads.
    pub descheduled: bool,
    /// Kernel-mode thread (the idle thread): kernel segments and the kernel
    /// page directory instead of a task's.
    pub kernel: bool,
    link: Option<ThreadRef>,
}

pub type ThreadRef = Arc<Mutex<Thread>>;

impl Thread {
    pub fn new(task: Weak<Task>, kernel: bool) -> Thread {
        Thread {
            tid: alloc_tid(),
            context: Context::default(),
            kstack: vec![0u32; KERNEL_STACK_WORDS],
            task,
            status: Status::Runnable,
            wake_tick: 0,
            descheduled: false,
            kernel,
            link: None,
        }
    }

    pub fn kstack_top(&self) -> u32 {
        self.kstack.as_ptr() as u32 + (self.kstack.len() * 4) as u32
    }

    /// Address of the stack word at `index`.
    pub fn kstack_word_addr(&self, index: usize) -> u32 {
        self.kstack.as_ptr() as u32 + (index * 4) as u32
    }
}

pub fn alloc_tid() -> u32 {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

/// FIFO queue of threads, linked through each thread's embedded `link`
/// field. Queue operations never allocate, which lets them run with
/// interrupts disabled without touching the heap lock.
///
/// A thread is on at most one queue at a time.
pub struct ThreadQueue {
    head: Option<ThreadRef>,
    tail: Option<ThreadRef>,
    len: usize,
}

impl ThreadQueue {
    pub const fn new() -> ThreadQueue {
        ThreadQueue {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_back(&mut self, thread: ThreadRef) {
        thread.lock().link = None;
        match self.tail.take() {
            Some(tail) => {
                tail.lock().link = Some(thread.clone());
                self.tail = Some(thread);
            }
            None => {
                self.head = Some(thread.clone());
                self.tail = Some(thread);
            }
        }
        self.len += 1;
    }

    pub fn push_front(&mut self, thread: ThreadRef) {
        match self.head.take() {
            Some(head) => {
                thread.lock().link = Some(head);
                self.head = Some(thread);
            }
            None => {
                thread.lock().link = None;
                self.head = Some(thread.clone());
                self.tail = Some(thread);
            }
        }
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<ThreadRef> {
        let head = self.head.take()?;
        let next = head.lock().link.take();
        if next.is_none() {
            self.tail = None;
        }
        self.head = next;
        self.len -= 1;
        Some(head)
    }

    /// Unlink a specific thread. Returns false if it was not queued here.
    pub fn remove(&mut self, target: &ThreadRef) -> bool {
        let mut prev: Option<ThreadRef> = None;
        let mut cursor = self.head.clone();
        while let Some(node) = cursor {
            if Arc::ptr_eq(&node, target) {
                let next = node.lock().link.take();
                match &prev {
                    Some(prev) => prev.lock().link = next.clone(),
                    None => self.head = next.clone(),
                }
                if next.is_none() {
                    self.tail = prev;
                }
                self.len -= 1;
                return true;
            }
            cursor = node.lock().link.clone();
            prev = Some(node);
        }
        false
    }

    /// Insert keeping the queue ordered by ascending wake tick.
    pub fn insert_by_wake(&mut self, thread: ThreadRef) {
        let wake = thread.lock().wake_tick;
        let mut prev: Option<ThreadRef> = None;
        let mut cursor = self.head.clone();
        while let Some(node) = cursor {
            if tick_after(node.lock().wake_tick, wake) {
                break;
            }
            cursor = node.lock().link.clone();
            prev = Some(node);
        }
        match prev {
            None => self.push_front(thread),
            Some(prev) => {
                let next = prev.lock().link.take();
                if next.is_none() {
                    self.tail = Some(thread.clone());
                }
                thread.lock().link = next;
                prev.lock().link = Some(thread);
                self.len += 1;
            }
        }
    }

    pub fn peek_wake(&self) -> Option<u32> {
        self.head.as_ref().map(|t| t.lock().wake_tick)
    }
}

/// True if tick `a` is strictly later than `b`, tolerating wraparound.
fn tick_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

static READY: Mutex<ThreadQueue> = Mutex::new(ThreadQueue::new());
static SLEEPING: Mutex<ThreadQueue> = Mutex::new(ThreadQueue::new());
static DEAD: Mutex<ThreadQueue> = Mutex::new(ThreadQueue::new());
static CURRENT: Mutex<Option<ThreadRef>> = Mutex::new(None);
static IDLE: OnceCell<ThreadRef> = OnceCell::uninit();

pub fn init() {
    IDLE.init_once(|| {
        let mut idle = Thread::new(Weak::new(), true);
        prepare_kernel_thread(&mut idle, idle_main);
        Arc::new(Mutex::new(idle))
    });
}

/// Craft a kernel stack so the first switch to this thread "returns" into
/// `entry` with interrupts still disabled.
fn prepare_kernel_thread(thread: &mut Thread, entry: extern "C" fn() -> !) {
    let ret = KERNEL_STACK_WORDS - 1;
    thread.kstack[ret] = entry as usize as u32;
    let base = ret - 5;
    thread.kstack[base] = EFLAGS_SUSPENDED;
    for word in &mut thread.kstack[base + 1..ret] {
        *word = 0;
    }
    thread.context.esp = thread.kstack_word_addr(base);
}

extern "C" fn idle_main() -> ! {
    loop {
        reap_dead_threads();
        unsafe {
            x86::irq::enable();
            x86::halt();
        }
    }
}

#[unsafe(naked)]
unsafe extern "fastcall" fn switch_stacks(_prev_esp: *mut u32, _next_esp: u32) {
    // prev slot arrives in ecx, the new stack pointer in edx. Everything a
    // suspended thread needs beyond the callee-saved registers is reachable
    // from its stack, so the swap itself is the only state exchange.
    core::arch::naked_asm!(
        "push ebp",
        "push ebx",
        "push esi",
        "push edi",
        "pushfd",
        "mov [ecx], esp",
        "mov esp, edx",
        "popfd",
        "pop edi",
        "pop esi",
        "pop ebx",
        "pop ebp",
        "ret",
    );
}

/// Pick the next thread and switch to it.
///
/// Interrupts must be disabled on entry and stay disabled across the swap.
/// The current thread is requeued only if it is still RUNNING; WAITING and
/// EXITED threads stay wherever their owner parked them. With an empty
/// queue a RUNNING thread keeps the CPU and everything else falls through
/// to the idle thread.
fn schedule() {
    let current = CURRENT.lock().clone();

    let mut next = READY.lock().pop_front();
    if next.is_none() {
        let still_running = current
            .as_ref()
            .map(|cur| cur.lock().status == Status::Running)
            .unwrap_or(false);
        if still_running {
            return;
        }
        next = Some(IDLE.get().expect("scheduler not initialised").clone());
    }
    let next = next.expect("no next thread");

    if let Some(cur) = &current {
        if Arc::ptr_eq(cur, &next) {
            cur.lock().status = Status::Running;
            return;
        }
        let mut cur_locked = cur.lock();
        if cur_locked.status == Status::Running {
            cur_locked.status = Status::Runnable;
            let requeue = !cur_locked.kernel;
            drop(cur_locked);
            // The idle thread is never kept on the queue; it is the
            // fallback when the queue runs dry.
            if requeue {
                READY.lock().push_back(cur.clone());
            }
        }
    }

    let (next_esp, next_kstack_top, next_kernel) = {
        let mut next_locked = next.lock();
        next_locked.status = Status::Running;
        (
            next_locked.context.esp,
            next_locked.kstack_top(),
            next_locked.kernel,
        )
    };

    let next_task = next.lock().task.upgrade();
    match (&next_task, next_kernel) {
        (Some(task), false) => {
            cpu::load_user_data_segments();
            vm::load_page_directory(task.pd_base());
        }
        _ => {
            cpu::load_kernel_data_segments();
            vm::load_kernel_pd();
        }
    }
    cpu::set_kernel_stack(next_kstack_top);

    let prev_slot: *mut u32 = match &current {
        Some(cur) => {
            let mut cur_locked = cur.lock();
            let slot = &raw mut cur_locked.context.esp;
            drop(cur_locked);
            slot
        }
        None => {
            static mut BOOT_ESP: u32 = 0;
            &raw mut BOOT_ESP
        }
    };

    *CURRENT.lock() = Some(next.clone());

    // An exiting thread never executes past the swap, so every Arc this
    // frame holds must be gone before it. The swap itself must not touch
    // the heap: the drops below only decrement counts, since the thread
    // index, task lists and dead list still hold their own references.
    drop(next_task);
    drop(next);
    drop(current);

    unsafe { switch_stacks(prev_slot, next_esp) };
}

/// Voluntarily give up the CPU, staying runnable.
pub fn context_switch() {
    without_interrupts(schedule);
}

/// Timer-driven preemption. Interrupts are already disabled in the
/// interrupt gate; the current thread is requeued only if still RUNNING.
pub fn preempt() {
    schedule();
}

/// Advance the tick counter and release any sleepers that have come due.
pub fn timer_tick() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    loop {
        let due = {
            let mut sleeping = SLEEPING.lock();
            match sleeping.peek_wake() {
                Some(wake) if !tick_after(wake, now) => sleeping.pop_front(),
                _ => None,
            }
        };
        match due {
            Some(thread) => {
                thread.lock().status = Status::Runnable;
                READY.lock().push_back(thread);
            }
            None => break,
        }
    }
}

pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Append to the runnable queue. The caller must already have set the
/// thread RUNNABLE.
pub fn runq_add(thread: ThreadRef) {
    without_interrupts(|| {
        debug_assert_eq!(thread.lock().status, Status::Runnable);
        READY.lock().push_back(thread);
    });
}

/// Mark a blocked thread runnable and queue it. Interrupts must be
/// disabled.
pub fn wake(thread: ThreadRef) {
    thread.lock().status = Status::Runnable;
    READY.lock().push_back(thread);
}

/// Park the current thread as WAITING and switch away. Interrupts must be
/// disabled; the caller has already published the thread on whatever wait
/// queue will eventually wake it.
pub fn block_current(current: &ThreadRef) {
    current.lock().status = Status::Waiting;
    schedule();
}

pub fn yield_to(tid: i32) -> KernelResult<()> {
    if tid == -1 {
        context_switch();
        return Ok(());
    }
    if tid < 0 {
        return Err(KernelError::Invalid);
    }
    // The index lookup must happen with interrupts enabled; the target is
    // re-examined under the interrupt lock before it is moved.
    let target = crate::user::lookup_thread(tid as u32).ok_or(KernelError::Invalid)?;
    without_interrupts(|| {
        let current = CURRENT.lock().clone();
        if let Some(cur) = &current {
            if Arc::ptr_eq(cur, &target) {
                return Ok(());
            }
        }
        match target.lock().status {
            Status::Waiting | Status::Exited => return Err(KernelError::Failure),
            _ => {}
        }
        let mut ready = READY.lock();
        if ready.remove(&target) {
            ready.push_front(target);
        }
        drop(ready);
        drop(current);
        schedule();
        Ok(())
    })
}

pub fn sleep(ticks: i32) -> KernelResult<()> {
    if ticks < 0 {
        return Err(KernelError::Invalid);
    }
    if ticks == 0 {
        return Ok(());
    }
    without_interrupts(|| {
        let current = CURRENT.lock().clone().ok_or(KernelError::Failure)?;
        {
            let mut cur_locked = current.lock();
            cur_locked.wake_tick = TICKS.load(Ordering::Relaxed).wrapping_add(ticks as u32);
            cur_locked.status = Status::Waiting;
        }
        SLEEPING.lock().insert_by_wake(current);
        schedule();
        Ok(())
    })
}

/// Block the current thread until make_runnable. The caller has already
/// read the reject word under disabled interrupts.
pub fn deschedule_current() {
    without_interrupts(|| {
        let current = CURRENT.lock().clone().expect("no current thread");
        {
            let mut cur_locked = current.lock();
            cur_locked.status = Status::Waiting;
            cur_locked.descheduled = true;
        }
        schedule();
        current.lock().descheduled = false;
    });
}

pub fn make_runnable(tid: i32) -> KernelResult<()> {
    if tid < 0 {
        return Err(KernelError::Invalid);
    }
    let target = crate::user::lookup_thread(tid as u32).ok_or(KernelError::Invalid)?;
    without_interrupts(|| {
        let mut target_locked = target.lock();
        if target_locked.status != Status::Waiting || !target_locked.descheduled {
            return Err(KernelError::Failure);
        }
        target_locked.status = Status::Runnable;
        target_locked.descheduled = false;
        drop(target_locked);
        READY.lock().push_back(target);
        Ok(())
    })
}

/// Final exit path: park this thread's last strong reference on the dead
/// list, mark it EXITED and switch away forever. The kernel stack is freed
/// later by reap_dead_threads, once the thread is provably off it.
pub fn exit_current() -> ! {
    unsafe { x86::irq::disable() };
    let current = CURRENT.lock().clone().expect("no current thread");
    DEAD.lock().push_back(current.clone());
    current.lock().status = Status::Exited;
    drop(current);
    schedule();
    unreachable!("exited thread was rescheduled");
}

/// Drop fully-exited threads, releasing their kernel stacks. Called from
/// allocation-safe contexts only (thread creation, vanish entry, idle).
pub fn reap_dead_threads() {
    loop {
        let dead = without_interrupts(|| DEAD.lock().pop_front());
        match dead {
            Some(thread) => drop(thread),
            None => break,
        }
    }
}

pub fn current_thread() -> Option<ThreadRef> {
    without_interrupts(|| CURRENT.lock().clone())
}

/// Run a closure against a thread record. Thread spin locks are only ever
/// taken with interrupts disabled, so a preemption can never catch anyone
/// holding one.
pub fn with_thread<R>(thread: &ThreadRef, f: impl FnOnce(&mut Thread) -> R) -> R {
    without_interrupts(|| f(&mut thread.lock()))
}

pub fn current_tid() -> u32 {
    without_interrupts(|| {
        CURRENT
            .lock()
            .as_ref()
            .map(|t| t.lock().tid)
            .unwrap_or(0)
    })
}

/// Install the first thread as current and open the gates: from here on
/// the synchronization primitives really block and really disable
/// interrupts.
pub fn start_with(thread: ThreadRef) {
    without_interrupts(|| {
        *CURRENT.lock() = Some(thread);
    });
    MULTITASKING.store(true, Ordering::SeqCst);
}

pub fn multitasking_active() -> bool {
    MULTITASKING.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_thread() -> ThreadRef {
        Arc::new(Mutex::new(Thread::new(Weak::new(), true)))
    }

    #[test_case]
    fn tids_are_monotonic() {
        let a = alloc_tid();
        let b = alloc_tid();
        assert!(b > a);
    }

    #[test_case]
    fn queue_is_fifo() {
        let mut queue = ThreadQueue::new();
        let (a, b, c) = (bare_thread(), bare_thread(), bare_thread());
        queue.push_back(a.clone());
        queue.push_back(b.clone());
        queue.push_back(c.clone());
        assert_eq!(queue.len(), 3);
        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &a));
        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &b));
        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &c));
        assert!(queue.pop_front().is_none());
    }

    #[test_case]
    fn queue_remove_and_front_insert() {
        let mut queue = ThreadQueue::new();
        let (a, b, c) = (bare_thread(), bare_thread(), bare_thread());
        queue.push_back(a.clone());
        queue.push_back(b.clone());
        queue.push_back(c.clone());
        assert!(queue.remove(&b));
        assert!(!queue.remove(&b));
        queue.push_front(b.clone());
        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &b));
        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &a));
        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &c));
    }

    #[test_case]
    fn sleepers_order_by_wake_tick() {
        let mut queue = ThreadQueue::new();
        let (a, b, c) = (bare_thread(), bare_thread(), bare_thread());
        a.lock().wake_tick = 30;
        b.lock().wake_tick = 10;
        c.lock().wake_tick = 20;
        queue.insert_by_wake(a.clone());
        queue.insert_by_wake(b.clone());
        queue.insert_by_wake(c.clone());
        assert_eq!(queue.peek_wake(), Some(10));
        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &b));
        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &c));
        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &a));
    }
}
