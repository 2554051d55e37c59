//! Task lifecycle calls: fork, exec, set_status, wait, vanish.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::errors::{KernelError, KernelResult};
use crate::interrupts::TrapFrame;
use crate::scheduler;
use crate::sync::MutexGuard;
use crate::trap_entry;
use crate::user::constants::*;
use crate::user::syscalls::{
    copy_user_cstr, read_user_u32, result_to_ret, validate_read, validate_write,
};
use crate::user::{self, Task, TaskRef};
use crate::{ramdisk, vm};

trap_entry!(fork_entry, fork_handler);
trap_entry!(exec_entry, exec_handler);
trap_entry!(set_status_entry, set_status_handler);
trap_entry!(vanish_entry, vanish_handler);
trap_entry!(wait_entry, wait_handler);

extern "C" fn fork_handler(frame: &mut TrapFrame) {
    frame.eax = result_to_ret(do_fork(frame));
}

/// Clone the current task: COW address space, a first thread whose kernel
/// stack replays this very trap frame with a zero return value, and a link
/// into our alive-children list.
fn do_fork(frame: &mut TrapFrame) -> KernelResult<i32> {
    let parent = user::current_task().ok_or(KernelError::Failure)?;

    let child_space = parent.addr_space.lock().clone_cow();
    // Our own writable mappings just became read-only + COW; drop the
    // stale translations before anyone writes through them.
    vm::reload_cr3();

    let (child_task, child_thread) = user::create_task(Some(&parent), child_space);
    user::craft_forked_entry(&child_thread, frame);
    let child_id = child_task.id;
    drop(child_task);
    scheduler::runq_add(child_thread);
    Ok(child_id as i32)
}

extern "C" fn exec_handler(frame: &mut TrapFrame) {
    if let Err(err) = do_exec(frame) {
        frame.eax = err.code() as u32;
    }
    // On success the rewritten frame carries the new program's context and
    // the epilogue drops straight into it.
}

/// Packet: `{name*, argv**}`. Everything fallible happens against kernel
/// copies and a detached address space; the old image is torn down only
/// after the new one is complete and installed.
fn do_exec(frame: &mut TrapFrame) -> KernelResult<()> {
    let packet = frame.esi;
    validate_read(packet, 8)?;
    let name_ptr = read_user_u32(packet);
    let argv_ptr = read_user_u32(packet + 4);

    let name = copy_user_cstr(name_ptr, EXECNAME_MAX)?;
    let mut args: Vec<String> = Vec::new();
    if argv_ptr != 0 {
        for i in 0..=NUM_ARGS_MAX {
            let slot = argv_ptr + (4 * i) as u32;
            validate_read(slot, 4)?;
            let arg_ptr = read_user_u32(slot);
            if arg_ptr == 0 {
                break;
            }
            if i == NUM_ARGS_MAX {
                return Err(KernelError::TooBig);
            }
            args.push(copy_user_cstr(arg_ptr, ARGNAME_MAX)?);
        }
    }

    let task = user::current_task().ok_or(KernelError::Failure)?;
    if task.threads.lock().len() > 1 {
        return Err(KernelError::Failure);
    }
    if !ramdisk::exists(&name) {
        return Err(KernelError::Failure);
    }

    let (space, entry, user_esp) = user::load_program(&name, &args)?;

    // Commit point. Install the new directory before freeing the old one
    // out from under the CPU.
    let old_space = task.replace_address_space(space);
    vm::load_page_directory(task.pd_base());
    drop(old_space);
    *task.fault_handler.lock() = None;

    frame.eip = entry;
    frame.esp = user_esp;
    frame.eflags = EFLAGS_USER;
    frame.eax = 0;
    frame.ebx = 0;
    frame.ecx = 0;
    frame.edx = 0;
    frame.esi = 0;
    frame.edi = 0;
    frame.ebp = 0;
    Ok(())
}

extern "C" fn set_status_handler(frame: &mut TrapFrame) {
    if let Some(task) = user::current_task() {
        task.exit_status.store(frame.esi as i32, Ordering::Relaxed);
    }
    frame.eax = 0;
}

extern "C" fn wait_handler(frame: &mut TrapFrame) {
    frame.eax = result_to_ret(do_wait(frame.esi));
}

/// Reap one dead child, blocking on the exit condition variable while
/// children are alive but none has died. Concurrent waiters serialize on
/// the children mutex and each reaps a distinct child.
fn do_wait(status_ptr: u32) -> KernelResult<i32> {
    if status_ptr != 0 {
        validate_write(status_ptr, 4)?;
    }
    let task = user::current_task().ok_or(KernelError::Failure)?;
    let mut children = task.children.lock();
    loop {
        if !children.dead.is_empty() {
            let dead = children.dead.remove(0);
            drop(children);
            let dead_id = dead.id;
            let status = dead.exit_status.load(Ordering::Relaxed);
            if status_ptr != 0 {
                unsafe { (status_ptr as *mut i32).write_unaligned(status) };
            }
            // Last strong reference: the child's record goes away here.
            drop(dead);
            return Ok(dead_id as i32);
        }
        if children.alive.is_empty() {
            return Err(KernelError::Failure);
        }
        children = task.exit_cv.wait(children);
    }
}

extern "C" fn vanish_handler(_frame: &mut TrapFrame) {
    do_vanish();
}

/// Thread self-termination. The last thread of a task additionally hands
/// its children to init, moves itself to the parent's dead list, drops the
/// user address space and wakes the parent's wait.
pub fn do_vanish() -> ! {
    scheduler::reap_dead_threads();

    let current = scheduler::current_thread().expect("vanish with no current thread");
    let (tid, task) = scheduler::with_thread(&current, |t| (t.tid, t.task.clone()));
    let task = task.upgrade().expect("vanishing thread has no task");
    drop(current);

    user::unindex_thread(tid);
    let remaining = {
        let mut threads = task.threads.lock();
        crate::interrupts::without_interrupts(|| {
            threads.retain(|t| t.lock().tid != tid);
        });
        threads.len()
    };

    if remaining == 0 {
        let init = user::init_task();
        assert!(!Arc::ptr_eq(&task, &init), "init task vanished");

        // The parent link can change underneath us exactly once: a
        // concurrently vanishing parent hands us to init, which never
        // vanishes. Locking the candidate's vanish mutex and re-reading
        // the link makes the second attempt stable.
        let candidate = current_parent(&task, &init);
        let guard = candidate.vanish_lock.lock();
        let parent = if Arc::ptr_eq(&current_parent(&task, &init), &candidate) {
            detach_and_surrender(&task, &candidate, &init, guard);
            candidate
        } else {
            drop(guard);
            let stable = current_parent(&task, &init);
            let guard = stable.vanish_lock.lock();
            detach_and_surrender(&task, &stable, &init, guard);
            stable
        };

        // Drop the user address space. The CPU leaves its tables first.
        vm::load_kernel_pd();
        let old_space = task.replace_address_space(vm::AddressSpace::new());
        drop(old_space);

        let none_alive = parent.children.lock().alive.is_empty();
        if none_alive {
            parent.exit_cv.notify_all();
        } else {
            parent.exit_cv.notify_one();
        }
        drop(parent);
        drop(init);
    }

    drop(task);
    scheduler::exit_current()
}

fn current_parent(task: &Task, init: &TaskRef) -> TaskRef {
    task.parent
        .read()
        .upgrade()
        .unwrap_or_else(|| init.clone())
}

/// With the parent's vanish mutex held: re-parent our children to init,
/// splice them onto init's lists, and move ourselves from the parent's
/// alive list to its dead list.
fn detach_and_surrender(
    task: &TaskRef,
    parent: &TaskRef,
    init: &TaskRef,
    parent_vanish_guard: MutexGuard<'_, ()>,
) {
    {
        let _self_vanish = task.vanish_lock.lock();
        let mut mine = task.children.lock();
        for child in mine.alive.iter().chain(mine.dead.iter()) {
            *child.parent.write() = Arc::downgrade(init);
        }
        let mut adopted_alive: Vec<TaskRef> = mine.alive.drain(..).collect();
        let mut adopted_dead: Vec<TaskRef> = mine.dead.drain(..).collect();
        drop(mine);

        if !adopted_alive.is_empty() || !adopted_dead.is_empty() {
            let wake_init = !adopted_dead.is_empty();
            {
                let mut init_children = init.children.lock();
                init_children.alive.append(&mut adopted_alive);
                init_children.dead.append(&mut adopted_dead);
            }
            // Orphans that already died must not wait for another event.
            if wake_init {
                init.exit_cv.notify_one();
            }
        }
    }

    {
        let mut parent_children = parent.children.lock();
        parent_children.alive.retain(|t| t.id != task.id);
        parent_children.dead.push(task.clone());
    }
    drop(parent_vanish_guard);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn wait_with_no_children_fails() {
        // No current task exists during the boot phase, so the failure is
        // the no-task one; the important property is that nothing blocks.
        assert_eq!(do_wait(0), Err(KernelError::Failure));
    }
}
