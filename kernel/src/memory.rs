use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use linked_list_allocator::LockedHeap;

use crate::errors::{KernelError, KernelResult};
use crate::sync::Mutex;
use crate::user::constants::USER_MEM_START;

pub const PAGE_SIZE: usize = 4096;

pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

static mut HEAP_ARENA: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// # Safety
/// Must be called exactly once, before the first allocation.
pub unsafe fn init_heap() {
    unsafe {
        ALLOCATOR
            .lock()
            .init((&raw mut HEAP_ARENA) as *mut u8, HEAP_SIZE);
    }
}

/// A page-aligned physical frame in the user pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame(u32);

impl Frame {
    pub fn addr(self) -> u32 {
        self.0
    }

    pub fn from_addr(addr: u32) -> Frame {
        debug_assert_eq!(addr as usize % PAGE_SIZE, 0);
        Frame(addr)
    }
}

const FREE_LIST_END: u32 = u32::MAX;

/// The pool of user physical frames.
///
/// One u32 of bookkeeping exists per frame. While a frame is on the free
/// list the word holds the index of the next free frame; while the frame is
/// mapped it holds a reference count maintained by the VM layer. The pool
/// itself never interprets the count.
pub struct FramePool {
    slots: Vec<u32>,
    free_head: u32,
    free_count: usize,
}

impl FramePool {
    pub fn new(total_mem: u32) -> FramePool {
        let frames = (total_mem.saturating_sub(USER_MEM_START) as usize) / PAGE_SIZE;
        let mut slots = Vec::with_capacity(frames);
        for i in 0..frames {
            if i + 1 < frames {
                slots.push((i + 1) as u32);
            } else {
                slots.push(FREE_LIST_END);
            }
        }
        FramePool {
            slots,
            free_head: if frames == 0 { FREE_LIST_END } else { 0 },
            free_count: frames,
        }
    }

    fn index(&self, frame: Frame) -> usize {
        ((frame.0 - USER_MEM_START) as usize) / PAGE_SIZE
    }

    fn frame_at(&self, index: usize) -> Frame {
        Frame(USER_MEM_START + (index * PAGE_SIZE) as u32)
    }

    pub fn allocate(&mut self) -> Option<Frame> {
        if self.free_head == FREE_LIST_END {
            return None;
        }
        let index = self.free_head as usize;
        self.free_head = self.slots[index];
        self.slots[index] = 0;
        self.free_count -= 1;
        Some(self.frame_at(index))
    }

    pub fn deallocate(&mut self, frame: Frame) {
        let index = self.index(frame);
        self.slots[index] = self.free_head;
        self.free_head = index as u32;
        self.free_count += 1;
    }

    pub fn refcount(&self, frame: Frame) -> u32 {
        self.slots[self.index(frame)]
    }

    pub fn set_refcount(&mut self, frame: Frame, count: u32) {
        let index = self.index(frame);
        self.slots[index] = count;
    }

    pub fn ref_inc(&mut self, frame: Frame) {
        let index = self.index(frame);
        self.slots[index] += 1;
    }

    pub fn ref_dec(&mut self, frame: Frame) -> u32 {
        let index = self.index(frame);
        assert!(self.slots[index] > 0, "refcount underflow");
        self.slots[index] -= 1;
        self.slots[index]
    }

    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

static FRAMES: OnceCell<Mutex<FramePool>> = OnceCell::uninit();

pub fn init(total_mem: u32) {
    FRAMES.init_once(|| Mutex::new(FramePool::new(total_mem)));
}

fn pool() -> &'static Mutex<FramePool> {
    FRAMES.get().expect("frame pool not initialised")
}

pub fn allocate_frame() -> KernelResult<Frame> {
    pool().lock().allocate().ok_or(KernelError::NoMem)
}

pub fn deallocate_frame(frame: Frame) {
    pool().lock().deallocate(frame);
}

/// Run a closure against the pool's bookkeeping (refcounts, statistics)
/// under the allocator mutex.
pub fn with_pool<R>(f: impl FnOnce(&mut FramePool) -> R) -> R {
    f(&mut pool().lock())
}

pub fn free_frame_count() -> usize {
    pool().lock().free_frames()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(frames: usize) -> FramePool {
        FramePool::new(USER_MEM_START + (frames * PAGE_SIZE) as u32)
    }

    #[test_case]
    fn allocations_are_aligned_and_distinct() {
        let mut pool = pool_of(8);
        let mut seen = alloc::vec::Vec::new();
        while let Some(frame) = pool.allocate() {
            assert_eq!(frame.addr() as usize % PAGE_SIZE, 0);
            assert!(frame.addr() >= USER_MEM_START);
            assert!(!seen.contains(&frame));
            seen.push(frame);
        }
        assert_eq!(seen.len(), 8);
        assert_eq!(pool.free_frames(), 0);
    }

    #[test_case]
    fn exhaustion_then_refill() {
        let mut pool = pool_of(4);
        let frames: alloc::vec::Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert!(pool.allocate().is_none());
        for frame in frames {
            pool.deallocate(frame);
        }
        assert_eq!(pool.free_frames(), 4);
        assert!(pool.allocate().is_some());
    }

    #[test_case]
    fn refcounts_track_per_frame() {
        let mut pool = pool_of(4);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.set_refcount(a, 1);
        pool.set_refcount(b, 1);
        pool.ref_inc(a);
        assert_eq!(pool.refcount(a), 2);
        assert_eq!(pool.refcount(b), 1);
        assert_eq!(pool.ref_dec(a), 1);
        assert_eq!(pool.ref_dec(a), 0);
        pool.deallocate(a);
        assert_eq!(pool.refcount(b), 1);
        assert_eq!(pool.free_frames(), 3);
    }
}
