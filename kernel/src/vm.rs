//! Per-task virtual memory: two-level page tables, the shared kernel direct
//! map, copy-on-write cloning, and the quick-map window the kernel uses to
//! reach user frames that live above the direct-mapped region.

use alloc::alloc::{Layout, alloc_zeroed, handle_alloc_error};
use alloc::boxed::Box;
use alloc::collections::btree_map::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use conquer_once::spin::OnceCell;
use x86::controlregs::{Cr0, Cr4, cr0, cr0_write, cr3, cr3_write, cr4, cr4_write};
use x86::tlb;

use crate::errors::{KernelError, KernelResult};
use crate::interrupts::without_interrupts;
use crate::memory::{self, Frame, PAGE_SIZE};
use crate::user::constants::{DEFAULT_STACK_SIZE, STACK_START, USER_MEM_START};
use crate::user::elf::SimpleElf;

pub const ENTRY_COUNT: usize = 1024;

/// Page-directory entries covered by the kernel direct map.
pub const KERNEL_PD_ENTRIES: usize = (USER_MEM_START as usize) / (PAGE_SIZE * ENTRY_COUNT);

/// Kernel virtual page reserved for short-lived mappings of user frames.
pub const QUICKMAP_VADDR: u32 = USER_MEM_START - PAGE_SIZE as u32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const GLOBAL = 1 << 8;
        /// Available-to-software bit marking a copy-on-write mapping.
        const COW = 1 << 9;
    }
}

pub fn page_floor(addr: u32) -> u32 {
    addr & !(PAGE_SIZE as u32 - 1)
}

fn pd_index(addr: u32) -> usize {
    (addr >> 22) as usize
}

fn pt_index(addr: u32) -> usize {
    ((addr >> 12) & 0x3FF) as usize
}

fn entry_addr(entry: u32) -> u32 {
    entry & 0xFFFF_F000
}

fn entry_flags(entry: u32) -> EntryFlags {
    EntryFlags::from_bits_truncate(entry & 0xFFF)
}

fn make_entry(addr: u32, flags: EntryFlags) -> u32 {
    debug_assert_eq!(addr as usize % PAGE_SIZE, 0);
    addr | flags.bits()
}

/// One page of 1024 32-bit entries; both page directories and page tables
/// have this shape. The kernel heap sits inside the direct-mapped region,
/// so a table's virtual address doubles as its physical address.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [u32; ENTRY_COUNT],
}

impl PageTable {
    fn new_boxed() -> Box<PageTable> {
        let layout = Layout::new::<PageTable>();
        let ptr = unsafe { alloc_zeroed(layout) } as *mut PageTable;
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        unsafe { Box::from_raw(ptr) }
    }

    pub fn phys_base(&self) -> u32 {
        self as *const PageTable as u32
    }

    pub fn entry(&self, index: usize) -> u32 {
        self.entries[index]
    }

    fn set_entry(&mut self, index: usize, value: u32) {
        self.entries[index] = value;
    }
}

struct DirectMap {
    tables: [*mut PageTable; KERNEL_PD_ENTRIES],
}

unsafe impl Send for DirectMap {}
unsafe impl Sync for DirectMap {}

struct KernelPd(*mut PageTable);

unsafe impl Send for KernelPd {}
unsafe impl Sync for KernelPd {}

static DIRECT_MAP: OnceCell<DirectMap> = OnceCell::uninit();
static KERNEL_PD: OnceCell<KernelPd> = OnceCell::uninit();

/// Build the shared direct map and the kernel's own page directory, then
/// turn paging on. Write protection is enabled so that kernel stores into
/// copy-on-write pages fault and get resolved like user ones.
pub fn init() {
    DIRECT_MAP.init_once(|| {
        let mut tables = [core::ptr::null_mut(); KERNEL_PD_ENTRIES];
        for (i, slot) in tables.iter_mut().enumerate() {
            let mut table = PageTable::new_boxed();
            for j in 0..ENTRY_COUNT {
                let addr = ((i * ENTRY_COUNT + j) * PAGE_SIZE) as u32;
                table.set_entry(
                    j,
                    make_entry(
                        addr,
                        EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::GLOBAL,
                    ),
                );
            }
            *slot = Box::into_raw(table);
        }
        DirectMap { tables }
    });
    KERNEL_PD.init_once(|| {
        let mut dir = PageTable::new_boxed();
        install_direct_map(&mut dir);
        KernelPd(Box::into_raw(dir))
    });
    unsafe {
        cr4_write(cr4() | Cr4::CR4_ENABLE_GLOBAL_PAGES);
        cr3_write(kernel_pd_base() as u64);
        cr0_write(cr0() | Cr0::CR0_ENABLE_PAGING | Cr0::CR0_WRITE_PROTECT);
    }
}

fn install_direct_map(dir: &mut PageTable) {
    let direct = DIRECT_MAP.get().expect("direct map not initialised");
    for (i, table) in direct.tables.iter().enumerate() {
        dir.set_entry(
            i,
            make_entry(
                *table as u32,
                EntryFlags::PRESENT | EntryFlags::WRITABLE,
            ),
        );
    }
}

pub fn kernel_pd_base() -> u32 {
    KERNEL_PD.get().expect("kernel pd not initialised").0 as u32
}

pub fn load_page_directory(pd_base: u32) {
    unsafe { cr3_write(pd_base as u64) };
}

pub fn load_kernel_pd() {
    load_page_directory(kernel_pd_base());
}

/// Reloading the current page directory is the cheapest full TLB shootdown
/// on this machine.
pub fn reload_cr3() {
    unsafe { cr3_write(cr3()) };
}

/// Map `frame` at the quick-map window for the duration of the closure.
/// Interrupts stay disabled so nothing else can retarget the window.
pub fn with_frame<R>(frame: Frame, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
    without_interrupts(|| {
        let direct = DIRECT_MAP.get().expect("direct map not initialised");
        let table = direct.tables[KERNEL_PD_ENTRIES - 1];
        unsafe {
            let slot = &raw mut (*table).entries[ENTRY_COUNT - 1];
            let saved = slot.read();
            slot.write(make_entry(
                frame.addr(),
                EntryFlags::PRESENT | EntryFlags::WRITABLE,
            ));
            tlb::flush(QUICKMAP_VADDR as usize);
            let result = f(&mut *(QUICKMAP_VADDR as *mut [u8; PAGE_SIZE]));
            slot.write(saved);
            tlb::flush(QUICKMAP_VADDR as usize);
            result
        }
    })
}

#[derive(Clone)]
struct Region {
    base: u32,
    len: u32,
}

/// A task's address space: its page directory, the page tables it owns for
/// the user range, and the regions established by new_pages.
pub struct AddressSpace {
    dir: Box<PageTable>,
    tables: BTreeMap<usize, Box<PageTable>>,
    regions: Vec<Region>,
}

impl AddressSpace {
    pub fn new() -> AddressSpace {
        let mut dir = PageTable::new_boxed();
        install_direct_map(&mut dir);
        AddressSpace {
            dir,
            tables: BTreeMap::new(),
            regions: Vec::new(),
        }
    }

    pub fn pd_base(&self) -> u32 {
        self.dir.phys_base()
    }

    fn table_mut_or_create(&mut self, pd_idx: usize) -> &mut PageTable {
        if !self.tables.contains_key(&pd_idx) {
            let table = PageTable::new_boxed();
            self.dir.set_entry(
                pd_idx,
                make_entry(
                    table.phys_base(),
                    EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
                ),
            );
            self.tables.insert(pd_idx, table);
        }
        self.tables.get_mut(&pd_idx).expect("table just inserted")
    }

    /// Present PTE covering `addr`, if any.
    pub fn lookup(&self, addr: u32) -> Option<u32> {
        let table = self.tables.get(&pd_index(addr))?;
        let entry = table.entry(pt_index(addr));
        entry_flags(entry).contains(EntryFlags::PRESENT).then_some(entry)
    }

    /// Map every page of `[start, start + len)` with a fresh zero-filled
    /// frame. Pages already present accumulate the new flag bits, so two
    /// segments sharing a page end up with the weaker protection of the
    /// two. Unwinds its own partial work when the frame pool runs dry.
    pub fn map_segment(&mut self, start: u32, len: u32, flags: EntryFlags) -> KernelResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = start.checked_add(len - 1).ok_or(KernelError::Invalid)?;
        let first = page_floor(start);
        let last = page_floor(end);
        let mut va = first;
        loop {
            if let Err(err) = self.map_demand_zero_page(va, flags) {
                if va > first {
                    self.unmap_range(first, va - first);
                }
                return Err(err);
            }
            if va == last {
                break;
            }
            va += PAGE_SIZE as u32;
        }
        Ok(())
    }

    fn map_demand_zero_page(&mut self, va: u32, flags: EntryFlags) -> KernelResult<()> {
        if pd_index(va) < KERNEL_PD_ENTRIES {
            return Err(KernelError::Invalid);
        }
        let table = self.table_mut_or_create(pd_index(va));
        let pt_idx = pt_index(va);
        let existing = table.entry(pt_idx);
        if entry_flags(existing).contains(EntryFlags::PRESENT) {
            table.set_entry(pt_idx, existing | flags.bits());
            return Ok(());
        }
        let frame = memory::allocate_frame()?;
        with_frame(frame, |page| page.fill(0));
        self.tables
            .get_mut(&pd_index(va))
            .expect("table exists")
            .set_entry(pt_idx, make_entry(frame.addr(), flags));
        memory::with_pool(|pool| pool.set_refcount(frame, 1));
        Ok(())
    }

    /// Unmap every present page of the range, releasing frames whose
    /// reference count drops to zero.
    fn unmap_range(&mut self, start: u32, len: u32) {
        if len == 0 {
            return;
        }
        let last = page_floor(start + (len - 1));
        let mut va = page_floor(start);
        loop {
            if let Some(table) = self.tables.get_mut(&pd_index(va)) {
                let pt_idx = pt_index(va);
                let entry = table.entry(pt_idx);
                if entry_flags(entry).contains(EntryFlags::PRESENT) {
                    let frame = Frame::from_addr(entry_addr(entry));
                    table.set_entry(pt_idx, 0);
                    memory::with_pool(|pool| {
                        if pool.ref_dec(frame) == 0 {
                            pool.deallocate(frame);
                        }
                    });
                    unsafe { tlb::flush(va as usize) };
                }
            }
            if va == last {
                break;
            }
            va += PAGE_SIZE as u32;
        }
    }

    /// Produce a copy-on-write clone: fresh page tables mirroring this
    /// one's, with every writable mapping rewritten read-only + COW on
    /// both sides and every mapped frame's reference count bumped.
    pub fn clone_cow(&mut self) -> AddressSpace {
        let mut child = AddressSpace::new();
        for (pd_idx, table) in self.tables.iter_mut() {
            let mut new_table = PageTable::new_boxed();
            for i in 0..ENTRY_COUNT {
                let entry = table.entry(i);
                let flags = entry_flags(entry);
                if !flags.contains(EntryFlags::PRESENT) {
                    continue;
                }
                let frame = Frame::from_addr(entry_addr(entry));
                if flags.contains(EntryFlags::WRITABLE) {
                    let shared = (entry & !EntryFlags::WRITABLE.bits()) | EntryFlags::COW.bits();
                    table.set_entry(i, shared);
                    new_table.set_entry(i, shared);
                } else {
                    new_table.set_entry(i, entry);
                }
                memory::with_pool(|pool| pool.ref_inc(frame));
            }
            child.dir.set_entry(
                *pd_idx,
                make_entry(
                    new_table.phys_base(),
                    EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
                ),
            );
            child.tables.insert(*pd_idx, new_table);
        }
        child.regions = self.regions.clone();
        child
    }

    /// True if `addr` is mapped copy-on-write here.
    pub fn is_cow(&self, addr: u32) -> bool {
        self.lookup(addr)
            .map(|entry| entry_flags(entry).contains(EntryFlags::COW))
            .unwrap_or(false)
    }

    /// Resolve a write fault on a COW page: sole owners get their mapping
    /// upgraded in place, sharers get a private copy.
    pub fn resolve_cow(&mut self, addr: u32) -> KernelResult<()> {
        let pd_idx = pd_index(addr);
        let pt_idx = pt_index(addr);
        let entry = {
            let table = self.tables.get(&pd_idx).ok_or(KernelError::Invalid)?;
            table.entry(pt_idx)
        };
        let flags = entry_flags(entry);
        if !flags.contains(EntryFlags::PRESENT) || !flags.contains(EntryFlags::COW) {
            return Err(KernelError::Invalid);
        }
        let old = Frame::from_addr(entry_addr(entry));
        let resolved = (flags - EntryFlags::COW) | EntryFlags::WRITABLE;

        if memory::with_pool(|pool| pool.refcount(old)) == 1 {
            self.tables
                .get_mut(&pd_idx)
                .expect("checked above")
                .set_entry(pt_idx, make_entry(old.addr(), resolved));
            unsafe { tlb::flush(page_floor(addr) as usize) };
            return Ok(());
        }

        let fresh = memory::allocate_frame()?;
        let mut bounce = vec![0u8; PAGE_SIZE];
        with_frame(old, |page| bounce.copy_from_slice(page));
        with_frame(fresh, |page| page.copy_from_slice(&bounce));
        self.tables
            .get_mut(&pd_idx)
            .expect("checked above")
            .set_entry(pt_idx, make_entry(fresh.addr(), resolved));
        memory::with_pool(|pool| {
            if pool.ref_dec(old) == 0 {
                pool.deallocate(old);
            }
            pool.set_refcount(fresh, 1);
        });
        unsafe { tlb::flush(page_floor(addr) as usize) };
        Ok(())
    }

    /// Copy kernel bytes into this space's frames through the quick-map
    /// window. Every page of the destination must already be mapped.
    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> KernelResult<()> {
        let mut va = addr;
        let mut done = 0;
        while done < bytes.len() {
            let page_va = page_floor(va);
            let page_off = (va - page_va) as usize;
            let chunk = (PAGE_SIZE - page_off).min(bytes.len() - done);
            let entry = self.lookup(page_va).ok_or(KernelError::Invalid)?;
            let frame = Frame::from_addr(entry_addr(entry));
            with_frame(frame, |page| {
                page[page_off..page_off + chunk].copy_from_slice(&bytes[done..done + chunk]);
            });
            va += chunk as u32;
            done += chunk;
        }
        Ok(())
    }

    /// Read this space's memory into a kernel buffer, same constraints as
    /// write_bytes.
    pub fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> KernelResult<()> {
        let mut va = addr;
        let mut done = 0;
        while done < buf.len() {
            let page_va = page_floor(va);
            let page_off = (va - page_va) as usize;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            let entry = self.lookup(page_va).ok_or(KernelError::Invalid)?;
            let frame = Frame::from_addr(entry_addr(entry));
            with_frame(frame, |page| {
                buf[done..done + chunk].copy_from_slice(&page[page_off..page_off + chunk]);
            });
            va += chunk as u32;
            done += chunk;
        }
        Ok(())
    }

    /// Establish a page-aligned, non-overlapping, zero-filled RW region.
    pub fn new_pages(&mut self, base: u32, len: u32) -> KernelResult<()> {
        if base as usize % PAGE_SIZE != 0
            || len == 0
            || len as usize % PAGE_SIZE != 0
            || base < USER_MEM_START
        {
            return Err(KernelError::Invalid);
        }
        let end = base.checked_add(len - 1).ok_or(KernelError::Invalid)?;
        let mut va = base;
        loop {
            if self.lookup(va).is_some() {
                return Err(KernelError::Invalid);
            }
            if va == page_floor(end) {
                break;
            }
            va += PAGE_SIZE as u32;
        }
        self.map_segment(
            base,
            len,
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
        )?;
        self.regions.push(Region { base, len });
        Ok(())
    }

    /// Tear down the region previously established by new_pages at exactly
    /// this base.
    pub fn remove_pages(&mut self, base: u32) -> KernelResult<()> {
        let index = self
            .regions
            .iter()
            .position(|region| region.base == base)
            .ok_or(KernelError::Invalid)?;
        let region = self.regions.remove(index);
        self.unmap_range(region.base, region.len);
        Ok(())
    }

    /// Every page intersecting `[addr, addr + len)` is present and
    /// user-accessible.
    pub fn range_mapped_user(&self, addr: u32, len: u32) -> bool {
        self.check_range(addr, len, |flags| flags.contains(EntryFlags::USER))
    }

    /// Like range_mapped_user, but the pages must also be writable or
    /// copy-on-write.
    pub fn range_writable_user(&self, addr: u32, len: u32) -> bool {
        self.check_range(addr, len, |flags| {
            flags.contains(EntryFlags::USER)
                && (flags.contains(EntryFlags::WRITABLE) || flags.contains(EntryFlags::COW))
        })
    }

    fn check_range(&self, addr: u32, len: u32, ok: impl Fn(EntryFlags) -> bool) -> bool {
        if len == 0 {
            return true;
        }
        let end = match addr.checked_add(len - 1) {
            Some(end) => end,
            None => return false,
        };
        let mut va = page_floor(addr);
        loop {
            match self.lookup(va) {
                Some(entry) if ok(entry_flags(entry)) => {}
                _ => return false,
            }
            if va == page_floor(end) {
                break;
            }
            va += PAGE_SIZE as u32;
        }
        true
    }

    /// Sum of the reference counts of every frame mapped here. Used by the
    /// conservation checks.
    #[cfg(test)]
    pub fn mapped_page_count(&self) -> usize {
        let mut count = 0;
        for table in self.tables.values() {
            for i in 0..ENTRY_COUNT {
                if entry_flags(table.entry(i)).contains(EntryFlags::PRESENT) {
                    count += 1;
                }
            }
        }
        count
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        for table in self.tables.values_mut() {
            for i in 0..ENTRY_COUNT {
                let entry = table.entry(i);
                if entry_flags(entry).contains(EntryFlags::PRESENT) {
                    let frame = Frame::from_addr(entry_addr(entry));
                    table.set_entry(i, 0);
                    memory::with_pool(|pool| {
                        if pool.ref_dec(frame) == 0 {
                            pool.deallocate(frame);
                        }
                    });
                }
            }
        }
        self.tables.clear();
    }
}

/// Build the address space for a freshly loaded program: text and rodata
/// read-only, data and bss writable, plus the initial stack below
/// STACK_START. Contents are copied in by the loader afterwards.
pub fn address_space_for_program(elf: &SimpleElf) -> KernelResult<AddressSpace> {
    let mut space = AddressSpace::new();
    let user_ro = EntryFlags::PRESENT | EntryFlags::USER;
    let user_rw = user_ro | EntryFlags::WRITABLE;
    space.map_segment(elf.text.start, elf.text.len, user_ro)?;
    space.map_segment(elf.rodata.start, elf.rodata.len, user_ro)?;
    space.map_segment(elf.data.start, elf.data.len, user_rw)?;
    space.map_segment(elf.bss.start, elf.bss.len, user_rw)?;
    space.map_segment(STACK_START - DEFAULT_STACK_SIZE, DEFAULT_STACK_SIZE, user_rw)?;
    Ok(space)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::elf::{SimpleElf, SectionRange};

    fn sample_elf() -> SimpleElf {
        SimpleElf {
            entry: 0x0100_0000,
            text: SectionRange {
                start: 0x0100_0000,
                len: 0x1800,
                offset: 0,
            },
            rodata: SectionRange {
                start: 0x0100_2000,
                len: 0x200,
                offset: 0,
            },
            data: SectionRange {
                start: 0x0100_3000,
                len: 0x400,
                offset: 0,
            },
            bss: SectionRange {
                start: 0x0100_3400,
                len: 0x2000,
                offset: 0,
            },
        }
    }

    #[test_case]
    fn program_space_has_expected_protections() {
        let free_before = memory::free_frame_count();
        let space = address_space_for_program(&sample_elf()).unwrap();

        let text = entry_flags(space.lookup(0x0100_0000).unwrap());
        assert!(text.contains(EntryFlags::PRESENT | EntryFlags::USER));
        assert!(!text.contains(EntryFlags::WRITABLE));

        let data = entry_flags(space.lookup(0x0100_3000).unwrap());
        assert!(data.contains(EntryFlags::WRITABLE));

        // data and bss share the 0x0100_3000 page; it must be writable.
        let stack = entry_flags(space.lookup(STACK_START - 4).unwrap());
        assert!(stack.contains(EntryFlags::WRITABLE | EntryFlags::USER));

        assert!(space.lookup(0x0200_0000).is_none());

        drop(space);
        assert_eq!(memory::free_frame_count(), free_before);
    }

    #[test_case]
    fn demand_zero_pages_are_zeroed() {
        let mut space = address_space_for_program(&sample_elf()).unwrap();
        let mut buf = [0xFFu8; 64];
        space.read_bytes(0x0100_3400, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        space.write_bytes(0x0100_3400, &[1, 2, 3]).unwrap();
        space.read_bytes(0x0100_3400, &mut buf).unwrap();
        assert_eq!(&buf[..3], &[1, 2, 3]);
        drop(space);
    }

    #[test_case]
    fn cow_clone_shares_frames_read_only() {
        let free_before = memory::free_frame_count();
        let mut parent = address_space_for_program(&sample_elf()).unwrap();
        let pages = parent.mapped_page_count();

        let child = parent.clone_cow();
        // No user frames were consumed by the clone itself.
        assert_eq!(memory::free_frame_count(), free_before - pages);

        let parent_data = entry_flags(parent.lookup(0x0100_3000).unwrap());
        let child_data = entry_flags(child.lookup(0x0100_3000).unwrap());
        for flags in [parent_data, child_data] {
            assert!(flags.contains(EntryFlags::COW));
            assert!(!flags.contains(EntryFlags::WRITABLE));
        }

        // Read-only text is shared without the COW mark.
        let child_text = entry_flags(child.lookup(0x0100_0000).unwrap());
        assert!(!child_text.contains(EntryFlags::COW));

        let frame = Frame::from_addr(entry_addr(parent.lookup(0x0100_3000).unwrap()));
        assert_eq!(memory::with_pool(|pool| pool.refcount(frame)), 2);

        drop(child);
        drop(parent);
        assert_eq!(memory::free_frame_count(), free_before);
    }

    #[test_case]
    fn cow_write_materialises_private_copy() {
        let free_before = memory::free_frame_count();
        let mut parent = address_space_for_program(&sample_elf()).unwrap();
        parent.write_bytes(0x0100_3000, &[0xAA]).unwrap();

        let mut child = parent.clone_cow();
        let shared_free = memory::free_frame_count();

        // First write in the child copies the page.
        child.resolve_cow(0x0100_3000).unwrap();
        child.write_bytes(0x0100_3000, &[0x55]).unwrap();
        assert_eq!(memory::free_frame_count(), shared_free - 1);

        let mut byte = [0u8];
        child.read_bytes(0x0100_3000, &mut byte).unwrap();
        assert_eq!(byte[0], 0x55);
        parent.read_bytes(0x0100_3000, &mut byte).unwrap();
        assert_eq!(byte[0], 0xAA);

        // The parent is now the frame's sole owner: its fault resolves in
        // place without another copy.
        parent.resolve_cow(0x0100_3000).unwrap();
        let parent_data = entry_flags(parent.lookup(0x0100_3000).unwrap());
        assert!(parent_data.contains(EntryFlags::WRITABLE));
        assert!(!parent_data.contains(EntryFlags::COW));
        assert_eq!(memory::free_frame_count(), shared_free - 1);

        drop(child);
        drop(parent);
        assert_eq!(memory::free_frame_count(), free_before);
    }

    #[test_case]
    fn new_pages_rejects_bad_and_overlapping_ranges() {
        let mut space = AddressSpace::new();
        assert_eq!(
            space.new_pages(0x0200_0801, PAGE_SIZE as u32),
            Err(KernelError::Invalid)
        );
        assert_eq!(space.new_pages(0x0200_0000, 100), Err(KernelError::Invalid));
        assert_eq!(space.new_pages(0x0010_0000, PAGE_SIZE as u32), Err(KernelError::Invalid));

        space.new_pages(0x0200_0000, 2 * PAGE_SIZE as u32).unwrap();
        assert_eq!(
            space.new_pages(0x0200_1000, PAGE_SIZE as u32),
            Err(KernelError::Invalid)
        );
        drop(space);
    }

    #[test_case]
    fn new_pages_remove_pages_conserves_frames() {
        let free_before = memory::free_frame_count();
        let mut space = AddressSpace::new();
        space.new_pages(0x0300_0000, 4 * PAGE_SIZE as u32).unwrap();
        assert_eq!(memory::free_frame_count(), free_before - 4);
        // The boundary must match the prior call exactly.
        assert_eq!(space.remove_pages(0x0300_1000), Err(KernelError::Invalid));
        space.remove_pages(0x0300_0000).unwrap();
        assert_eq!(memory::free_frame_count(), free_before);
        drop(space);
    }

    #[test_case]
    fn pointer_validation_walks_the_tables() {
        let mut parent = address_space_for_program(&sample_elf()).unwrap();
        assert!(parent.range_mapped_user(0x0100_0000, 0x1800));
        assert!(!parent.range_mapped_user(0x0100_0000, 0x20000));
        assert!(!parent.range_mapped_user(0xDEAD_0000, 4));
        assert!(parent.range_writable_user(0x0100_3000, 4));
        assert!(!parent.range_writable_user(0x0100_0000, 4));

        // COW pages still count as writable for validation.
        let child = parent.clone_cow();
        assert!(child.range_writable_user(0x0100_3000, 4));
        drop(child);
        drop(parent);
    }
}
