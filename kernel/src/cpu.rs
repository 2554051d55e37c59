use core::cell::UnsafeCell;
use core::mem::size_of;

use conquer_once::spin::OnceCell;
use x86::Ring;
use x86::dtables::{DescriptorTablePointer, lgdt};
use x86::segmentation::{SegmentSelector, load_ds, load_es, load_fs, load_gs, load_ss};
use x86::task::load_tr;

pub const KERNEL_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(1, Ring::Ring0);
pub const KERNEL_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(2, Ring::Ring0);
pub const USER_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(3, Ring::Ring3);
pub const USER_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(4, Ring::Ring3);
const TSS_SELECTOR: SegmentSelector = SegmentSelector::new(5, Ring::Ring0);

// Flat 4 GiB segments, 32-bit, 4 KiB granularity.
const KERNEL_CODE_DESC: u64 = 0x00CF9A000000FFFF;
const KERNEL_DATA_DESC: u64 = 0x00CF92000000FFFF;
const USER_CODE_DESC: u64 = 0x00CFFA000000FFFF;
const USER_DATA_DESC: u64 = 0x00CFF2000000FFFF;

/// 32-bit task state segment. Only `esp0`/`ss0` matter: they tell the CPU
/// where the kernel stack starts when a trap arrives from ring 3.
#[repr(C, packed)]
pub struct TaskStateSegment {
    link: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldtr: u32,
    iopb: u32,
}

impl TaskStateSegment {
    const fn new() -> TaskStateSegment {
        TaskStateSegment {
            link: 0,
            esp0: 0,
            ss0: 0,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldtr: 0,
            iopb: size_of::<TaskStateSegment>() as u32,
        }
    }
}

fn tss_descriptor(tss: &TaskStateSegment) -> u64 {
    let base = tss as *const TaskStateSegment as u64;
    let limit = (size_of::<TaskStateSegment>() - 1) as u64;
    let mut desc = limit & 0xFFFF;
    desc |= (base & 0xFF_FFFF) << 16;
    desc |= 0x89 << 40; // present, 32-bit available TSS
    desc |= ((limit >> 16) & 0xF) << 48;
    desc |= ((base >> 24) & 0xFF) << 56;
    desc
}

/// Per-CPU data. There is exactly one CPU on this machine, but keeping the
/// shape makes the esp0 update on context switch explicit.
pub struct PerCpu {
    gdt: [u64; 6],
    tss: TaskStateSegment,
}

impl PerCpu {
    const fn new() -> PerCpu {
        PerCpu {
            gdt: [0; 6],
            tss: TaskStateSegment::new(),
        }
    }
}

/// The per-CPU slot. Safe because the single CPU only ever touches its own
/// entry, and esp0 updates happen with interrupts disabled.
pub struct Cpus {
    cpu: UnsafeCell<PerCpu>,
}

unsafe impl Send for Cpus {}
unsafe impl Sync for Cpus {}

impl Cpus {
    #[allow(clippy::mut_from_ref)]
    fn get_cpu(&self) -> &mut PerCpu {
        unsafe { &mut *self.cpu.get() }
    }
}

static CPUS: OnceCell<Cpus> = OnceCell::uninit();

/// Install the GDT and TSS and reload every segment register.
pub fn init() {
    CPUS.init_once(|| Cpus {
        cpu: UnsafeCell::new(PerCpu::new()),
    });
    let cpu = CPUS.get().expect("just initialised").get_cpu();

    cpu.tss.ss0 = KERNEL_DATA_SELECTOR.bits() as u32;
    cpu.gdt = [
        0,
        KERNEL_CODE_DESC,
        KERNEL_DATA_DESC,
        USER_CODE_DESC,
        USER_DATA_DESC,
        tss_descriptor(&cpu.tss),
    ];

    unsafe {
        let pointer = DescriptorTablePointer {
            limit: (size_of::<[u64; 6]>() - 1) as u16,
            base: cpu.gdt.as_ptr(),
        };
        lgdt(&pointer);

        // CS can only be reloaded with a far return.
        core::arch::asm!(
            "push {sel}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            sel = const 0x08,
            tmp = out(reg) _,
        );

        load_ss(KERNEL_DATA_SELECTOR);
        load_ds(KERNEL_DATA_SELECTOR);
        load_es(KERNEL_DATA_SELECTOR);
        load_fs(KERNEL_DATA_SELECTOR);
        load_gs(KERNEL_DATA_SELECTOR);

        load_tr(TSS_SELECTOR);
    }
}

/// Point esp0 at the next thread's kernel stack top. Interrupts must be
/// disabled; the very next trap from ring 3 lands on this stack.
pub fn set_kernel_stack(top: u32) {
    CPUS.get().expect("cpu not initialised").get_cpu().tss.esp0 = top;
}

pub fn load_user_data_segments() {
    unsafe {
        load_ds(USER_DATA_SELECTOR);
        load_es(USER_DATA_SELECTOR);
        load_fs(USER_DATA_SELECTOR);
        load_gs(USER_DATA_SELECTOR);
    }
}

pub fn load_kernel_data_segments() {
    unsafe {
        load_ds(KERNEL_DATA_SELECTOR);
        load_es(KERNEL_DATA_SELECTOR);
        load_fs(KERNEL_DATA_SELECTOR);
        load_gs(KERNEL_DATA_SELECTOR);
    }
}
