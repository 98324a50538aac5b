//! Binary interface shared with the controlling process. Layouts and ioctl
//! numbers follow `<linux/kvm.h>` for x86_64.

#![allow(non_upper_case_globals)]

use core::mem::size_of;

/// Version reported by `KVM_GET_API_VERSION`.
pub const KVM_API_VERSION: usize = 12;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const KVMIO: u32 = 0xAE;

const fn ioc(dir: u32, ty: u32, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | (ty << 8) | nr
}

const fn io(nr: u32) -> u32 {
    ioc(IOC_NONE, KVMIO, nr, 0)
}

const fn ior<T>(nr: u32) -> u32 {
    ioc(IOC_READ, KVMIO, nr, size_of::<T>())
}

const fn iow<T>(nr: u32) -> u32 {
    ioc(IOC_WRITE, KVMIO, nr, size_of::<T>())
}

pub const KVM_GET_API_VERSION: u32 = io(0x00);
pub const KVM_CREATE_VM: u32 = io(0x01);
pub const KVM_CHECK_EXTENSION: u32 = io(0x03);
pub const KVM_GET_VCPU_MMAP_SIZE: u32 = io(0x04);

pub const KVM_CREATE_VCPU: u32 = io(0x41);
pub const KVM_SET_USER_MEMORY_REGION: u32 = iow::<KvmUserspaceMemoryRegion>(0x46);
pub const KVM_SET_TSS_ADDR: u32 = io(0x47);

pub const KVM_RUN: u32 = io(0x80);
pub const KVM_GET_REGS: u32 = ior::<KvmRegs>(0x81);
pub const KVM_SET_REGS: u32 = iow::<KvmRegs>(0x82);
pub const KVM_GET_SREGS: u32 = ior::<KvmSregs>(0x83);
pub const KVM_SET_SREGS: u32 = iow::<KvmSregs>(0x84);

pub const KVM_EXIT_UNKNOWN: u32 = 0;
pub const KVM_EXIT_IO: u32 = 2;
pub const KVM_EXIT_HLT: u32 = 5;
pub const KVM_EXIT_SHUTDOWN: u32 = 8;
pub const KVM_EXIT_FAIL_ENTRY: u32 = 9;

pub const KVM_EXIT_IO_IN: u8 = 1;
pub const KVM_EXIT_IO_OUT: u8 = 0;

/// `struct kvm_regs`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// `struct kvm_segment`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmSegment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
    pub unusable: u8,
    pub padding: u8,
}

/// `struct kvm_dtable`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmDtable {
    pub base: u64,
    pub limit: u16,
    pub padding: [u16; 3],
}

/// `struct kvm_sregs`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmSregs {
    pub cs: KvmSegment,
    pub ds: KvmSegment,
    pub es: KvmSegment,
    pub fs: KvmSegment,
    pub gs: KvmSegment,
    pub ss: KvmSegment,
    pub tr: KvmSegment,
    pub ldt: KvmSegment,
    pub gdt: KvmDtable,
    pub idt: KvmDtable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    pub interrupt_bitmap: [u64; 4],
}

/// `struct kvm_userspace_memory_region`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmUserspaceMemoryRegion {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

/// `kvm_run.io`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmRunExitIo {
    pub direction: u8,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    /// Offset of the data bytes from the start of the run page.
    pub data_offset: u64,
}

/// `kvm_run.fail_entry`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmRunExitFailEntry {
    pub hardware_entry_failure_reason: u64,
    pub cpu: u32,
}

/// `kvm_run.hw`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvmRunExitUnknown {
    pub hardware_exit_reason: u64,
}

/// The exit-specific part of `struct kvm_run`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union KvmRunExit {
    pub hw: KvmRunExitUnknown,
    pub fail_entry: KvmRunExitFailEntry,
    pub io: KvmRunExitIo,
    pub padding: [u8; 256],
}

/// The head of `struct kvm_run`, the page shared with the controlling
/// process through `mmap` on a VCPU handle.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct KvmRun {
    pub request_interrupt_window: u8,
    pub immediate_exit: u8,
    pub padding1: [u8; 6],
    pub exit_reason: u32,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub flags: u16,
    pub cr8: u64,
    pub apic_base: u64,
    pub exit: KvmRunExit,
}

impl KvmRun {
    /// Where the data of an I/O exit is placed in the run page.
    pub const IO_DATA_OFFSET: usize = size_of::<KvmRun>();
}

impl core::fmt::Debug for KvmRun {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("KvmRun")
            .field("immediate_exit", &self.immediate_exit)
            .field("exit_reason", &self.exit_reason)
            .field("cr8", &self.cr8)
            .field("apic_base", &self.apic_base)
            .finish_non_exhaustive()
    }
}
