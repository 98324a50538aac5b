//! A simulated kernel ([`MockHal`]) and VT-x processor ([`MockCpu`]).
//!
//! All state is thread-local, so every test owns an independent machine.
//! Call [`MockHal::reset`] at the start of a test.

extern crate std;

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::vec::Vec;

use bit_field::BitField;
use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;
use x86::dtables::DescriptorTablePointer;
use x86::vmx::{Result as VmResult, VmFail};

use crate::msr::Msr;
use crate::vmx::{HostSelectors, LaunchFrame, VmxCpu, adjust_controls};
use crate::{HostPhysAddr, HostVirtAddr, VmmHal};

const VM_INSTRUCTION_ERROR: u32 = 0x4400;
const EXIT_REASON: u32 = 0x4402;
const VMEXIT_INSTRUCTION_LEN: u32 = 0x440C;
const EXIT_QUALIFICATION: u32 = 0x6400;

const PINBASED_EXEC_CONTROLS: u32 = 0x4000;
const PRIMARY_PROCBASED_EXEC_CONTROLS: u32 = 0x4002;
const VMEXIT_CONTROLS: u32 = 0x400C;
const VMENTRY_CONTROLS: u32 = 0x4012;
const SECONDARY_PROCBASED_EXEC_CONTROLS: u32 = 0x401E;
const HOST_CR4: u32 = 0x6C04;
const HOST_RSP: u32 = 0x6C14;
const HOST_RIP: u32 = 0x6C16;

const CR4_VMXE: u64 = 1 << 13;

const KERNEL_CS_DESC: u64 = 0x00af_9b00_0000_ffff;
const KERNEL_SS_DESC: u64 = 0x00cf_9300_0000_ffff;
// Busy 64-bit TSS at `MockCpu::HOST_TSS_BASE`, limit 0x67.
const KERNEL_TSS_LOW: u64 = 0x1200_8b34_5000_0067;
const KERNEL_TSS_HIGH: u64 = 0xffff_8000;

static HOST_GDT: [u64; 5] = [0, KERNEL_CS_DESC, KERNEL_SS_DESC, KERNEL_TSS_LOW, KERNEL_TSS_HIGH];

/// A VM exit the simulated processor produces on the next successful entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockExit {
    pub reason: u32,
    pub instruction_length: u32,
    pub qualification: u64,
    pub entry_failure: bool,
}

impl MockExit {
    pub fn new(reason: u32, instruction_length: u32) -> Self {
        Self {
            reason,
            instruction_length,
            qualification: 0,
            entry_failure: false,
        }
    }

    pub fn with_qualification(mut self, qualification: u64) -> Self {
        self.qualification = qualification;
        self
    }

    /// A VM-entry failure reported as an exit with bit 31 set.
    pub fn entry_failure(reason: u32) -> Self {
        Self {
            entry_failure: true,
            ..Self::new(reason, 0)
        }
    }
}

#[derive(Debug, Default)]
struct MockCore {
    cr4: u64,
    vmxon_region: Option<u64>,
    current_vmcs: Option<u64>,
}

#[derive(Debug, Default)]
struct MockVmcs {
    fields: BTreeMap<u32, u64>,
    launched: bool,
}

struct MockState {
    current_cpu: usize,
    cores: Vec<MockCore>,
    has_vmx: bool,
    msrs: BTreeMap<u32, u64>,
    vmcs: BTreeMap<u64, MockVmcs>,
    exits: VecDeque<MockExit>,
    entry_log: Vec<bool>,
    fail_next_entry: Option<u32>,
    allocations: BTreeMap<usize, usize>,
    allocations_left: Option<usize>,
    last_alloc_node: Option<usize>,
}

impl MockState {
    fn new(cpu_count: usize) -> Self {
        let mut msrs = BTreeMap::new();
        for (msr, value) in [
            (Msr::IA32_FEATURE_CONTROL, 0x5),
            (Msr::IA32_SYSENTER_CS, 0),
            (Msr::IA32_SYSENTER_ESP, 0),
            (Msr::IA32_SYSENTER_EIP, 0),
            (Msr::IA32_PAT, 0x0007_0406_0007_0406),
            (
                Msr::IA32_VMX_BASIC,
                vmx_basic(MockCpu::DEFAULT_REVISION_ID, 0x1000, true),
            ),
            (Msr::IA32_VMX_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (Msr::IA32_VMX_PROCBASED_CTLS, 0xfff9_fffe_0401_e172),
            (Msr::IA32_VMX_EXIT_CTLS, 0x00ff_ffff_0003_6dff),
            (Msr::IA32_VMX_ENTRY_CTLS, 0x0000_ffff_0000_11ff),
            (Msr::IA32_VMX_CR0_FIXED0, 0x8000_0021),
            (Msr::IA32_VMX_CR0_FIXED1, 0xffff_ffff),
            (Msr::IA32_VMX_CR4_FIXED0, CR4_VMXE),
            (Msr::IA32_VMX_CR4_FIXED1, 0x0037_27ff),
            (Msr::IA32_VMX_PROCBASED_CTLS2, 0x0053_7fff_0000_0000),
            (Msr::IA32_VMX_TRUE_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (Msr::IA32_VMX_TRUE_PROCBASED_CTLS, 0xfff9_fffe_0400_6172),
            (Msr::IA32_VMX_TRUE_EXIT_CTLS, 0x00ff_ffff_0003_6dfb),
            (Msr::IA32_VMX_TRUE_ENTRY_CTLS, 0x0000_ffff_0000_11fb),
            (Msr::IA32_EFER, 0xd01),
            (Msr::IA32_FS_BASE, 0),
            (Msr::IA32_GS_BASE, 0xffff_8000_0fe0_0000),
        ] {
            msrs.insert(msr as u32, value);
        }
        Self {
            current_cpu: 0,
            cores: (0..cpu_count)
                .map(|_| MockCore {
                    cr4: MockCpu::HOST_CR4,
                    ..Default::default()
                })
                .collect(),
            has_vmx: true,
            msrs,
            vmcs: BTreeMap::new(),
            exits: VecDeque::new(),
            entry_log: Vec::new(),
            fail_next_entry: None,
            allocations: BTreeMap::new(),
            allocations_left: None,
            last_alloc_node: None,
        }
    }

    fn core(&mut self) -> &mut MockCore {
        let cpu = self.current_cpu;
        &mut self.cores[cpu]
    }

    fn current_vmcs(&mut self) -> Option<&mut MockVmcs> {
        let paddr = self.core().current_vmcs?;
        Some(self.vmcs.entry(paddr).or_default())
    }

    /// `VMfailValid(code)` with a current VMCS, `VMfailInvalid` without.
    fn fail(&mut self, code: u32) -> VmResult<()> {
        match self.current_vmcs() {
            Some(vmcs) => {
                vmcs.fields.insert(VM_INSTRUCTION_ERROR, code as u64);
                Err(VmFail::VmFailValid)
            }
            None => Err(VmFail::VmFailInvalid),
        }
    }

    fn revision_id(&self) -> u32 {
        self.msrs[&(Msr::IA32_VMX_BASIC as u32)] as u32
    }

    fn control_cap(&self, msr: Msr) -> u64 {
        let true_ctls = self.msrs[&(Msr::IA32_VMX_BASIC as u32)].get_bit(55);
        let msr = if true_ctls { msr.true_ctls() } else { msr };
        self.msrs[&(msr as u32)]
    }
}

fn vmx_basic(revision: u32, region_size: u32, true_ctls: bool) -> u64 {
    let mut msr = revision as u64;
    msr.set_bits(32..45, region_size as u64);
    msr.set_bits(50..54, 6);
    msr.set_bit(54, true);
    msr.set_bit(55, true_ctls);
    msr
}

fn region_revision(paddr: u64) -> u32 {
    unsafe { *(paddr as *const u32) }
}

std::thread_local! {
    static STATE: RefCell<MockState> = RefCell::new(MockState::new(1));
}

fn with_state<R>(f: impl FnOnce(&mut MockState) -> R) -> R {
    STATE.with(|state| f(&mut state.borrow_mut()))
}

/// Simulated kernel: an allocator counting outstanding frames, CPU topology
/// with two CPUs per NUMA node, and user memory backed by process memory.
#[derive(Debug)]
pub struct MockHal;

impl MockHal {
    /// Resets the machine to a single CPU with VMX available.
    pub fn reset() {
        with_state(|state| *state = MockState::new(1));
    }

    /// Resizes the machine to `count` CPUs. Call right after [`MockHal::reset`].
    pub fn set_cpu_count(count: usize) {
        with_state(|state| {
            state.cores.resize_with(count, || MockCore {
                cr4: MockCpu::HOST_CR4,
                ..Default::default()
            })
        });
    }

    pub fn cpu_node(cpu: usize) -> Option<usize> {
        Some(cpu / 2)
    }

    /// Runs `f` as if pinned to `cpu`.
    pub fn run_on<R>(cpu: usize, f: impl FnOnce() -> R) -> R {
        let previous = with_state(|state| core::mem::replace(&mut state.current_cpu, cpu));
        let result = f();
        with_state(|state| state.current_cpu = previous);
        result
    }

    /// Lets the next `count` allocations succeed and fails all later ones.
    pub fn fail_allocations_after(count: usize) {
        with_state(|state| state.allocations_left = Some(count));
    }

    pub fn outstanding_frames() -> usize {
        with_state(|state| state.allocations.values().sum())
    }

    pub fn last_alloc_node() -> Option<usize> {
        with_state(|state| state.last_alloc_node)
    }
}

impl VmmHal for MockHal {
    type Cpu = MockCpu;

    fn alloc_contiguous_frames(count: usize, node: Option<usize>) -> Option<HostPhysAddr> {
        with_state(|state| {
            if let Some(left) = state.allocations_left.as_mut() {
                if *left == 0 {
                    return None;
                }
                *left -= 1;
            }
            let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).ok()?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return None;
            }
            state.allocations.insert(ptr as usize, count);
            state.last_alloc_node = node;
            Some(HostPhysAddr::from(ptr as usize))
        })
    }

    fn dealloc_contiguous_frames(paddr: HostPhysAddr, count: usize) {
        // Frames from before the last reset are leaked.
        let known = with_state(|state| state.allocations.remove(&paddr.as_usize()));
        if known != Some(count) {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE) {
            unsafe { dealloc(paddr.as_usize() as *mut u8, layout) };
        }
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }

    fn cpu_count() -> usize {
        with_state(|state| state.cores.len())
    }

    fn cpu_to_node(cpu: usize) -> Option<usize> {
        Self::cpu_node(cpu)
    }

    fn run_pinned<R>(f: impl FnOnce(usize) -> R) -> R {
        let cpu = with_state(|state| state.current_cpu);
        f(cpu)
    }

    fn on_each_cpu(f: &(dyn Fn(usize) + Sync)) {
        for cpu in 0..Self::cpu_count() {
            Self::run_on(cpu, || f(cpu));
        }
    }

    fn copy_from_user(dst: &mut [u8], src: usize) -> bool {
        if src < PAGE_SIZE {
            return false;
        }
        unsafe { core::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len()) };
        true
    }

    fn copy_to_user(dst: usize, src: &[u8]) -> bool {
        if dst < PAGE_SIZE {
            return false;
        }
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len()) };
        true
    }
}

/// Simulated VT-x processor of the current mock CPU.
#[derive(Debug)]
pub struct MockCpu;

impl MockCpu {
    pub const DEFAULT_REVISION_ID: u32 = 0x4;
    pub const HOST_CR0: u64 = 0x8005_0033;
    pub const HOST_CR3: u64 = 0x0000_0000_0234_5000;
    pub const HOST_CR4: u64 = 0x0000_06f0;
    pub const HOST_CS: u16 = 0x08;
    pub const HOST_SS: u16 = 0x10;
    pub const HOST_TR: u16 = 0x18;
    pub const HOST_TSS_BASE: u64 = 0xffff_8000_1234_5000;
    pub const HOST_IDT_BASE: u64 = 0xffff_8000_0011_0000;
    pub const EXIT_TRAMPOLINE: u64 = 0xffff_8000_0010_2030;

    pub fn set_has_vmx(has_vmx: bool) {
        with_state(|state| state.has_vmx = has_vmx);
    }

    pub fn set_feature_control(value: u64) {
        with_state(|state| state.msrs.insert(Msr::IA32_FEATURE_CONTROL as u32, value));
    }

    /// Reprograms `IA32_VMX_BASIC` (write-back memory type).
    pub fn set_vmx_basic(revision: u32, region_size: u32, true_ctls: bool) {
        with_state(|state| {
            state.msrs.insert(
                Msr::IA32_VMX_BASIC as u32,
                vmx_basic(revision, region_size, true_ctls),
            )
        });
    }

    pub fn in_vmx_operation(cpu: usize) -> bool {
        with_state(|state| state.cores[cpu].vmxon_region.is_some())
    }

    pub fn cr4_vmxe(cpu: usize) -> bool {
        with_state(|state| state.cores[cpu].cr4 & CR4_VMXE != 0)
    }

    pub fn current_vmcs(cpu: usize) -> Option<u64> {
        with_state(|state| state.cores[cpu].current_vmcs)
    }

    /// A field of the VMCS at `paddr` as last written, `None` if never written.
    pub fn vmcs_field(paddr: u64, field: u32) -> Option<u64> {
        with_state(|state| state.vmcs.get(&paddr)?.fields.get(&field).copied())
    }

    /// Queues exits for the following successful entries. Entries without a
    /// queued exit exit on a one-byte HLT.
    pub fn script_exits(exits: &[MockExit]) {
        with_state(|state| state.exits.extend(exits.iter().copied()));
    }

    /// Makes the next entry fail with VM-instruction error `code`.
    pub fn fail_next_entry(code: u32) {
        with_state(|state| state.fail_next_entry = Some(code));
    }

    /// The `launched` argument of every entry attempted so far.
    pub fn entry_log() -> Vec<bool> {
        with_state(|state| state.entry_log.clone())
    }

    fn check_controls(state: &MockState, vmcs: &MockVmcs) -> bool {
        let field = |f: u32| vmcs.fields.get(&f).copied().unwrap_or(0) as u32;
        let legal = |value: u32, cap: u64| adjust_controls(cap, value) == value;
        let primary = field(PRIMARY_PROCBASED_EXEC_CONTROLS);
        let secondary_ok = !primary.get_bit(31)
            || legal(
                field(SECONDARY_PROCBASED_EXEC_CONTROLS),
                state.msrs[&(Msr::IA32_VMX_PROCBASED_CTLS2 as u32)],
            );
        legal(
            field(PINBASED_EXEC_CONTROLS),
            state.control_cap(Msr::IA32_VMX_PINBASED_CTLS),
        ) && legal(primary, state.control_cap(Msr::IA32_VMX_PROCBASED_CTLS))
            && legal(
                field(VMEXIT_CONTROLS),
                state.control_cap(Msr::IA32_VMX_EXIT_CTLS),
            )
            && legal(
                field(VMENTRY_CONTROLS),
                state.control_cap(Msr::IA32_VMX_ENTRY_CTLS),
            )
            && secondary_ok
    }

    fn check_host_state(vmcs: &MockVmcs) -> bool {
        let field = |f: u32| vmcs.fields.get(&f).copied().unwrap_or(0);
        field(HOST_CR4) & CR4_VMXE != 0 && field(HOST_RIP) != 0 && field(HOST_RSP) != 0
    }
}

impl VmxCpu for MockCpu {
    fn has_vmx() -> bool {
        with_state(|state| state.has_vmx)
    }

    fn read_msr(msr: u32) -> u64 {
        with_state(|state| state.msrs.get(&msr).copied().unwrap_or(0))
    }

    unsafe fn write_msr(msr: u32, value: u64) {
        with_state(|state| state.msrs.insert(msr, value));
    }

    fn read_cr0() -> u64 {
        Self::HOST_CR0
    }

    fn read_cr3() -> u64 {
        Self::HOST_CR3
    }

    fn read_cr4() -> u64 {
        with_state(|state| state.core().cr4)
    }

    unsafe fn write_cr4(value: u64) {
        with_state(|state| state.core().cr4 = value);
    }

    fn host_selectors() -> HostSelectors {
        HostSelectors {
            cs: Self::HOST_CS,
            ss: Self::HOST_SS,
            tr: Self::HOST_TR,
            ..Default::default()
        }
    }

    fn sgdt() -> DescriptorTablePointer<u64> {
        DescriptorTablePointer {
            limit: (core::mem::size_of_val(&HOST_GDT) - 1) as u16,
            base: HOST_GDT.as_ptr(),
        }
    }

    fn sidt() -> DescriptorTablePointer<u64> {
        DescriptorTablePointer {
            limit: 0xfff,
            base: Self::HOST_IDT_BASE as *const u64,
        }
    }

    unsafe fn vmxon(paddr: u64) -> VmResult<()> {
        with_state(|state| {
            let revision = state.revision_id();
            let core = state.core();
            if core.cr4 & CR4_VMXE == 0 || core.vmxon_region.is_some() {
                return Err(VmFail::VmFailInvalid);
            }
            if region_revision(paddr) != revision {
                return Err(VmFail::VmFailInvalid);
            }
            core.vmxon_region = Some(paddr);
            Ok(())
        })
    }

    unsafe fn vmxoff() -> VmResult<()> {
        with_state(|state| {
            let core = state.core();
            if core.vmxon_region.take().is_none() {
                return Err(VmFail::VmFailInvalid);
            }
            core.current_vmcs = None;
            Ok(())
        })
    }

    unsafe fn vmptrld(paddr: u64) -> VmResult<()> {
        with_state(|state| {
            let vmxon_region = state.core().vmxon_region;
            match vmxon_region {
                None => return Err(VmFail::VmFailInvalid),
                Some(vmxon) if vmxon == paddr => return state.fail(10),
                Some(_) => {}
            }
            if region_revision(paddr) != state.revision_id() {
                return state.fail(11);
            }
            state.core().current_vmcs = Some(paddr);
            state.vmcs.entry(paddr).or_default();
            Ok(())
        })
    }

    unsafe fn vmclear(paddr: u64) -> VmResult<()> {
        with_state(|state| {
            let vmxon_region = state.core().vmxon_region;
            match vmxon_region {
                None => return Err(VmFail::VmFailInvalid),
                Some(vmxon) if vmxon == paddr => return state.fail(3),
                Some(_) => {}
            }
            state.vmcs.entry(paddr).or_default().launched = false;
            let core = state.core();
            if core.current_vmcs == Some(paddr) {
                core.current_vmcs = None;
            }
            Ok(())
        })
    }

    fn vmread(field: u32) -> VmResult<u64> {
        with_state(|state| match state.current_vmcs() {
            Some(vmcs) => Ok(vmcs.fields.get(&field).copied().unwrap_or(0)),
            None => Err(VmFail::VmFailInvalid),
        })
    }

    unsafe fn vmwrite(field: u32, value: u64) -> VmResult<()> {
        with_state(|state| {
            if state.current_vmcs().is_none() {
                return Err(VmFail::VmFailInvalid);
            }
            if field.get_bits(10..12) == 1 {
                // VMWRITE to a read-only VMCS component.
                return state.fail(13);
            }
            if let Some(vmcs) = state.current_vmcs() {
                vmcs.fields.insert(field, value);
            }
            Ok(())
        })
    }

    unsafe fn vm_enter(_frame: *mut LaunchFrame, launched: bool) -> VmResult<()> {
        with_state(|state| {
            let Some(paddr) = state.core().current_vmcs else {
                return Err(VmFail::VmFailInvalid);
            };
            state.entry_log.push(launched);
            if let Some(code) = state.fail_next_entry.take() {
                return state.fail(code);
            }
            let vmcs = &state.vmcs[&paddr];
            let was_launched = vmcs.launched;
            let controls_ok = Self::check_controls(state, vmcs);
            let host_state_ok = Self::check_host_state(vmcs);
            if !launched && was_launched {
                return state.fail(4);
            }
            if launched && !was_launched {
                return state.fail(5);
            }
            if !controls_ok {
                return state.fail(7);
            }
            if !host_state_ok {
                return state.fail(8);
            }

            let exit = state
                .exits
                .pop_front()
                .unwrap_or_else(|| MockExit::new(12, 1));
            let vmcs = state.vmcs.entry(paddr).or_default();
            let mut reason = exit.reason as u64;
            reason.set_bit(31, exit.entry_failure);
            vmcs.fields.insert(EXIT_REASON, reason);
            vmcs.fields.insert(EXIT_QUALIFICATION, exit.qualification);
            vmcs.fields
                .insert(VMEXIT_INSTRUCTION_LEN, exit.instruction_length as u64);
            // A failed entry leaves the VMCS unlaunched.
            vmcs.launched = !exit.entry_failure;
            Ok(())
        })
    }

    fn exit_trampoline() -> u64 {
        Self::EXIT_TRAMPOLINE
    }
}
