use alloc::sync::Arc;
use core::fmt;

use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;
use spin::Mutex;

use crate::frame::PhysFrame;
use crate::uapi::{
    KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT,
    KVM_EXIT_SHUTDOWN, KVM_EXIT_UNKNOWN, KvmRegs, KvmRun, KvmRunExitFailEntry, KvmRunExitIo,
    KvmRunExitUnknown, KvmSregs,
};
use crate::vmx::{
    GuestSnapshot, PerCpuStates, VmxExitInfo, VmxExitReason, VmxIoExitInfo, VmxVcpu,
};
use crate::{HostPhysAddr, Result, VmmHal, VmxConfig, VmxError};

/// The run state of a [`Vcpu`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Waiting to be started; only the bootstrap processor starts runnable.
    Uninitialized,
    /// May be entered with [`Vcpu::run`].
    Runnable,
}

/// The constant part of a [`Vcpu`].
struct VcpuInnerConst {
    /// The id of the vcpu, unique within its VM.
    id: usize,
    /// The virtual-processor tag of the vcpu.
    vpid: u16,
    state: RunState,
}

/// The mutable part of a [`Vcpu`], locked for the whole of a run.
struct VcpuInnerMut<H: VmmHal> {
    arch_vcpu: VmxVcpu<H>,
    guest: GuestSnapshot,
    /// Size of an `IN` access published in the run page and not yet
    /// completed into the guest's `rax`.
    pending_in: Option<u8>,
}

/// A virtual CPU of a [`Vm`](crate::Vm).
///
/// Almost all methods take `&self`; a VCPU is shared between its VM and the
/// handles of the controlling process.
pub struct Vcpu<H: VmmHal> {
    inner_const: VcpuInnerConst,
    inner_mut: Mutex<VcpuInnerMut<H>>,
    percpu: Arc<PerCpuStates<H>>,
    /// The `kvm_run` page shared with the controlling process.
    run_page: PhysFrame<H>,
}

impl<H: VmmHal> Vcpu<H> {
    pub(crate) fn new(
        id: usize,
        config: VmxConfig,
        percpu: Arc<PerCpuStates<H>>,
    ) -> Result<Self> {
        // Place the VMCS near the CPU creating the vcpu.
        let arch_vcpu = H::run_pinned(|cpu| VmxVcpu::new(cpu, config))?;
        let state = if id == 0 {
            RunState::Runnable
        } else {
            RunState::Uninitialized
        };
        let vcpu = Self {
            inner_const: VcpuInnerConst {
                id,
                vpid: id as u16 + 1,
                state,
            },
            inner_mut: Mutex::new(VcpuInnerMut {
                arch_vcpu,
                guest: GuestSnapshot::default(),
                pending_in: None,
            }),
            percpu,
            run_page: PhysFrame::alloc_zero()?,
        };
        debug!("[VMM] created VCPU {} ({:?})", id, state);
        Ok(vcpu)
    }

    /// Get the id of the vcpu.
    pub fn id(&self) -> usize {
        self.inner_const.id
    }

    /// Get the virtual-processor tag of the vcpu.
    pub fn vpid(&self) -> u16 {
        self.inner_const.vpid
    }

    /// Get whether the vcpu is the bootstrap processor.
    pub fn is_bsp(&self) -> bool {
        self.inner_const.id == 0
    }

    pub fn state(&self) -> RunState {
        self.inner_const.state
    }

    /// Physical address of the shared `kvm_run` page.
    pub fn run_page_paddr(&self) -> HostPhysAddr {
        self.run_page.start_paddr()
    }

    /// Resolves a page fault at page offset `pgoff` of a mapping of the
    /// vcpu handle. Only the run page can be mapped.
    pub fn fault(&self, pgoff: usize) -> Result<HostPhysAddr> {
        if pgoff != 0 {
            return Err(VmxError::OutOfRange);
        }
        Ok(self.run_page.start_paddr())
    }

    fn lock(&self) -> Result<spin::MutexGuard<'_, VcpuInnerMut<H>>> {
        self.inner_mut.try_lock().ok_or(VmxError::VcpuBusy)
    }

    pub fn get_regs(&self) -> Result<KvmRegs> {
        Ok(self.lock()?.guest.regs)
    }

    /// Replaces the register snapshot. It reaches the guest on the next run.
    pub fn set_regs(&self, regs: &KvmRegs) -> Result {
        let mut inner = self.lock()?;
        inner.guest.regs = *regs;
        inner.pending_in = None;
        Ok(())
    }

    pub fn get_sregs(&self) -> Result<KvmSregs> {
        Ok(self.lock()?.guest.sregs)
    }

    /// Replaces the segment and control register snapshot. It reaches the
    /// guest on the next run.
    pub fn set_sregs(&self, sregs: &KvmSregs) -> Result {
        let mut inner = self.lock()?;
        inner.guest.sregs = *sregs;
        inner.guest.sregs_valid = true;
        Ok(())
    }

    /// Runs the vcpu until an exit that must be reported to the controlling
    /// process, which is then described in the run page. Returns the
    /// `KVM_EXIT_*` reason.
    pub fn run(&self) -> Result<u32> {
        if self.inner_const.state != RunState::Runnable {
            return Err(VmxError::InvalidState);
        }
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        // Safety: the run page is only written while the vcpu is locked.
        let run = unsafe { &mut *(self.run_page.as_mut_ptr() as *mut KvmRun) };

        if let Some(size) = inner.pending_in.take() {
            complete_io_in(run, &mut inner.guest.regs, size);
        }

        let (cpu, exit_info) = H::run_pinned(|cpu| {
            let mut percpu = self.percpu.get(cpu)?.lock();
            let exit_info = inner.arch_vcpu.enter_guest(&mut percpu, &mut inner.guest)?;
            Ok::<_, VmxError>((cpu, exit_info))
        })?;
        let reason = self.publish_exit(run, inner, cpu, &exit_info);
        trace!("[VMM] VCPU {} exit to user: {}", self.id(), reason);
        Ok(reason)
    }

    fn publish_exit(
        &self,
        run: &mut KvmRun,
        inner: &mut VcpuInnerMut<H>,
        cpu: usize,
        exit: &VmxExitInfo,
    ) -> u32 {
        run.exit_reason = if exit.entry_failure {
            run.exit.fail_entry = KvmRunExitFailEntry {
                hardware_entry_failure_reason: exit.basic_reason as u64,
                cpu: cpu as u32,
            };
            KVM_EXIT_FAIL_ENTRY
        } else {
            match exit.exit_reason() {
                Some(VmxExitReason::HLT) => {
                    inner.guest.regs.rip += exit.exit_instruction_length as u64;
                    KVM_EXIT_HLT
                }
                Some(VmxExitReason::TRIPLE_FAULT) => KVM_EXIT_SHUTDOWN,
                Some(VmxExitReason::IO_INSTRUCTION) => {
                    let io = VmxIoExitInfo::from_qualification(exit.exit_qualification);
                    if io.is_string {
                        warn!(
                            "[VMM] VCPU {}: string I/O on port {:#x} is not supported",
                            self.id(),
                            io.port
                        );
                        publish_unknown(run, exit)
                    } else {
                        inner.guest.regs.rip += exit.exit_instruction_length as u64;
                        publish_io(run, inner, &io)
                    }
                }
                _ => {
                    warn!("[VMM] VCPU {}: unhandled VM exit {:#x?}", self.id(), exit);
                    publish_unknown(run, exit)
                }
            }
        };
        run.exit_reason
    }
}

fn publish_unknown(run: &mut KvmRun, exit: &VmxExitInfo) -> u32 {
    run.exit.hw = KvmRunExitUnknown {
        hardware_exit_reason: exit.basic_reason as u64,
    };
    KVM_EXIT_UNKNOWN
}

fn publish_io<H: VmmHal>(
    run: &mut KvmRun,
    inner: &mut VcpuInnerMut<H>,
    io: &VmxIoExitInfo,
) -> u32 {
    run.exit.io = KvmRunExitIo {
        direction: if io.is_in { KVM_EXIT_IO_IN } else { KVM_EXIT_IO_OUT },
        size: io.access_size,
        port: io.port,
        count: 1,
        data_offset: KvmRun::IO_DATA_OFFSET as u64,
    };
    let data = io_data(run, io.access_size);
    if io.is_in {
        data.fill(0);
        inner.pending_in = Some(io.access_size);
    } else {
        let size = data.len();
        data.copy_from_slice(&inner.guest.regs.rax.to_le_bytes()[..size]);
    }
    KVM_EXIT_IO
}

/// Merges the data of a completed `IN` into `rax`. A 32-bit access clears
/// the upper half, as on hardware.
fn complete_io_in(run: &mut KvmRun, regs: &mut KvmRegs, size: u8) {
    let data = io_data(run, size);
    let mut bytes = [0u8; 8];
    bytes[..data.len()].copy_from_slice(data);
    let value = u64::from_le_bytes(bytes);
    regs.rax = match size {
        1 => (regs.rax & !0xff) | value,
        2 => (regs.rax & !0xffff) | value,
        _ => value,
    };
}

/// The data bytes of an I/O exit, placed right after the run header.
fn io_data(run: &mut KvmRun, size: u8) -> &mut [u8] {
    let size = (size as usize).min(8);
    debug_assert!(KvmRun::IO_DATA_OFFSET + size <= PAGE_SIZE);
    unsafe {
        core::slice::from_raw_parts_mut(
            (run as *mut KvmRun as *mut u8).add(KvmRun::IO_DATA_OFFSET),
            size,
        )
    }
}

impl<H: VmmHal> fmt::Debug for Vcpu<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.inner_const.id)
            .field("vpid", &self.inner_const.vpid)
            .field("state", &self.inner_const.state)
            .field("run_page", &self.run_page.start_paddr())
            .finish()
    }
}
