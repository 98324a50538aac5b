use alloc::collections::BTreeMap;
use core::fmt::{Debug, Formatter, Result as FmtResult};

use x86::dtables::DescriptorTablePointer;
use x86::segmentation::SegmentSelector;
use x86::vmx::vmcs::control::{EntryControls, PrimaryControls};

use super::definitions::VmxExitReason;
use super::instructions::{LaunchFrame, VmxCpu};
use super::percpu::VmxPerCpuState;
use super::structs::VmxRegion;
use super::vmcs::{
    self, VmcsControl32, VmcsControlNW, VmcsGuest16, VmcsGuest32, VmcsGuest64, VmcsGuestNW,
    VmcsHost16, VmcsHost32, VmcsHost64, VmcsHostNW, VmxExitInfo, as_vmx_err,
};
use crate::frame::PhysFrame;
use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::segmentation::Segment;
use crate::uapi::{KvmRegs, KvmSregs};
use crate::{Result, VmmHal, VmxConfig};

const EFER_LMA: u64 = 1 << 10;
const RFLAGS_RESERVED_1: u64 = 1 << 1;
const DR7_INIT: u64 = 0x400;

/// What to do after an exit handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Re-enter the guest at the exiting instruction.
    Resume,
    /// Re-enter the guest after the exiting instruction.
    SkipInstruction,
    /// Leave the run loop and report the exit to the caller.
    Return,
}

/// Handles one kind of VM exit inside the run loop. It may update the guest
/// general registers before the guest is re-entered.
pub type ExitHandler = fn(&VmxExitInfo, &mut GeneralRegisters) -> ExitAction;

/// Register state a VCPU is entered with and saved back into after an exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestSnapshot {
    pub regs: KvmRegs,
    pub sregs: KvmSregs,
    /// Whether `sregs` describes the guest. Until it does, the guest shares
    /// the host's paging, segments and control registers.
    pub sregs_valid: bool,
}

/// A virtual CPU backed by a VMCS.
pub struct VmxVcpu<H: VmmHal> {
    vmcs: VmxRegion<H>,
    /// Page holding the [`LaunchFrame`]; `HOST_RSP` points into it.
    scratch: PhysFrame<H>,
    launched: bool,
    config: VmxConfig,
    exit_handlers: BTreeMap<VmxExitReason, ExitHandler>,
}

impl<H: VmmHal> VmxVcpu<H> {
    /// Create a new [`VmxVcpu`] whose VMCS is placed near `cpu`.
    pub fn new(cpu: usize, config: VmxConfig) -> Result<Self> {
        let vcpu = Self {
            vmcs: VmxRegion::new(cpu)?,
            scratch: PhysFrame::alloc_zero()?,
            launched: false,
            config,
            exit_handlers: BTreeMap::new(),
        };
        debug!(
            "[VMM] created VmxVcpu(vmcs: {:#x})",
            vcpu.vmcs.phys_addr().as_usize()
        );
        Ok(vcpu)
    }

    pub fn vmcs_region(&self) -> &VmxRegion<H> {
        &self.vmcs
    }

    /// Whether the VMCS has been launched since it was last cleared.
    pub fn is_launched(&self) -> bool {
        self.launched
    }

    /// Installs `handler` for `reason`, returning the handler it replaces.
    pub fn set_exit_handler(
        &mut self,
        reason: VmxExitReason,
        handler: ExitHandler,
    ) -> Option<ExitHandler> {
        self.exit_handlers.insert(reason, handler)
    }

    fn frame(&mut self) -> &mut LaunchFrame {
        unsafe { &mut *self.frame_ptr() }
    }

    fn frame_ptr(&self) -> *mut LaunchFrame {
        self.scratch.as_mut_ptr() as *mut LaunchFrame
    }

    /// Runs the guest on the core `percpu` belongs to until an exit no
    /// handler resumes from, and saves the guest state back into `guest`.
    ///
    /// The VMCS is cleared and loaded first and cleared again before
    /// returning, so consecutive calls may come from different cores.
    pub fn enter_guest(
        &mut self,
        percpu: &mut VmxPerCpuState<H>,
        guest: &mut GuestSnapshot,
    ) -> Result<VmxExitInfo> {
        percpu.clear_vmcs(&self.vmcs)?;
        self.launched = false;
        percpu.load_vmcs(&self.vmcs)?;

        let result = self.run_loaded(guest);

        if let Err(err) = percpu.clear_vmcs(&self.vmcs) {
            warn!(
                "[VMM] failed to clear VMCS {:#x}: {}",
                self.vmcs.phys_addr().as_usize(),
                err
            );
        }
        self.launched = false;
        result
    }

    fn run_loaded(&mut self, guest: &mut GuestSnapshot) -> Result<VmxExitInfo> {
        let long_mode = if guest.sregs_valid {
            guest.sregs.efer & EFER_LMA != 0
        } else {
            Msr::IA32_EFER.read::<H::Cpu>() & EFER_LMA != 0
        };
        self.setup_vmcs_control(long_mode)?;
        self.setup_vmcs_host()?;
        self.setup_vmcs_guest(guest)?;
        self.frame().guest_regs = GeneralRegisters::from_kvm(&guest.regs);

        loop {
            self.vmx_entry()?;
            let exit_info = vmcs::exit_info::<H::Cpu>()?;
            trace!("[VMM] VM exit: {:#x?}", exit_info);

            if exit_info.entry_failure {
                warn!(
                    "[VMM] VM entry failed with exit reason {}",
                    exit_info.basic_reason
                );
                self.save_guest(guest)?;
                return Ok(exit_info);
            }

            let handler = exit_info
                .exit_reason()
                .and_then(|reason| self.exit_handlers.get(&reason))
                .copied();
            let action = match handler {
                Some(handler) => handler(&exit_info, &mut self.frame().guest_regs),
                None => ExitAction::Return,
            };
            match action {
                ExitAction::Resume => {}
                ExitAction::SkipInstruction => {
                    self.advance_rip(exit_info.exit_instruction_length)?
                }
                ExitAction::Return => {
                    self.save_guest(guest)?;
                    return Ok(exit_info);
                }
            }
        }
    }

    /// The single entry transition: VMLAUNCH on a clear VMCS, VMRESUME after.
    fn vmx_entry(&mut self) -> Result {
        let launched = self.launched;
        unsafe { H::Cpu::vm_enter(self.frame_ptr(), launched) }.map_err(|err| {
            let err = as_vmx_err::<H::Cpu>(err);
            error!(
                "[VMM] {} failed: {}",
                if launched { "VMRESUME" } else { "VMLAUNCH" },
                err
            );
            err
        })?;
        self.launched = true;
        Ok(())
    }

    fn advance_rip(&mut self, instr_len: u32) -> Result {
        let rip = VmcsGuestNW::RIP.read::<H::Cpu>()?;
        VmcsGuestNW::RIP.write::<H::Cpu>(rip + instr_len as u64)
    }

    fn setup_vmcs_control(&mut self, long_mode: bool) -> Result {
        let config = self.config;

        vmcs::set_control::<H::Cpu>(
            VmcsControl32::PINBASED_EXEC_CONTROLS,
            Msr::IA32_VMX_PINBASED_CTLS,
            config.pin_based.bits(),
        )?;

        let primary = vmcs::set_control::<H::Cpu>(
            VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
            Msr::IA32_VMX_PROCBASED_CTLS,
            config.primary_processor_based.bits(),
        )?;
        if PrimaryControls::from_bits_truncate(primary).contains(PrimaryControls::SECONDARY_CONTROLS)
        {
            vmcs::set_control::<H::Cpu>(
                VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS,
                Msr::IA32_VMX_PROCBASED_CTLS2,
                0,
            )?;
        }

        vmcs::set_control::<H::Cpu>(
            VmcsControl32::VMEXIT_CONTROLS,
            Msr::IA32_VMX_EXIT_CTLS,
            config.vm_exit.bits(),
        )?;

        // The guest runs in IA-32e mode exactly when its EFER.LMA is set.
        let mut entry = config.vm_entry;
        entry.set(EntryControls::IA32E_MODE_GUEST, long_mode);
        vmcs::set_control::<H::Cpu>(
            VmcsControl32::VMENTRY_CONTROLS,
            Msr::IA32_VMX_ENTRY_CTLS,
            entry.bits(),
        )?;

        VmcsControl32::EXCEPTION_BITMAP.write::<H::Cpu>(config.exception_bitmap)?;
        VmcsControl32::PAGE_FAULT_ERR_CODE_MASK.write::<H::Cpu>(0)?;
        VmcsControl32::PAGE_FAULT_ERR_CODE_MATCH.write::<H::Cpu>(0)?;
        VmcsControl32::CR3_TARGET_COUNT.write::<H::Cpu>(0)?;

        // No MSR switches on VM entry or exit.
        VmcsControl32::VMEXIT_MSR_STORE_COUNT.write::<H::Cpu>(0)?;
        VmcsControl32::VMEXIT_MSR_LOAD_COUNT.write::<H::Cpu>(0)?;
        VmcsControl32::VMENTRY_MSR_LOAD_COUNT.write::<H::Cpu>(0)?;
        VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD.write::<H::Cpu>(0)?;
        Ok(())
    }

    fn setup_vmcs_host(&mut self) -> Result {
        VmcsHost64::IA32_PAT.write::<H::Cpu>(Msr::IA32_PAT.read::<H::Cpu>())?;
        VmcsHost64::IA32_EFER.write::<H::Cpu>(Msr::IA32_EFER.read::<H::Cpu>())?;

        VmcsHostNW::CR0.write::<H::Cpu>(H::Cpu::read_cr0())?;
        VmcsHostNW::CR3.write::<H::Cpu>(H::Cpu::read_cr3())?;
        VmcsHostNW::CR4.write::<H::Cpu>(H::Cpu::read_cr4())?;

        let selectors = H::Cpu::host_selectors();
        VmcsHost16::ES_SELECTOR.write::<H::Cpu>(selectors.es)?;
        VmcsHost16::CS_SELECTOR.write::<H::Cpu>(selectors.cs)?;
        VmcsHost16::SS_SELECTOR.write::<H::Cpu>(selectors.ss)?;
        VmcsHost16::DS_SELECTOR.write::<H::Cpu>(selectors.ds)?;
        VmcsHost16::FS_SELECTOR.write::<H::Cpu>(selectors.fs)?;
        VmcsHost16::GS_SELECTOR.write::<H::Cpu>(selectors.gs)?;
        VmcsHostNW::FS_BASE.write::<H::Cpu>(Msr::IA32_FS_BASE.read::<H::Cpu>())?;
        VmcsHostNW::GS_BASE.write::<H::Cpu>(Msr::IA32_GS_BASE.read::<H::Cpu>())?;

        let gdtp = H::Cpu::sgdt();
        let idtp = H::Cpu::sidt();
        let tr = Segment::from_selector(SegmentSelector::from_raw(selectors.tr), host_gdt(&gdtp));
        VmcsHost16::TR_SELECTOR.write::<H::Cpu>(selectors.tr)?;
        VmcsHostNW::TR_BASE.write::<H::Cpu>(tr.base)?;
        VmcsHostNW::GDTR_BASE.write::<H::Cpu>(gdtp.base as u64)?;
        VmcsHostNW::IDTR_BASE.write::<H::Cpu>(idtp.base as u64)?;

        VmcsHost32::IA32_SYSENTER_CS.write::<H::Cpu>(Msr::IA32_SYSENTER_CS.read::<H::Cpu>() as u32)?;
        VmcsHostNW::IA32_SYSENTER_ESP.write::<H::Cpu>(Msr::IA32_SYSENTER_ESP.read::<H::Cpu>())?;
        VmcsHostNW::IA32_SYSENTER_EIP.write::<H::Cpu>(Msr::IA32_SYSENTER_EIP.read::<H::Cpu>())?;

        // The host stack is switched on exit: point it at the launch frame,
        // where the entry path records the real host stack pointer.
        let host_stack_top = &self.frame().host_stack_top as *const u64 as u64;
        VmcsHostNW::RSP.write::<H::Cpu>(host_stack_top)?;
        VmcsHostNW::RIP.write::<H::Cpu>(H::Cpu::exit_trampoline())?;
        Ok(())
    }

    fn setup_vmcs_guest(&mut self, guest: &GuestSnapshot) -> Result {
        if guest.sregs_valid {
            self.setup_guest_from_sregs(&guest.sregs)?;
        } else {
            self.setup_flat_guest()?;
        }

        VmcsGuestNW::RIP.write::<H::Cpu>(guest.regs.rip)?;
        VmcsGuestNW::RSP.write::<H::Cpu>(guest.regs.rsp)?;
        VmcsGuestNW::RFLAGS.write::<H::Cpu>(guest.regs.rflags | RFLAGS_RESERVED_1)?;

        VmcsGuestNW::DR7.write::<H::Cpu>(DR7_INIT)?;
        VmcsGuestNW::PENDING_DBG_EXCEPTIONS.write::<H::Cpu>(0)?;
        VmcsGuest32::INTERRUPTIBILITY_STATE.write::<H::Cpu>(0)?;
        VmcsGuest32::ACTIVITY_STATE.write::<H::Cpu>(0)?;

        VmcsGuest64::LINK_PTR.write::<H::Cpu>(u64::MAX)?; // SDM Vol. 3C, Section 25.4.2
        VmcsGuest64::IA32_DEBUGCTL.write::<H::Cpu>(0)?;
        VmcsGuest64::IA32_PAT.write::<H::Cpu>(Msr::IA32_PAT.read::<H::Cpu>())?;
        Ok(())
    }

    /// Mirrors the host's paging, segments and control registers into the
    /// guest-state area.
    fn setup_flat_guest(&mut self) -> Result {
        self.set_cr(0, H::Cpu::read_cr0())?;
        self.set_cr(4, H::Cpu::read_cr4())?;
        self.set_cr(3, H::Cpu::read_cr3())?;

        let selectors = H::Cpu::host_selectors();
        let gdtp = H::Cpu::sgdt();
        let idtp = H::Cpu::sidt();
        let gdt = host_gdt(&gdtp);
        let segment = |selector: u16| Segment::from_selector(SegmentSelector::from_raw(selector), gdt);

        set_guest_segment::<H::Cpu>(GuestSegment::Es, &segment(selectors.es))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Cs, &segment(selectors.cs))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Ss, &segment(selectors.ss))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Ds, &segment(selectors.ds))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Fs, &segment(selectors.fs))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Gs, &segment(selectors.gs))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Tr, &segment(selectors.tr))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Ldtr, &Segment::invalid())?;
        // In 64-bit mode the FS/GS bases live in MSRs, not descriptors.
        VmcsGuestNW::FS_BASE.write::<H::Cpu>(Msr::IA32_FS_BASE.read::<H::Cpu>())?;
        VmcsGuestNW::GS_BASE.write::<H::Cpu>(Msr::IA32_GS_BASE.read::<H::Cpu>())?;

        VmcsGuestNW::GDTR_BASE.write::<H::Cpu>(gdtp.base as u64)?;
        VmcsGuest32::GDTR_LIMIT.write::<H::Cpu>(gdtp.limit as u32)?;
        VmcsGuestNW::IDTR_BASE.write::<H::Cpu>(idtp.base as u64)?;
        VmcsGuest32::IDTR_LIMIT.write::<H::Cpu>(idtp.limit as u32)?;

        VmcsGuest32::IA32_SYSENTER_CS.write::<H::Cpu>(Msr::IA32_SYSENTER_CS.read::<H::Cpu>() as u32)?;
        VmcsGuestNW::IA32_SYSENTER_ESP.write::<H::Cpu>(Msr::IA32_SYSENTER_ESP.read::<H::Cpu>())?;
        VmcsGuestNW::IA32_SYSENTER_EIP.write::<H::Cpu>(Msr::IA32_SYSENTER_EIP.read::<H::Cpu>())?;
        VmcsGuest64::IA32_EFER.write::<H::Cpu>(Msr::IA32_EFER.read::<H::Cpu>())?;
        Ok(())
    }

    fn setup_guest_from_sregs(&mut self, sregs: &KvmSregs) -> Result {
        self.set_cr(0, sregs.cr0)?;
        self.set_cr(4, sregs.cr4)?;
        self.set_cr(3, sregs.cr3)?;

        set_guest_segment::<H::Cpu>(GuestSegment::Es, &Segment::from_kvm(&sregs.es))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Cs, &Segment::from_kvm(&sregs.cs))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Ss, &Segment::from_kvm(&sregs.ss))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Ds, &Segment::from_kvm(&sregs.ds))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Fs, &Segment::from_kvm(&sregs.fs))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Gs, &Segment::from_kvm(&sregs.gs))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Tr, &Segment::from_kvm(&sregs.tr))?;
        set_guest_segment::<H::Cpu>(GuestSegment::Ldtr, &Segment::from_kvm(&sregs.ldt))?;

        VmcsGuestNW::GDTR_BASE.write::<H::Cpu>(sregs.gdt.base)?;
        VmcsGuest32::GDTR_LIMIT.write::<H::Cpu>(sregs.gdt.limit as u32)?;
        VmcsGuestNW::IDTR_BASE.write::<H::Cpu>(sregs.idt.base)?;
        VmcsGuest32::IDTR_LIMIT.write::<H::Cpu>(sregs.idt.limit as u32)?;

        VmcsGuest32::IA32_SYSENTER_CS.write::<H::Cpu>(0)?;
        VmcsGuestNW::IA32_SYSENTER_ESP.write::<H::Cpu>(0)?;
        VmcsGuestNW::IA32_SYSENTER_EIP.write::<H::Cpu>(0)?;
        VmcsGuest64::IA32_EFER.write::<H::Cpu>(sregs.efer)?;
        Ok(())
    }

    /// Copies the guest state left by the last exit into `guest`.
    fn save_guest(&mut self, guest: &mut GuestSnapshot) -> Result {
        let gprs = self.frame().guest_regs;
        gprs.store_kvm(&mut guest.regs);
        guest.regs.rip = VmcsGuestNW::RIP.read::<H::Cpu>()?;
        guest.regs.rsp = VmcsGuestNW::RSP.read::<H::Cpu>()?;
        guest.regs.rflags = VmcsGuestNW::RFLAGS.read::<H::Cpu>()?;

        let sregs = &mut guest.sregs;
        sregs.es = get_guest_segment::<H::Cpu>(GuestSegment::Es)?.to_kvm();
        sregs.cs = get_guest_segment::<H::Cpu>(GuestSegment::Cs)?.to_kvm();
        sregs.ss = get_guest_segment::<H::Cpu>(GuestSegment::Ss)?.to_kvm();
        sregs.ds = get_guest_segment::<H::Cpu>(GuestSegment::Ds)?.to_kvm();
        sregs.fs = get_guest_segment::<H::Cpu>(GuestSegment::Fs)?.to_kvm();
        sregs.gs = get_guest_segment::<H::Cpu>(GuestSegment::Gs)?.to_kvm();
        sregs.tr = get_guest_segment::<H::Cpu>(GuestSegment::Tr)?.to_kvm();
        sregs.ldt = get_guest_segment::<H::Cpu>(GuestSegment::Ldtr)?.to_kvm();
        sregs.gdt.base = VmcsGuestNW::GDTR_BASE.read::<H::Cpu>()?;
        sregs.gdt.limit = VmcsGuest32::GDTR_LIMIT.read::<H::Cpu>()? as u16;
        sregs.idt.base = VmcsGuestNW::IDTR_BASE.read::<H::Cpu>()?;
        sregs.idt.limit = VmcsGuest32::IDTR_LIMIT.read::<H::Cpu>()? as u16;
        sregs.cr0 = self.cr(0)?;
        sregs.cr3 = self.cr(3)?;
        sregs.cr4 = self.cr(4)?;
        sregs.efer = VmcsGuest64::IA32_EFER.read::<H::Cpu>()?;
        guest.sregs_valid = true;
        Ok(())
    }

    /// Writes guest control register `cr_idx` within the bits the
    /// `IA32_VMX_CRx_FIXED` MSRs allow. The guest reads back `val` through
    /// the read shadow. (SDM Vol. 3D, Appendix A.7, A.8)
    fn set_cr(&mut self, cr_idx: usize, val: u64) -> Result {
        match cr_idx {
            0 => {
                let must1 = Msr::IA32_VMX_CR0_FIXED0.read::<H::Cpu>();
                let may1 = Msr::IA32_VMX_CR0_FIXED1.read::<H::Cpu>();
                VmcsGuestNW::CR0.write::<H::Cpu>((val & may1) | must1)?;
                VmcsControlNW::CR0_READ_SHADOW.write::<H::Cpu>(val)?;
                VmcsControlNW::CR0_GUEST_HOST_MASK.write::<H::Cpu>(must1 | !may1)?;
            }
            3 => VmcsGuestNW::CR3.write::<H::Cpu>(val)?,
            4 => {
                let must1 = Msr::IA32_VMX_CR4_FIXED0.read::<H::Cpu>();
                let may1 = Msr::IA32_VMX_CR4_FIXED1.read::<H::Cpu>();
                VmcsGuestNW::CR4.write::<H::Cpu>((val & may1) | must1)?;
                VmcsControlNW::CR4_READ_SHADOW.write::<H::Cpu>(val)?;
                VmcsControlNW::CR4_GUEST_HOST_MASK.write::<H::Cpu>(must1 | !may1)?;
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Guest control register `cr_idx` as the guest sees it.
    fn cr(&self, cr_idx: usize) -> Result<u64> {
        Ok(match cr_idx {
            0 => {
                let host_mask = VmcsControlNW::CR0_GUEST_HOST_MASK.read::<H::Cpu>()?;
                (VmcsControlNW::CR0_READ_SHADOW.read::<H::Cpu>()? & host_mask)
                    | (VmcsGuestNW::CR0.read::<H::Cpu>()? & !host_mask)
            }
            3 => VmcsGuestNW::CR3.read::<H::Cpu>()?,
            4 => {
                let host_mask = VmcsControlNW::CR4_GUEST_HOST_MASK.read::<H::Cpu>()?;
                (VmcsControlNW::CR4_READ_SHADOW.read::<H::Cpu>()? & host_mask)
                    | (VmcsGuestNW::CR4.read::<H::Cpu>()? & !host_mask)
            }
            _ => unreachable!(),
        })
    }
}

/// Guest segment registers, each with its four VMCS fields.
#[derive(Debug, Clone, Copy)]
enum GuestSegment {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

impl GuestSegment {
    fn fields(self) -> (VmcsGuest16, VmcsGuestNW, VmcsGuest32, VmcsGuest32) {
        use VmcsGuest16::*;
        use VmcsGuest32::*;
        use VmcsGuestNW::*;
        match self {
            Self::Es => (ES_SELECTOR, ES_BASE, ES_LIMIT, ES_ACCESS_RIGHTS),
            Self::Cs => (CS_SELECTOR, CS_BASE, CS_LIMIT, CS_ACCESS_RIGHTS),
            Self::Ss => (SS_SELECTOR, SS_BASE, SS_LIMIT, SS_ACCESS_RIGHTS),
            Self::Ds => (DS_SELECTOR, DS_BASE, DS_LIMIT, DS_ACCESS_RIGHTS),
            Self::Fs => (FS_SELECTOR, FS_BASE, FS_LIMIT, FS_ACCESS_RIGHTS),
            Self::Gs => (GS_SELECTOR, GS_BASE, GS_LIMIT, GS_ACCESS_RIGHTS),
            Self::Ldtr => (LDTR_SELECTOR, LDTR_BASE, LDTR_LIMIT, LDTR_ACCESS_RIGHTS),
            Self::Tr => (TR_SELECTOR, TR_BASE, TR_LIMIT, TR_ACCESS_RIGHTS),
        }
    }
}

fn set_guest_segment<C: VmxCpu>(seg: GuestSegment, segment: &Segment) -> Result {
    let (selector, base, limit, access_rights) = seg.fields();
    selector.write::<C>(segment.selector.bits())?;
    base.write::<C>(segment.base)?;
    limit.write::<C>(segment.limit)?;
    access_rights.write::<C>(segment.access_rights.bits())
}

fn get_guest_segment<C: VmxCpu>(seg: GuestSegment) -> Result<Segment> {
    use crate::segmentation::SegmentAccessRights;
    let (selector, base, limit, access_rights) = seg.fields();
    Ok(Segment {
        selector: SegmentSelector::from_raw(selector.read::<C>()?),
        base: base.read::<C>()?,
        limit: limit.read::<C>()?,
        access_rights: SegmentAccessRights::from_bits_truncate(access_rights.read::<C>()?),
    })
}

/// The host GDT as a slice of descriptors.
fn host_gdt(gdtp: &DescriptorTablePointer<u64>) -> &'static [u64] {
    if gdtp.base.is_null() {
        return &[];
    }
    let table_len = (gdtp.limit as usize + 1) / core::mem::size_of::<u64>();
    unsafe { core::slice::from_raw_parts(gdtp.base, table_len) }
}

impl<H: VmmHal> Drop for VmxVcpu<H> {
    fn drop(&mut self) {
        debug!(
            "[VMM] dropped VmxVcpu(vmcs: {:#x})",
            self.vmcs.phys_addr().as_usize()
        );
    }
}

impl<H: VmmHal> Debug for VmxVcpu<H> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("VmxVcpu")
            .field("vmcs", &self.vmcs.phys_addr().as_usize())
            .field("launched", &self.launched)
            .field("config", &self.config)
            .field("exit_handlers", &self.exit_handlers.keys())
            .finish()
    }
}
