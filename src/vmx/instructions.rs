//! The capability instruction layer: every privileged instruction the engine
//! executes goes through [`VmxCpu`].

use bit_field::BitField;
use x86::dtables::DescriptorTablePointer;
use x86::vmx::{Result as VmResult, VmFail};
use x86_64::registers::control::Cr4Flags;

use crate::regs::GeneralRegisters;

/// The register block the entry and exit trampolines share with the host.
///
/// The field order is fixed: the exit trampoline pushes the guest registers
/// right below the saved host stack pointer, which `HOST_RSP` points at.
#[repr(C)]
#[derive(Debug, Default)]
pub struct LaunchFrame {
    pub guest_regs: GeneralRegisters,
    pub host_stack_top: u64,
}

/// Segment selectors of the running kernel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostSelectors {
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub tr: u16,
}

/// Privileged x86 instructions used for VMX operation.
///
/// VMX instructions report `VMfailInvalid` through CF and `VMfailValid`
/// through ZF; implementations decode those flags into [`VmFail`] with
/// [`vm_fail_from_rflags`] and do nothing else.
pub trait VmxCpu {
    /// Whether CPUID reports VMX support.
    fn has_vmx() -> bool;

    fn read_msr(msr: u32) -> u64;
    /// # Safety
    ///
    /// Writing an MSR may change the processor's behavior arbitrarily.
    unsafe fn write_msr(msr: u32, value: u64);

    fn read_cr0() -> u64;
    /// CR3 including its flag bits.
    fn read_cr3() -> u64;
    fn read_cr4() -> u64;
    /// # Safety
    ///
    /// The value must be a legal CR4 for the running kernel.
    unsafe fn write_cr4(value: u64);

    fn host_selectors() -> HostSelectors;
    fn sgdt() -> DescriptorTablePointer<u64>;
    fn sidt() -> DescriptorTablePointer<u64>;

    /// # Safety
    ///
    /// `paddr` must be a stamped VMXON region that stays allocated until
    /// `vmxoff`.
    unsafe fn vmxon(paddr: u64) -> VmResult<()>;
    /// # Safety
    ///
    /// Leaves VMX operation on this CPU.
    unsafe fn vmxoff() -> VmResult<()>;
    /// # Safety
    ///
    /// `paddr` must be a stamped VMCS region.
    unsafe fn vmptrld(paddr: u64) -> VmResult<()>;
    /// # Safety
    ///
    /// `paddr` must be a stamped VMCS region.
    unsafe fn vmclear(paddr: u64) -> VmResult<()>;
    fn vmread(field: u32) -> VmResult<u64>;
    /// # Safety
    ///
    /// The field value becomes part of the host or guest context on the next
    /// VM entry or exit.
    unsafe fn vmwrite(field: u32, value: u64) -> VmResult<()>;

    /// Enters the guest with VMLAUNCH, or VMRESUME if `launched`, using the
    /// registers in `frame`. Returns after the next VM exit with the guest
    /// registers saved back into `frame`, or immediately if entry fails.
    ///
    /// # Safety
    ///
    /// The current VMCS must have `HOST_RSP` set to `&frame.host_stack_top`
    /// and `HOST_RIP` set to [`VmxCpu::exit_trampoline`].
    unsafe fn vm_enter(frame: *mut LaunchFrame, launched: bool) -> VmResult<()>;

    /// Address execution resumes at after a VM exit.
    fn exit_trampoline() -> u64;
}

/// Decodes the status flags left by a VMX instruction.
pub fn vm_fail_from_rflags(rflags: u64) -> VmResult<()> {
    if rflags.get_bit(0) {
        Err(VmFail::VmFailInvalid)
    } else if rflags.get_bit(6) {
        Err(VmFail::VmFailValid)
    } else {
        Ok(())
    }
}

/// Sets CR4.VMXE together with the bits `IA32_VMX_CR4_FIXED0` requires and
/// without those `IA32_VMX_CR4_FIXED1` forbids. Returns the previous CR4.
pub fn enable_extension<C: VmxCpu>(fixed0: u64, fixed1: u64) -> u64 {
    let old = C::read_cr4();
    let new = ((old | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits()) | fixed0) & fixed1;
    trace!("[VMM] CR4 {:#x} -> {:#x}", old, new);
    unsafe { C::write_cr4(new) };
    old
}

#[cfg(target_arch = "x86_64")]
pub use self::host::HostCpu;

#[cfg(target_arch = "x86_64")]
mod host {
    use core::arch::naked_asm;
    use core::mem::offset_of;

    use raw_cpuid::CpuId;
    use x86::bits64::vmx;
    use x86::dtables::{self, DescriptorTablePointer};
    use x86::vmx::Result as VmResult;
    use x86_64::registers::control::{Cr0, Cr3, Cr4};

    use super::{HostSelectors, LaunchFrame, VmxCpu, vm_fail_from_rflags};

    /// The processor this code runs on.
    pub struct HostCpu;

    impl VmxCpu for HostCpu {
        fn has_vmx() -> bool {
            CpuId::new()
                .get_feature_info()
                .is_some_and(|feature| feature.has_vmx())
        }

        fn read_msr(msr: u32) -> u64 {
            unsafe { x86::msr::rdmsr(msr) }
        }

        unsafe fn write_msr(msr: u32, value: u64) {
            unsafe { x86::msr::wrmsr(msr, value) }
        }

        fn read_cr0() -> u64 {
            Cr0::read_raw()
        }

        fn read_cr3() -> u64 {
            let (frame, flags) = Cr3::read_raw();
            frame.start_address().as_u64() | flags as u64
        }

        fn read_cr4() -> u64 {
            Cr4::read_raw()
        }

        unsafe fn write_cr4(value: u64) {
            unsafe { Cr4::write_raw(value) }
        }

        fn host_selectors() -> HostSelectors {
            use x86::segmentation::{cs, ds, es, fs, gs, ss};
            HostSelectors {
                es: es().bits(),
                cs: cs().bits(),
                ss: ss().bits(),
                ds: ds().bits(),
                fs: fs().bits(),
                gs: gs().bits(),
                tr: unsafe { x86::task::tr() }.bits(),
            }
        }

        fn sgdt() -> DescriptorTablePointer<u64> {
            let mut gdtp = DescriptorTablePointer::<u64>::default();
            unsafe { dtables::sgdt(&mut gdtp) };
            gdtp
        }

        fn sidt() -> DescriptorTablePointer<u64> {
            let mut idtp = DescriptorTablePointer::<u64>::default();
            unsafe { dtables::sidt(&mut idtp) };
            idtp
        }

        unsafe fn vmxon(paddr: u64) -> VmResult<()> {
            unsafe { vmx::vmxon(paddr) }
        }

        unsafe fn vmxoff() -> VmResult<()> {
            unsafe { vmx::vmxoff() }
        }

        unsafe fn vmptrld(paddr: u64) -> VmResult<()> {
            unsafe { vmx::vmptrld(paddr) }
        }

        unsafe fn vmclear(paddr: u64) -> VmResult<()> {
            unsafe { vmx::vmclear(paddr) }
        }

        fn vmread(field: u32) -> VmResult<u64> {
            unsafe { vmx::vmread(field) }
        }

        unsafe fn vmwrite(field: u32, value: u64) -> VmResult<()> {
            unsafe { vmx::vmwrite(field, value) }
        }

        unsafe fn vm_enter(frame: *mut LaunchFrame, launched: bool) -> VmResult<()> {
            let rflags = unsafe {
                if launched {
                    vmx_resume(frame)
                } else {
                    vmx_launch(frame)
                }
            };
            vm_fail_from_rflags(rflags)
        }

        fn exit_trampoline() -> u64 {
            vmx_exit as usize as u64
        }
    }

    /// Saves the host registers, records the host stack in
    /// `LaunchFrame::host_stack_top`, loads the guest registers and executes
    /// the entry instruction. Only a failed entry falls through: it returns
    /// RFLAGS with the VMX status flags in `rax`.
    macro_rules! vmx_entry_with {
        ($instr:literal) => {
            naked_asm!(
                save_regs_to_stack!(),                      // save host status
                "mov    [rdi + {host_stack_top}], rsp",     // save current RSP to LaunchFrame::host_stack_top
                "mov    rsp, rdi",                          // set RSP to guest regs area
                restore_regs_from_stack!(),                 // restore guest status
                $instr,                                     // let's go!
                "mov    rsp, [rsp]",                        // entry failed: back to the host stack
                "pushfq",
                "pop    rax",
                "mov    [rsp], rax",                        // return RFLAGS in the saved rax slot
                restore_regs_from_stack!(),
                "ret",
                host_stack_top = const offset_of!(LaunchFrame, host_stack_top),
            )
        };
    }

    #[unsafe(naked)]
    /// Enter guest with vmlaunch.
    ///
    /// [`vmx_exit`] does the return for a successful entry.
    unsafe extern "C" fn vmx_launch(_frame: *mut LaunchFrame) -> u64 {
        vmx_entry_with!("vmlaunch")
    }

    #[unsafe(naked)]
    /// Enter guest with vmresume.
    ///
    /// See [`vmx_launch`] for detail.
    unsafe extern "C" fn vmx_resume(_frame: *mut LaunchFrame) -> u64 {
        vmx_entry_with!("vmresume")
    }

    #[unsafe(naked)]
    /// Return after vm-exit, on behalf of the entry call, with 0 in `rax`.
    unsafe extern "C" fn vmx_exit() -> u64 {
        naked_asm!(
            save_regs_to_stack!(),                      // save guest status
            "mov    rsp, [rsp + {host_stack_top}]",     // set RSP to LaunchFrame::host_stack_top
            "mov    qword ptr [rsp], 0",                // entry succeeded
            restore_regs_from_stack!(),                 // restore host status
            "ret",
            host_stack_top = const offset_of!(LaunchFrame, host_stack_top),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_fail_from_rflags() {
        assert!(vm_fail_from_rflags(0x2).is_ok());
        assert!(matches!(vm_fail_from_rflags(0x3), Err(VmFail::VmFailInvalid)));
        assert!(matches!(vm_fail_from_rflags(0x42), Err(VmFail::VmFailValid)));
        // CF wins when both flags are set.
        assert!(matches!(vm_fail_from_rflags(0x43), Err(VmFail::VmFailInvalid)));
    }

    #[test]
    fn test_launch_frame_layout() {
        use core::mem::{offset_of, size_of};
        assert_eq!(size_of::<GeneralRegisters>(), 16 * 8);
        assert_eq!(offset_of!(LaunchFrame, host_stack_top), 16 * 8);
    }
}
