use alloc::vec::Vec;

use spin::Mutex;
use x86_64::registers::control::Cr4Flags;

use super::instructions::{VmxCpu, enable_extension};
use super::structs::{FeatureControl, FeatureControlFlags, VmxBasic, VmxRegion};
use super::vmcs::as_vmx_err;
use crate::msr::Msr;
use crate::{HostPhysAddr, Result, VmmHal, VmxError};

/// Represents the per-CPU state for Virtual Machine Extensions (VMX).
///
/// A core moves from disabled to root operation with [`enable_core`] and
/// back with [`disable_core`]; while enabled, it tracks the VMCS that is
/// current on it.
///
/// [`enable_core`]: VmxPerCpuState::enable_core
/// [`disable_core`]: VmxPerCpuState::disable_core
#[derive(Debug)]
pub struct VmxPerCpuState<H: VmmHal> {
    cpu_id: usize,
    /// The VMCS revision identifier reported when this core was enabled.
    vmcs_revision_id: u32,
    /// The VMXON region, present exactly while the core is in VMX operation.
    vmxon_region: Option<VmxRegion<H>>,
    /// The VMCS loaded on this core, if any.
    current_vmcs: Option<HostPhysAddr>,
}

impl<H: VmmHal> VmxPerCpuState<H> {
    pub const fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            vmcs_revision_id: 0,
            vmxon_region: None,
            current_vmcs: None,
        }
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    /// The VMCS revision identifier reported when this core was enabled.
    pub fn vmcs_revision_id(&self) -> u32 {
        self.vmcs_revision_id
    }

    /// Whether this core has executed VMXON.
    pub fn is_enabled(&self) -> bool {
        self.vmxon_region.is_some()
    }

    /// Physical address of the VMCS current on this core.
    pub fn current_vmcs(&self) -> Option<HostPhysAddr> {
        self.current_vmcs
    }

    /// Enters VMX root operation on this core. Must run pinned to it.
    pub fn enable_core(&mut self) -> Result {
        if !H::Cpu::has_vmx() {
            return Err(VmxError::Unsupported("CPU does not support feature VMX"));
        }
        if self.is_enabled() {
            return Err(VmxError::AlreadyEnabled);
        }

        // Enable VMXON, if required.
        let ctrl = FeatureControl::read::<H::Cpu>();
        let locked = ctrl.contains(FeatureControlFlags::LOCKED);
        let vmxon_outside = ctrl.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX);
        if !locked {
            FeatureControl::write::<H::Cpu>(
                ctrl | FeatureControlFlags::LOCKED | FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX,
            )
        } else if !vmxon_outside {
            return Err(VmxError::Unsupported("VMX disabled by BIOS"));
        }

        // Check control registers are in a VMX-friendly state. (SDM Vol. 3D, Appendix A.7, A.8)
        macro_rules! cr_is_valid {
            ($value: expr, $crx: ident) => {{
                use Msr::*;
                let value = $value;
                paste::paste! {
                    let fixed0 = [<IA32_VMX_ $crx _FIXED0>].read::<H::Cpu>();
                    let fixed1 = [<IA32_VMX_ $crx _FIXED1>].read::<H::Cpu>();
                }
                (!value & fixed0) == 0 && (value & !fixed1) == 0
            }};
        }
        if !cr_is_valid!(H::Cpu::read_cr0(), CR0) {
            return Err(VmxError::InvalidConfig(
                "host CR0 is not valid in VMX operation",
            ));
        }

        let vmx_basic = VmxBasic::read::<H::Cpu>();
        if vmx_basic.mem_type != VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK {
            return Err(VmxError::Unsupported("VMX memory type is not write-back"));
        }
        if vmx_basic.is_32bit_address {
            return Err(VmxError::Unsupported("32-bit VMX not supported"));
        }

        let region = VmxRegion::new(self.cpu_id)?;

        // Enable VMX using the VMXE bit, fixing the other CR4 bits VMX cares about.
        let old_cr4 = enable_extension::<H::Cpu>(
            Msr::IA32_VMX_CR4_FIXED0.read::<H::Cpu>(),
            Msr::IA32_VMX_CR4_FIXED1.read::<H::Cpu>(),
        );
        if let Err(err) = unsafe { H::Cpu::vmxon(region.phys_addr().as_usize() as u64) } {
            unsafe { H::Cpu::write_cr4(old_cr4) };
            error!(
                "[VMM] VMX instruction vmxon failed on CPU {}: {:?}",
                self.cpu_id, err
            );
            return Err(as_vmx_err::<H::Cpu>(err));
        }

        self.vmcs_revision_id = vmx_basic.revision_id;
        self.vmxon_region = Some(region);
        info!("[VMM] succeeded to turn on VMX on CPU {}.", self.cpu_id);
        Ok(())
    }

    /// Leaves VMX root operation on this core and frees its VMXON region.
    /// Clears the current VMCS first, if any. A core that never entered VMX
    /// operation is left alone.
    pub fn disable_core(&mut self) -> Result {
        let mut result = Ok(());
        if let Some(vmcs) = self.current_vmcs.take() {
            if let Err(err) = unsafe { H::Cpu::vmclear(vmcs.as_usize() as u64) } {
                warn!(
                    "[VMM] failed to clear VMCS {:#x} on CPU {}: {:?}",
                    vmcs.as_usize(),
                    self.cpu_id,
                    err
                );
            }
        }
        if let Some(region) = self.vmxon_region.take() {
            if let Err(err) = unsafe { H::Cpu::vmxoff() } {
                error!(
                    "[VMM] VMX instruction vmxoff failed on CPU {}: {:?}",
                    self.cpu_id, err
                );
                result = Err(VmxError::InvalidState);
            }
            unsafe {
                H::Cpu::write_cr4(
                    H::Cpu::read_cr4() & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits(),
                )
            };
            drop(region);
            info!("[VMM] succeeded to turn off VMX on CPU {}.", self.cpu_id);
        }
        result
    }

    /// Makes `vmcs` the current VMCS of this core.
    pub fn load_vmcs(&mut self, vmcs: &VmxRegion<H>) -> Result {
        if !self.is_enabled() {
            return Err(VmxError::NotEnabled);
        }
        vmcs.load()?;
        self.current_vmcs = Some(vmcs.phys_addr());
        debug!(
            "[VMM] VMCS {:#x} loaded on CPU {}",
            vmcs.phys_addr().as_usize(),
            self.cpu_id
        );
        Ok(())
    }

    /// Clears `vmcs`, which stops being current on this core if it was.
    pub fn clear_vmcs(&mut self, vmcs: &VmxRegion<H>) -> Result {
        if !self.is_enabled() {
            return Err(VmxError::NotEnabled);
        }
        vmcs.clear()?;
        if self.current_vmcs == Some(vmcs.phys_addr()) {
            self.current_vmcs = None;
            debug!(
                "[VMM] VMCS {:#x} cleared on CPU {}",
                vmcs.phys_addr().as_usize(),
                self.cpu_id
            );
        }
        Ok(())
    }
}

/// VMX state of every CPU that may host a VCPU, one slot per CPU.
///
/// Each slot is only ever locked by code pinned to that slot's CPU. VMX is
/// turned off on every CPU when the last owner drops the states.
pub struct PerCpuStates<H: VmmHal> {
    states: Vec<Mutex<VmxPerCpuState<H>>>,
}

impl<H: VmmHal> PerCpuStates<H> {
    pub fn new() -> Self {
        Self {
            states: (0..H::cpu_count())
                .map(|cpu| Mutex::new(VmxPerCpuState::new(cpu)))
                .collect(),
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.states.len()
    }

    /// The state of `cpu`.
    pub fn get(&self, cpu: usize) -> Result<&Mutex<VmxPerCpuState<H>>> {
        self.states.get(cpu).ok_or(VmxError::OutOfRange)
    }

    /// Enables VMX on every CPU. If any CPU fails, all CPUs are disabled again
    /// and the first error is returned.
    pub fn enable_all(&self) -> Result {
        let first_error = Mutex::new(None);
        H::on_each_cpu(&|cpu| {
            let Some(state) = self.states.get(cpu) else {
                return;
            };
            if let Err(err) = state.lock().enable_core() {
                warn!("[VMM] failed to enable VMX on CPU {}: {}", cpu, err);
                first_error.lock().get_or_insert(err);
            }
        });
        match first_error.into_inner() {
            Some(err) => {
                self.disable_all();
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Disables VMX on every CPU that enabled it. Failures are logged and do
    /// not stop the other CPUs.
    pub fn disable_all(&self) {
        H::on_each_cpu(&|cpu| {
            if let Some(state) = self.states.get(cpu) {
                if let Err(err) = state.lock().disable_core() {
                    warn!("[VMM] failed to disable VMX on CPU {}: {}", cpu, err);
                }
            }
        });
    }
}

impl<H: VmmHal> Default for PerCpuStates<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: VmmHal> Drop for PerCpuStates<H> {
    fn drop(&mut self) {
        self.disable_all();
        info!("[VMM] VMX disabled on {} CPUs", self.cpu_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::{MockCpu, MockHal};

    fn enable_on(cpu: usize) -> (VmxPerCpuState<MockHal>, Result) {
        MockHal::run_on(cpu, || {
            let mut state = VmxPerCpuState::<MockHal>::new(cpu);
            let result = state.enable_core();
            (state, result)
        })
    }

    #[test]
    fn test_enable_and_disable_core() {
        MockHal::reset();
        let (mut state, result) = enable_on(0);
        assert_eq!(result, Ok(()));
        assert!(state.is_enabled());
        assert_eq!(state.vmcs_revision_id(), MockCpu::DEFAULT_REVISION_ID);
        assert!(MockCpu::in_vmx_operation(0));
        assert!(MockCpu::cr4_vmxe(0));
        assert_eq!(state.enable_core(), Err(VmxError::AlreadyEnabled));

        MockHal::run_on(0, || state.disable_core()).unwrap();
        assert!(!state.is_enabled());
        assert!(!MockCpu::in_vmx_operation(0));
        assert!(!MockCpu::cr4_vmxe(0));
        assert_eq!(MockHal::outstanding_frames(), 0);
    }

    #[test]
    fn test_disable_never_enabled_core_is_noop() {
        MockHal::reset();
        let mut state = VmxPerCpuState::<MockHal>::new(1);
        assert_eq!(MockHal::run_on(1, || state.disable_core()), Ok(()));
        assert_eq!(MockHal::run_on(1, || state.disable_core()), Ok(()));
    }

    #[test]
    fn test_enable_without_vmx_support() {
        MockHal::reset();
        MockCpu::set_has_vmx(false);
        let (state, result) = enable_on(0);
        assert!(matches!(result, Err(VmxError::Unsupported(_))));
        assert!(!state.is_enabled());
    }

    #[test]
    fn test_enable_disabled_by_bios() {
        MockHal::reset();
        MockCpu::set_feature_control(FeatureControlFlags::LOCKED.bits());
        let (_, result) = enable_on(0);
        assert_eq!(result, Err(VmxError::Unsupported("VMX disabled by BIOS")));
        assert_eq!(MockHal::outstanding_frames(), 0);
    }

    #[test]
    fn test_enable_out_of_memory_leaves_core_disabled() {
        MockHal::reset();
        MockHal::fail_allocations_after(0);
        let (state, result) = enable_on(0);
        assert_eq!(result, Err(VmxError::OutOfMemory));
        assert!(!state.is_enabled());
        assert!(!MockCpu::cr4_vmxe(0));
    }

    #[test]
    fn test_enable_two_cores_disable_both_no_leak() {
        MockHal::reset();
        MockHal::set_cpu_count(2);
        let states = PerCpuStates::<MockHal>::new();
        states.enable_all().unwrap();
        assert_eq!(MockHal::outstanding_frames(), 2);
        assert!(MockCpu::in_vmx_operation(0));
        assert!(MockCpu::in_vmx_operation(1));

        states.disable_all();
        assert_eq!(MockHal::outstanding_frames(), 0);
        assert!(!MockCpu::in_vmx_operation(0));
        assert!(!MockCpu::in_vmx_operation(1));
    }

    #[test]
    fn test_dropping_states_disables_all_cores() {
        MockHal::reset();
        MockHal::set_cpu_count(2);
        let states = PerCpuStates::<MockHal>::new();
        states.enable_all().unwrap();
        drop(states);
        assert_eq!(MockHal::outstanding_frames(), 0);
        assert!(!MockCpu::in_vmx_operation(0));
        assert!(!MockCpu::in_vmx_operation(1));
    }

    #[test]
    fn test_partial_enable_is_rolled_back() {
        MockHal::reset();
        MockHal::set_cpu_count(3);
        // The second VMXON region allocation fails.
        MockHal::fail_allocations_after(1);
        let states = PerCpuStates::<MockHal>::new();
        assert_eq!(states.enable_all(), Err(VmxError::OutOfMemory));
        assert_eq!(MockHal::outstanding_frames(), 0);
        for cpu in 0..3 {
            assert!(!MockCpu::in_vmx_operation(cpu));
        }
    }

    #[test]
    fn test_vmcs_bookkeeping() {
        MockHal::reset();
        MockHal::run_on(0, || {
            let mut state = VmxPerCpuState::<MockHal>::new(0);
            let vmcs = VmxRegion::<MockHal>::new(0).unwrap();
            assert_eq!(state.load_vmcs(&vmcs), Err(VmxError::NotEnabled));

            state.enable_core().unwrap();
            state.clear_vmcs(&vmcs).unwrap();
            state.load_vmcs(&vmcs).unwrap();
            assert_eq!(state.current_vmcs(), Some(vmcs.phys_addr()));
            assert_eq!(MockCpu::current_vmcs(0), Some(vmcs.phys_addr().as_usize() as u64));

            // Disabling clears the current VMCS but leaves freeing it to its owner.
            state.disable_core().unwrap();
            assert_eq!(state.current_vmcs(), None);
            assert_eq!(MockHal::outstanding_frames(), 1);
            drop(vmcs);
            assert_eq!(MockHal::outstanding_frames(), 0);
        });
    }
}
