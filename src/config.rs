use x86::vmx::vmcs::control::{EntryControls, ExitControls, PinbasedControls, PrimaryControls};

/// Capacity of the VCPU table of a VM. VCPU ids must be below it.
pub const VCPU_MAX: usize = 4;

/// Requested VMX controls of a VM's VCPUs.
///
/// These are requests, not final values: every control word is passed
/// through the capability MSRs before it reaches a VMCS, so bits the CPU
/// does not allow are dropped and bits it requires are forced on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxConfig {
    pub pin_based: PinbasedControls,
    pub primary_processor_based: PrimaryControls,
    pub vm_exit: ExitControls,
    pub vm_entry: EntryControls,
    /// Guest exceptions that cause a VM exit.
    pub exception_bitmap: u32,
}

impl Default for VmxConfig {
    fn default() -> Self {
        Self {
            pin_based: PinbasedControls::empty(),
            // Halt exits give the host its only way back from a flat guest.
            primary_processor_based: PrimaryControls::HLT_EXITING,
            vm_exit: ExitControls::ACK_INTERRUPT_ON_EXIT | ExitControls::HOST_ADDRESS_SPACE_SIZE,
            vm_entry: EntryControls::IA32E_MODE_GUEST,
            exception_bitmap: 0,
        }
    }
}
