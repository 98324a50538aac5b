mod definitions;
mod instructions;
mod percpu;
mod structs;
mod vcpu;
mod vmcs;

pub use self::definitions::{VmxExitReason, VmxInstructionError};
pub use self::instructions::{HostSelectors, LaunchFrame, VmxCpu};
pub use self::percpu::{PerCpuStates, VmxPerCpuState};
pub use self::structs::VmxRegion;
pub use self::vcpu::{ExitAction, ExitHandler, GuestSnapshot, VmxVcpu};
pub use self::vmcs::{VmxExitInfo, VmxIoExitInfo, adjust_controls};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use self::instructions::HostCpu;
    }
}

/// Return if the platform behind `C` supports the virtualization extension.
pub fn has_hardware_support<C: VmxCpu>() -> bool {
    C::has_vmx()
}
