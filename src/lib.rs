#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

pub(crate) mod msr;
#[macro_use]
pub(crate) mod regs;
mod config;
mod device;
mod error;
mod frame;
mod hal;
mod segmentation;
pub mod uapi;
mod vcpu;
mod vm;

mod vmx;

#[cfg(test)]
pub(crate) mod test_utils;
#[cfg(test)]
mod tests;

pub use config::{VCPU_MAX, VmxConfig};
pub use device::{IoctlOutput, VcpuHandle, VmHandle, Vmm};
pub use error::{Result, VmxError};
pub use hal::{HostPhysAddr, HostVirtAddr, VmmHal};
pub use regs::GeneralRegisters;
pub use segmentation::{Segment, SegmentAccessRights};
pub use uapi::{KvmDtable, KvmRegs, KvmRun, KvmSegment, KvmSregs};
pub use vcpu::{RunState, Vcpu};
pub use vm::Vm;
pub use vmx::{
    ExitAction, ExitHandler, PerCpuStates, VmxCpu, VmxExitInfo, VmxExitReason,
    VmxInstructionError, VmxPerCpuState, VmxVcpu, has_hardware_support,
};
#[cfg(target_arch = "x86_64")]
pub use vmx::HostCpu;
