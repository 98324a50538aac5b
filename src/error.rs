use core::fmt;

use axerrno::{AxError, LinuxError};

use crate::vmx::VmxInstructionError;

/// Errors reported by the virtualization engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxError {
    /// A region or page could not be allocated.
    OutOfMemory,
    /// A VMX instruction ran without a valid current VMCS (`VMfailInvalid`),
    /// or an operation was attempted in the wrong lifecycle state.
    InvalidState,
    /// A VMX instruction was rejected against a valid current VMCS
    /// (`VMfailValid`), with the cause read from the VM-instruction error field.
    OperationFailed(VmxInstructionError),
    /// A VCPU id is not below the VM's capacity.
    OutOfRange,
    /// The request or the platform feature is not supported.
    Unsupported(&'static str),
    /// VMX operation is not enabled on the current CPU.
    NotEnabled,
    /// VMX operation is already enabled on the current CPU.
    AlreadyEnabled,
    /// The VCPU is already running on some CPU.
    VcpuBusy,
    /// A VCPU with the requested id already exists in the VM.
    VcpuExists,
    /// A user buffer could not be read or written.
    BadAddress,
    /// The host state is not usable for VMX operation.
    InvalidConfig(&'static str),
}

/// A specialized [`Result`](core::result::Result) type for the engine.
pub type Result<T = ()> = core::result::Result<T, VmxError>;

impl fmt::Display for VmxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidState => write!(f, "VMfailInvalid: no valid current VMCS"),
            Self::OperationFailed(err) => write!(f, "VMfailValid: {}", err.as_str()),
            Self::OutOfRange => write!(f, "VCPU id out of range"),
            Self::Unsupported(what) => write!(f, "unsupported: {what}"),
            Self::NotEnabled => write!(f, "VMX is not enabled"),
            Self::AlreadyEnabled => write!(f, "VMX is already enabled"),
            Self::VcpuBusy => write!(f, "VCPU is already running"),
            Self::VcpuExists => write!(f, "VCPU id already in use"),
            Self::BadAddress => write!(f, "bad user address"),
            Self::InvalidConfig(what) => write!(f, "invalid configuration: {what}"),
        }
    }
}

impl From<VmxError> for AxError {
    fn from(err: VmxError) -> Self {
        match err {
            VmxError::OutOfMemory => AxError::NoMemory,
            VmxError::InvalidState | VmxError::NotEnabled | VmxError::AlreadyEnabled => {
                AxError::BadState
            }
            VmxError::OperationFailed(_) => AxError::Io,
            VmxError::OutOfRange | VmxError::InvalidConfig(_) => AxError::InvalidInput,
            VmxError::Unsupported(_) => AxError::Unsupported,
            VmxError::VcpuBusy => AxError::ResourceBusy,
            VmxError::VcpuExists => AxError::AlreadyExists,
            VmxError::BadAddress => AxError::BadAddress,
        }
    }
}

impl VmxError {
    /// The errno reported to the caller of an ioctl.
    pub fn errno(self) -> LinuxError {
        match self {
            // The device node answers unknown ioctls the way KVM does.
            Self::Unsupported(_) => LinuxError::ENOTTY,
            err => LinuxError::from(AxError::from(err)),
        }
    }
}
