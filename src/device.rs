//! The handle objects behind the device node and the file descriptors it
//! hands out, with their ioctl dispatch.

use alloc::sync::Arc;
use core::mem::size_of;

use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

use crate::uapi::{
    KVM_API_VERSION, KVM_CHECK_EXTENSION, KVM_CREATE_VCPU, KVM_CREATE_VM, KVM_GET_API_VERSION,
    KVM_GET_REGS, KVM_GET_SREGS, KVM_GET_VCPU_MMAP_SIZE, KVM_RUN, KVM_SET_REGS, KVM_SET_SREGS,
    KVM_SET_TSS_ADDR, KVM_SET_USER_MEMORY_REGION, KvmRegs, KvmSregs, KvmUserspaceMemoryRegion,
};
use crate::vmx::PerCpuStates;
use crate::{HostPhysAddr, Result, Vcpu, Vm, VmmHal, VmxConfig, VmxError};

/// What an ioctl produced: a plain return value or a new handle.
#[derive(Debug)]
pub enum IoctlOutput<H: VmmHal> {
    Value(usize),
    Vm(VmHandle<H>),
    Vcpu(VcpuHandle<H>),
}

impl<H: VmmHal> IoctlOutput<H> {
    /// The plain return value, if the ioctl produced one.
    pub fn value(&self) -> Option<usize> {
        match self {
            Self::Value(value) => Some(*value),
            _ => None,
        }
    }
}

/// The virtualization engine behind the device node.
///
/// Creating it enables VMX on every CPU. VMX stays on until the device node
/// and every VM and VCPU handle created through it are dropped.
pub struct Vmm<H: VmmHal> {
    config: VmxConfig,
    percpu: Arc<PerCpuStates<H>>,
}

impl<H: VmmHal> Vmm<H> {
    pub fn new() -> Result<Self> {
        Self::with_config(VmxConfig::default())
    }

    /// Enables VMX on all CPUs; VMs created later use `config`.
    pub fn with_config(config: VmxConfig) -> Result<Self> {
        let percpu = Arc::new(PerCpuStates::new());
        percpu.enable_all()?;
        info!("[VMM] VMX enabled on {} CPUs", percpu.cpu_count());
        Ok(Self { config, percpu })
    }

    pub fn percpu(&self) -> &PerCpuStates<H> {
        &self.percpu
    }

    pub fn create_vm(&self) -> VmHandle<H> {
        VmHandle {
            vm: Arc::new(Vm::new(self.config, self.percpu.clone())),
        }
    }

    pub fn ioctl(&self, cmd: u32, _arg: usize) -> Result<IoctlOutput<H>> {
        match cmd {
            KVM_GET_API_VERSION => Ok(IoctlOutput::Value(KVM_API_VERSION)),
            // No optional capability is offered.
            KVM_CHECK_EXTENSION => Ok(IoctlOutput::Value(0)),
            KVM_GET_VCPU_MMAP_SIZE => Ok(IoctlOutput::Value(PAGE_SIZE)),
            KVM_CREATE_VM => Ok(IoctlOutput::Vm(self.create_vm())),
            _ => unsupported(cmd),
        }
    }
}

/// A handle on a [`Vm`]. The VM is destroyed when its last handle and the
/// handles of all its VCPUs are dropped.
#[derive(Debug)]
pub struct VmHandle<H: VmmHal> {
    vm: Arc<Vm<H>>,
}

impl<H: VmmHal> VmHandle<H> {
    pub fn vm(&self) -> &Vm<H> {
        &self.vm
    }

    pub fn create_vcpu(&self, id: usize) -> Result<VcpuHandle<H>> {
        Ok(VcpuHandle {
            vcpu: self.vm.create_vcpu(id)?,
        })
    }

    pub fn ioctl(&self, cmd: u32, arg: usize) -> Result<IoctlOutput<H>> {
        match cmd {
            KVM_CREATE_VCPU => Ok(IoctlOutput::Vcpu(self.create_vcpu(arg)?)),
            KVM_SET_USER_MEMORY_REGION => {
                // Guest memory is managed outside the engine.
                let region: KvmUserspaceMemoryRegion = read_user::<H, _>(arg)?;
                debug!("[VMM] ignoring memory region {:#x?}", region);
                Ok(IoctlOutput::Value(0))
            }
            KVM_SET_TSS_ADDR => Ok(IoctlOutput::Value(0)),
            _ => unsupported(cmd),
        }
    }
}

/// A handle on a [`Vcpu`].
#[derive(Debug)]
pub struct VcpuHandle<H: VmmHal> {
    vcpu: Arc<Vcpu<H>>,
}

impl<H: VmmHal> VcpuHandle<H> {
    pub fn vcpu(&self) -> &Vcpu<H> {
        &self.vcpu
    }

    pub fn ioctl(&self, cmd: u32, arg: usize) -> Result<IoctlOutput<H>> {
        match cmd {
            KVM_RUN => {
                self.vcpu.run()?;
                Ok(IoctlOutput::Value(0))
            }
            KVM_GET_REGS => {
                write_user::<H, _>(arg, &self.vcpu.get_regs()?)?;
                Ok(IoctlOutput::Value(0))
            }
            KVM_SET_REGS => {
                self.vcpu.set_regs(&read_user::<H, KvmRegs>(arg)?)?;
                Ok(IoctlOutput::Value(0))
            }
            KVM_GET_SREGS => {
                write_user::<H, _>(arg, &self.vcpu.get_sregs()?)?;
                Ok(IoctlOutput::Value(0))
            }
            KVM_SET_SREGS => {
                self.vcpu.set_sregs(&read_user::<H, KvmSregs>(arg)?)?;
                Ok(IoctlOutput::Value(0))
            }
            _ => unsupported(cmd),
        }
    }

    /// Backs page `pgoff` of a mapping of this handle.
    pub fn mmap_fault(&self, pgoff: usize) -> Result<HostPhysAddr> {
        self.vcpu.fault(pgoff)
    }
}

fn unsupported<T>(cmd: u32) -> Result<T> {
    debug!("[VMM] unsupported ioctl {:#x}", cmd);
    Err(VmxError::Unsupported("ioctl"))
}

/// Reads a plain `#[repr(C)]` uAPI structure from user address `src`.
fn read_user<H: VmmHal, T: Copy + Default>(src: usize) -> Result<T> {
    let mut value = T::default();
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(&mut value as *mut T as *mut u8, size_of::<T>())
    };
    if H::copy_from_user(bytes, src) {
        Ok(value)
    } else {
        Err(VmxError::BadAddress)
    }
}

/// Writes a plain `#[repr(C)]` uAPI structure to user address `dst`.
fn write_user<H: VmmHal, T: Copy>(dst: usize, value: &T) -> Result {
    let bytes =
        unsafe { core::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) };
    if H::copy_to_user(dst, bytes) {
        Ok(())
    } else {
        Err(VmxError::BadAddress)
    }
}
