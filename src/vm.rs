use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

use crate::vmx::PerCpuStates;
use crate::{Result, VCPU_MAX, Vcpu, VmmHal, VmxConfig, VmxError};

/// A Virtual Machine: a fixed-capacity table of VCPUs sharing one
/// [`VmxConfig`].
pub struct Vm<H: VmmHal> {
    config: VmxConfig,
    percpu: Arc<PerCpuStates<H>>,
    vcpus: Mutex<[Option<Arc<Vcpu<H>>>; VCPU_MAX]>,
}

impl<H: VmmHal> Vm<H> {
    /// Create an empty VM whose VCPUs run on the CPUs in `percpu`.
    pub fn new(config: VmxConfig, percpu: Arc<PerCpuStates<H>>) -> Self {
        debug!("[VMM] created VM");
        Self {
            config,
            percpu,
            vcpus: Mutex::new([const { None }; VCPU_MAX]),
        }
    }

    pub fn config(&self) -> &VmxConfig {
        &self.config
    }

    /// Creates VCPU `id` and installs it in the VCPU table.
    ///
    /// The table is left unchanged if this fails.
    pub fn create_vcpu(&self, id: usize) -> Result<Arc<Vcpu<H>>> {
        if id >= VCPU_MAX {
            return Err(VmxError::OutOfRange);
        }
        let mut vcpus = self.vcpus.lock();
        if vcpus[id].is_some() {
            return Err(VmxError::VcpuExists);
        }
        let vcpu = Arc::new(Vcpu::new(id, self.config, self.percpu.clone())?);
        vcpus[id] = Some(vcpu.clone());
        Ok(vcpu)
    }

    #[inline]
    pub fn vcpu(&self, id: usize) -> Option<Arc<Vcpu<H>>> {
        self.vcpus.lock().get(id).cloned().flatten()
    }

    /// Number of VCPUs created so far.
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.lock().iter().filter(|vcpu| vcpu.is_some()).count()
    }
}

impl<H: VmmHal> fmt::Debug for Vm<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("config", &self.config)
            .field("vcpu_count", &self.vcpu_count())
            .finish()
    }
}
