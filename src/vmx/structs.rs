use bit_field::BitField;
use bitflags::bitflags;

use super::instructions::VmxCpu;
use super::vmcs::as_vmx_err;
use crate::frame::ContiguousPhysFrames;
use crate::msr::{Msr, MsrReadWrite};
use crate::{HostPhysAddr, Result, VmmHal};

/// VMCS/VMXON region, sized and stamped as `IA32_VMX_BASIC` demands.
/// (SDM Vol. 3C, Section 25.2)
#[derive(Debug)]
pub struct VmxRegion<H: VmmHal> {
    frames: ContiguousPhysFrames<H>,
    revision_id: u32,
}

impl<H: VmmHal> VmxRegion<H> {
    /// Allocates a zeroed region on the NUMA node of `cpu` and stamps the
    /// VMCS revision identifier into its header.
    pub fn new(cpu: usize) -> Result<Self> {
        let basic = VmxBasic::read::<H::Cpu>();
        let frames =
            ContiguousPhysFrames::alloc_zero(basic.region_size as usize, H::cpu_to_node(cpu))?;
        unsafe {
            (*(frames.as_mut_ptr() as *mut u32))
                .set_bits(0..=30, basic.revision_id.get_bits(0..=30))
                .set_bit(31, false);
        }
        debug!(
            "[VMM] allocated VmxRegion({:#x}, {} bytes, revision {:#x})",
            frames.start_paddr().as_usize(),
            frames.size(),
            basic.revision_id
        );
        Ok(Self {
            frames,
            revision_id: basic.revision_id,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frames.start_paddr()
    }

    /// Allocated size in bytes, at least the size `IA32_VMX_BASIC` reports.
    pub fn size(&self) -> usize {
        self.frames.size()
    }

    /// The revision identifier this region was stamped with.
    pub fn revision_id(&self) -> u32 {
        self.revision_id
    }

    /// Revision identifier as currently stored in the region header.
    pub fn header_revision_id(&self) -> u32 {
        unsafe { *(self.frames.as_mut_ptr() as *const u32) }.get_bits(0..=30)
    }

    /// VMCLEAR: flush the region and mark it inactive and clear.
    pub fn clear(&self) -> Result {
        unsafe { H::Cpu::vmclear(self.phys_addr().as_usize() as u64) }
            .map_err(as_vmx_err::<H::Cpu>)
    }

    /// VMPTRLD: make the region the current VMCS of this CPU.
    pub fn load(&self) -> Result {
        unsafe { H::Cpu::vmptrld(self.phys_addr().as_usize() as u64) }
            .map_err(as_vmx_err::<H::Cpu>)
    }
}

/// Reporting Register of Basic VMX Capabilities. (SDM Vol. 3D, Appendix A.1)
#[derive(Debug)]
pub struct VmxBasic {
    /// The VMCS revision identifier used by the processor.
    pub revision_id: u32,
    /// The number of bytes that software should allocate for the VMXON region
    /// and any VMCS region.
    pub region_size: u32,
    /// The width of the physical addresses that may be used for the VMXON
    /// region, each VMCS, and data structures referenced by pointers in a VMCS.
    pub is_32bit_address: bool,
    /// The memory type that should be used for the VMCS, for data structures
    /// referenced by pointers in the VMCS.
    pub mem_type: u8,
    /// The processor reports information in the VM-exit instruction-information
    /// field on VM exits due to execution of the INS and OUTS instructions.
    pub io_exit_info: bool,
    /// If any VMX controls that default to 1 may be cleared to 0.
    pub vmx_flex_controls: bool,
}

impl MsrReadWrite for VmxBasic {
    const MSR: Msr = Msr::IA32_VMX_BASIC;
}

impl VmxBasic {
    pub const VMX_MEMORY_TYPE_WRITE_BACK: u8 = 6;

    /// Read the current IA32_VMX_BASIC flags.
    pub fn read<C: VmxCpu>() -> Self {
        Self::from_raw(Self::read_raw::<C>())
    }

    pub fn from_raw(msr: u64) -> Self {
        Self {
            revision_id: msr as u32,
            region_size: msr.get_bits(32..49) as u32,
            is_32bit_address: msr.get_bit(48),
            mem_type: msr.get_bits(50..54) as u8,
            io_exit_info: msr.get_bit(54),
            vmx_flex_controls: msr.get_bit(55),
        }
    }
}

bitflags! {
    /// IA32_FEATURE_CONTROL flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
       /// Lock bit: when set, locks this MSR from being written. when clear,
       /// VMXON causes a #GP.
       const LOCKED = 1 << 0;
       /// Enable VMX inside SMX operation.
       const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
       /// Enable VMX outside SMX operation.
       const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
   }
}

/// Control Features in Intel 64 Processor. (SDM Vol. 3C, Section 24.7)
pub struct FeatureControl;

impl MsrReadWrite for FeatureControl {
    const MSR: Msr = Msr::IA32_FEATURE_CONTROL;
}

impl FeatureControl {
    /// Read the current IA32_FEATURE_CONTROL flags.
    pub fn read<C: VmxCpu>() -> FeatureControlFlags {
        FeatureControlFlags::from_bits_truncate(Self::read_raw::<C>())
    }

    /// Write IA32_FEATURE_CONTROL flags, preserving reserved values.
    pub fn write<C: VmxCpu>(flags: FeatureControlFlags) {
        let old_value = Self::read_raw::<C>();
        let reserved = old_value & !(FeatureControlFlags::all().bits());
        let new_value = reserved | flags.bits();
        unsafe { Self::write_raw::<C>(new_value) };
    }
}
