use numeric_enum_macro::numeric_enum;

use crate::vmx::VmxCpu;

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    #[allow(non_camel_case_types)]
    /// X86 model-specific registers. (SDM Vol. 4)
    pub enum Msr {
        IA32_FEATURE_CONTROL = 0x3a,

        IA32_SYSENTER_CS = 0x174,
        IA32_SYSENTER_ESP = 0x175,
        IA32_SYSENTER_EIP = 0x176,

        IA32_PAT = 0x277,

        IA32_VMX_BASIC = 0x480,
        IA32_VMX_PINBASED_CTLS = 0x481,
        IA32_VMX_PROCBASED_CTLS = 0x482,
        IA32_VMX_EXIT_CTLS = 0x483,
        IA32_VMX_ENTRY_CTLS = 0x484,
        IA32_VMX_CR0_FIXED0 = 0x486,
        IA32_VMX_CR0_FIXED1 = 0x487,
        IA32_VMX_CR4_FIXED0 = 0x488,
        IA32_VMX_CR4_FIXED1 = 0x489,
        IA32_VMX_PROCBASED_CTLS2 = 0x48b,
        IA32_VMX_TRUE_PINBASED_CTLS = 0x48d,
        IA32_VMX_TRUE_PROCBASED_CTLS = 0x48e,
        IA32_VMX_TRUE_EXIT_CTLS = 0x48f,
        IA32_VMX_TRUE_ENTRY_CTLS = 0x490,

        IA32_EFER = 0xc000_0080,
        IA32_FS_BASE = 0xc000_0100,
        IA32_GS_BASE = 0xc000_0101,
    }
}

/// Distance from a VMX control capability MSR to its `TRUE_` variant.
pub const VMX_TRUE_CTLS_OFFSET: u32 = 0xc;

impl Msr {
    /// Read 64 bits msr register.
    #[inline(always)]
    pub fn read<C: VmxCpu>(self) -> u64 {
        C::read_msr(self as u32)
    }

    /// Write 64 bits to msr register.
    ///
    /// # Safety
    ///
    /// The caller must ensure that this write operation has no unsafe side
    /// effects.
    #[inline(always)]
    pub unsafe fn write<C: VmxCpu>(self, value: u64) {
        unsafe { C::write_msr(self as u32, value) }
    }

    /// The `TRUE_` capability MSR paired with a default-setting VMX control
    /// capability MSR, when `IA32_VMX_BASIC` reports true controls.
    pub fn true_ctls(self) -> Self {
        match self {
            Self::IA32_VMX_PINBASED_CTLS
            | Self::IA32_VMX_PROCBASED_CTLS
            | Self::IA32_VMX_EXIT_CTLS
            | Self::IA32_VMX_ENTRY_CTLS => {
                Self::try_from(self as u32 + VMX_TRUE_CTLS_OFFSET).unwrap_or(self)
            }
            other => other,
        }
    }
}

pub(crate) trait MsrReadWrite {
    const MSR: Msr;

    fn read_raw<C: VmxCpu>() -> u64 {
        Self::MSR.read::<C>()
    }

    unsafe fn write_raw<C: VmxCpu>(flags: u64) {
        unsafe { Self::MSR.write::<C>(flags) }
    }
}
