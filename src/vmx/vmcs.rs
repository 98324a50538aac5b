#![allow(non_camel_case_types)]
#![allow(clippy::upper_case_acronyms)]

use bit_field::BitField;
use numeric_enum_macro::numeric_enum;

use super::definitions::{VmxExitReason, VmxInstructionError};
use super::instructions::VmxCpu;
use super::structs::VmxBasic;
use crate::msr::Msr;
use crate::{Result, VmxError};

macro_rules! vmcs_read {
    ($field_enum: ident, u64) => {
        impl $field_enum {
            pub fn read<C: VmxCpu>(self) -> Result<u64> {
                C::vmread(self as u32).map_err(as_vmx_err::<C>)
            }
        }
    };
    ($field_enum: ident, $ux: ty) => {
        impl $field_enum {
            pub fn read<C: VmxCpu>(self) -> Result<$ux> {
                C::vmread(self as u32)
                    .map(|value| value as $ux)
                    .map_err(as_vmx_err::<C>)
            }
        }
    };
}

macro_rules! vmcs_write {
    ($field_enum: ident, $ux: ty) => {
        impl $field_enum {
            pub fn write<C: VmxCpu>(self, value: $ux) -> Result {
                unsafe { C::vmwrite(self as u32, value as u64) }.map_err(as_vmx_err::<C>)
            }
        }
    };
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// 16-Bit Control Fields. (SDM Vol. 3D, Appendix B.1.1)
    pub enum VmcsControl16 {
        /// Virtual-processor identifier (VPID).
        VPID = 0x0,
        /// Posted-interrupt notification vector.
        POSTED_INTERRUPT_NOTIFICATION_VECTOR = 0x2,
        /// EPTP index.
        EPTP_INDEX = 0x4,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// 64-Bit Control Fields. (SDM Vol. 3D, Appendix B.2.1)
    pub enum VmcsControl64 {
        /// Address of I/O bitmap A (full).
        IO_BITMAP_A_ADDR = 0x2000,
        /// Address of I/O bitmap B (full).
        IO_BITMAP_B_ADDR = 0x2002,
        /// Address of MSR bitmaps (full).
        MSR_BITMAPS_ADDR = 0x2004,
        /// VM-exit MSR-store address (full).
        VMEXIT_MSR_STORE_ADDR = 0x2006,
        /// VM-exit MSR-load address (full).
        VMEXIT_MSR_LOAD_ADDR = 0x2008,
        /// VM-entry MSR-load address (full).
        VMENTRY_MSR_LOAD_ADDR = 0x200A,
        /// Executive-VMCS pointer (full).
        EXECUTIVE_VMCS_PTR = 0x200C,
        /// TSC offset (full).
        TSC_OFFSET = 0x2010,
        /// Virtual-APIC address (full).
        VIRT_APIC_ADDR = 0x2012,
        /// APIC-access address (full).
        APIC_ACCESS_ADDR = 0x2014,
        /// VM-function controls (full).
        VM_FUNCTION_CONTROLS = 0x2018,
        /// EPT pointer (full).
        EPTP = 0x201A,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// 32-Bit Control Fields. (SDM Vol. 3D, Appendix B.3.1)
    pub enum VmcsControl32 {
        /// Pin-based VM-execution controls.
        PINBASED_EXEC_CONTROLS = 0x4000,
        /// Primary processor-based VM-execution controls.
        PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
        /// Exception bitmap.
        EXCEPTION_BITMAP = 0x4004,
        /// Page-fault error-code mask.
        PAGE_FAULT_ERR_CODE_MASK = 0x4006,
        /// Page-fault error-code match.
        PAGE_FAULT_ERR_CODE_MATCH = 0x4008,
        /// CR3-target count.
        CR3_TARGET_COUNT = 0x400A,
        /// VM-exit controls.
        VMEXIT_CONTROLS = 0x400C,
        /// VM-exit MSR-store count.
        VMEXIT_MSR_STORE_COUNT = 0x400E,
        /// VM-exit MSR-load count.
        VMEXIT_MSR_LOAD_COUNT = 0x4010,
        /// VM-entry controls.
        VMENTRY_CONTROLS = 0x4012,
        /// VM-entry MSR-load count.
        VMENTRY_MSR_LOAD_COUNT = 0x4014,
        /// VM-entry interruption-information field.
        VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
        /// VM-entry exception error code.
        VMENTRY_EXCEPTION_ERR_CODE = 0x4018,
        /// VM-entry instruction length.
        VMENTRY_INSTRUCTION_LEN = 0x401A,
        /// TPR threshold.
        TPR_THRESHOLD = 0x401C,
        /// Secondary processor-based VM-execution controls.
        SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401E,
        /// PLE_Gap.
        PLE_GAP = 0x4020,
        /// PLE_Window.
        PLE_WINDOW = 0x4022,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Natural-Width Control Fields. (SDM Vol. 3D, Appendix B.4.1)
    pub enum VmcsControlNW {
        /// CR0 guest/host mask.
        CR0_GUEST_HOST_MASK = 0x6000,
        /// CR4 guest/host mask.
        CR4_GUEST_HOST_MASK = 0x6002,
        /// CR0 read shadow.
        CR0_READ_SHADOW = 0x6004,
        /// CR4 read shadow.
        CR4_READ_SHADOW = 0x6006,
        /// CR3-target value 0.
        CR3_TARGET_VALUE0 = 0x6008,
        /// CR3-target value 1.
        CR3_TARGET_VALUE1 = 0x600A,
        /// CR3-target value 2.
        CR3_TARGET_VALUE2 = 0x600C,
        /// CR3-target value 3.
        CR3_TARGET_VALUE3 = 0x600E,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// 16-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.1.2)
    pub enum VmcsGuest16 {
        ES_SELECTOR = 0x800,
        CS_SELECTOR = 0x802,
        SS_SELECTOR = 0x804,
        DS_SELECTOR = 0x806,
        FS_SELECTOR = 0x808,
        GS_SELECTOR = 0x80a,
        LDTR_SELECTOR = 0x80c,
        TR_SELECTOR = 0x80e,
        INTERRUPT_STATUS = 0x810,
        PML_INDEX = 0x812,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// 64-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.2.3)
    pub enum VmcsGuest64 {
        /// VMCS link pointer (full).
        LINK_PTR = 0x2800,
        IA32_DEBUGCTL = 0x2802,
        IA32_PAT = 0x2804,
        IA32_EFER = 0x2806,
        IA32_PERF_GLOBAL_CTRL = 0x2808,
        PDPTE0 = 0x280A,
        PDPTE1 = 0x280C,
        PDPTE2 = 0x280E,
        PDPTE3 = 0x2810,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// 32-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.3.3)
    pub enum VmcsGuest32 {
        ES_LIMIT = 0x4800,
        CS_LIMIT = 0x4802,
        SS_LIMIT = 0x4804,
        DS_LIMIT = 0x4806,
        FS_LIMIT = 0x4808,
        GS_LIMIT = 0x480A,
        LDTR_LIMIT = 0x480C,
        TR_LIMIT = 0x480E,
        GDTR_LIMIT = 0x4810,
        IDTR_LIMIT = 0x4812,
        ES_ACCESS_RIGHTS = 0x4814,
        CS_ACCESS_RIGHTS = 0x4816,
        SS_ACCESS_RIGHTS = 0x4818,
        DS_ACCESS_RIGHTS = 0x481A,
        FS_ACCESS_RIGHTS = 0x481C,
        GS_ACCESS_RIGHTS = 0x481E,
        LDTR_ACCESS_RIGHTS = 0x4820,
        TR_ACCESS_RIGHTS = 0x4822,
        INTERRUPTIBILITY_STATE = 0x4824,
        ACTIVITY_STATE = 0x4826,
        SMBASE = 0x4828,
        IA32_SYSENTER_CS = 0x482A,
        VMX_PREEMPTION_TIMER_VALUE = 0x482E,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Natural-Width Guest-State Fields. (SDM Vol. 3D, Appendix B.4.3)
    pub enum VmcsGuestNW {
        CR0 = 0x6800,
        CR3 = 0x6802,
        CR4 = 0x6804,
        ES_BASE = 0x6806,
        CS_BASE = 0x6808,
        SS_BASE = 0x680A,
        DS_BASE = 0x680C,
        FS_BASE = 0x680E,
        GS_BASE = 0x6810,
        LDTR_BASE = 0x6812,
        TR_BASE = 0x6814,
        GDTR_BASE = 0x6816,
        IDTR_BASE = 0x6818,
        DR7 = 0x681A,
        RSP = 0x681C,
        RIP = 0x681E,
        RFLAGS = 0x6820,
        PENDING_DBG_EXCEPTIONS = 0x6822,
        IA32_SYSENTER_ESP = 0x6824,
        IA32_SYSENTER_EIP = 0x6826,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// 16-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.1.3)
    pub enum VmcsHost16 {
        ES_SELECTOR = 0xC00,
        CS_SELECTOR = 0xC02,
        SS_SELECTOR = 0xC04,
        DS_SELECTOR = 0xC06,
        FS_SELECTOR = 0xC08,
        GS_SELECTOR = 0xC0A,
        TR_SELECTOR = 0xC0C,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// 64-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.2.4)
    pub enum VmcsHost64 {
        IA32_PAT = 0x2C00,
        IA32_EFER = 0x2C02,
        IA32_PERF_GLOBAL_CTRL = 0x2C04,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// 32-Bit Host-State Field. (SDM Vol. 3D, Appendix B.3.4)
    pub enum VmcsHost32 {
        IA32_SYSENTER_CS = 0x4C00,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Natural-Width Host-State Fields. (SDM Vol. 3D, Appendix B.4.4)
    pub enum VmcsHostNW {
        CR0 = 0x6C00,
        CR3 = 0x6C02,
        CR4 = 0x6C04,
        FS_BASE = 0x6C06,
        GS_BASE = 0x6C08,
        TR_BASE = 0x6C0A,
        GDTR_BASE = 0x6C0C,
        IDTR_BASE = 0x6C0E,
        IA32_SYSENTER_ESP = 0x6C10,
        IA32_SYSENTER_EIP = 0x6C12,
        RSP = 0x6C14,
        RIP = 0x6C16,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// 64-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.2.2)
    pub enum VmcsReadOnly64 {
        GUEST_PHYSICAL_ADDR = 0x2400,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// 32-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.3.2)
    pub enum VmcsReadOnly32 {
        VM_INSTRUCTION_ERROR = 0x4400,
        EXIT_REASON = 0x4402,
        VMEXIT_INTERRUPTION_INFO = 0x4404,
        VMEXIT_INTERRUPTION_ERR_CODE = 0x4406,
        IDT_VECTORING_INFO = 0x4408,
        IDT_VECTORING_ERR_CODE = 0x440A,
        VMEXIT_INSTRUCTION_LEN = 0x440C,
        VMEXIT_INSTRUCTION_INFO = 0x440E,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Natural-Width Read-Only Data Fields. (SDM Vol. 3D, Appendix B.4.2)
    pub enum VmcsReadOnlyNW {
        EXIT_QUALIFICATION = 0x6400,
        IO_RCX = 0x6402,
        IO_RSI = 0x6404,
        IO_RDI = 0x6406,
        IO_RIP = 0x6408,
        GUEST_LINEAR_ADDR = 0x640A,
    }
}

vmcs_read!(VmcsControl16, u16);
vmcs_read!(VmcsControl64, u64);
vmcs_read!(VmcsControl32, u32);
vmcs_read!(VmcsControlNW, u64);
vmcs_read!(VmcsGuest16, u16);
vmcs_read!(VmcsGuest64, u64);
vmcs_read!(VmcsGuest32, u32);
vmcs_read!(VmcsGuestNW, u64);
vmcs_read!(VmcsHost16, u16);
vmcs_read!(VmcsHost64, u64);
vmcs_read!(VmcsHost32, u32);
vmcs_read!(VmcsHostNW, u64);
vmcs_read!(VmcsReadOnly64, u64);
vmcs_read!(VmcsReadOnly32, u32);
vmcs_read!(VmcsReadOnlyNW, u64);

vmcs_write!(VmcsControl16, u16);
vmcs_write!(VmcsControl64, u64);
vmcs_write!(VmcsControl32, u32);
vmcs_write!(VmcsControlNW, u64);
vmcs_write!(VmcsGuest16, u16);
vmcs_write!(VmcsGuest64, u64);
vmcs_write!(VmcsGuest32, u32);
vmcs_write!(VmcsGuestNW, u64);
vmcs_write!(VmcsHost16, u16);
vmcs_write!(VmcsHost64, u64);
vmcs_write!(VmcsHost32, u32);
vmcs_write!(VmcsHostNW, u64);

/// Translates a failed VMX instruction into a [`VmxError`]. A `VMfailValid`
/// carries the cause from the VM-instruction error field of the current VMCS.
pub fn as_vmx_err<C: VmxCpu>(err: x86::vmx::VmFail) -> VmxError {
    use x86::vmx::VmFail;
    match err {
        VmFail::VmFailValid => VmxError::OperationFailed(instruction_error::<C>()),
        VmFail::VmFailInvalid => VmxError::InvalidState,
    }
}

/// The VM-instruction error of the current VMCS.
pub fn instruction_error<C: VmxCpu>() -> VmxInstructionError {
    C::vmread(VmcsReadOnly32::VM_INSTRUCTION_ERROR as u32)
        .map(|code| VmxInstructionError::from(code as u32))
        .unwrap_or_else(|_| VmxInstructionError::from(0))
}

/// Computes the legal value of a control word from a capability MSR.
/// (SDM Vol. 3D, Appendix A.3)
///
/// The low half of `capability` holds the allowed 0-settings (bits that must
/// be 1) and the high half the allowed 1-settings (bits that may be 1).
pub const fn adjust_controls(capability: u64, requested: u32) -> u32 {
    let must_be_one = capability as u32;
    let may_be_one = (capability >> 32) as u32;
    (requested & may_be_one) | must_be_one
}

/// Adjusts `requested` against capability MSR `msr`, switching to its
/// `TRUE_` variant when `IA32_VMX_BASIC` reports one.
pub fn adjust<C: VmxCpu>(msr: Msr, requested: u32) -> u32 {
    let msr = if VmxBasic::read::<C>().vmx_flex_controls {
        msr.true_ctls()
    } else {
        msr
    };
    adjust_controls(msr.read::<C>(), requested)
}

/// Writes the legal value of control `control` derived from `requested`.
/// Returns the value written.
pub fn set_control<C: VmxCpu>(control: VmcsControl32, msr: Msr, requested: u32) -> Result<u32> {
    let value = adjust::<C>(msr, requested);
    let dropped = requested & !value;
    if dropped != 0 {
        warn!(
            "[VMM] {:?}: requested bits {:#x} not allowed by {:?}",
            control, dropped, msr
        );
    }
    trace!("[VMM] {:?} <- {:#x} (requested {:#x})", control, value, requested);
    control.write::<C>(value)?;
    Ok(value)
}

/// Basic information about a VM exit. (SDM Vol. 3C, Section 28.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxExitInfo {
    /// VM-entry failure. (0 = true VM exit; 1 = VM-entry failure)
    pub entry_failure: bool,
    /// Basic exit reason.
    pub basic_reason: u16,
    /// Exit qualification, meaningful for some exit reasons only.
    pub exit_qualification: u64,
    /// For VM exits resulting from instruction execution, this field receives
    /// the length in bytes of the instruction whose execution led to the VM exit.
    pub exit_instruction_length: u32,
    /// Guest `RIP` where the VM exit occurs.
    pub guest_rip: u64,
}

impl VmxExitInfo {
    pub fn exit_reason(&self) -> Option<VmxExitReason> {
        VmxExitReason::try_from(self.basic_reason as u32).ok()
    }
}

pub fn exit_info<C: VmxCpu>() -> Result<VmxExitInfo> {
    let full_reason = VmcsReadOnly32::EXIT_REASON.read::<C>()?;
    Ok(VmxExitInfo {
        entry_failure: full_reason.get_bit(31),
        basic_reason: full_reason.get_bits(0..16) as u16,
        exit_qualification: VmcsReadOnlyNW::EXIT_QUALIFICATION.read::<C>()?,
        exit_instruction_length: VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN.read::<C>()?,
        guest_rip: VmcsGuestNW::RIP.read::<C>()?,
    })
}

/// Exit qualification for I/O instructions. (SDM Vol. 3C, Section 28.2.1, Table 28-5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxIoExitInfo {
    /// Size of access in bytes.
    pub access_size: u8,
    /// Direction of the attempted access.
    pub is_in: bool,
    /// String instruction.
    pub is_string: bool,
    /// REP prefixed.
    pub is_repeat: bool,
    /// Port number.
    pub port: u16,
}

impl VmxIoExitInfo {
    pub fn from_qualification(qualification: u64) -> Self {
        Self {
            access_size: qualification.get_bits(0..3) as u8 + 1,
            is_in: qualification.get_bit(3),
            is_string: qualification.get_bit(4),
            is_repeat: qualification.get_bit(5),
            port: qualification.get_bits(16..32) as u16,
        }
    }
}
