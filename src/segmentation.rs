use bit_field::BitField;
use bitflags::bitflags;
use x86::segmentation::SegmentSelector;

use crate::uapi::KvmSegment;

bitflags! {
    /// Access rights for VMCS guest register states.
    ///
    /// The low byte matches bits 40..48 of a segment descriptor and bits
    /// 12..16 match descriptor bits 52..56; bit 16 marks the segment unusable.
    /// (SDM Vol. 3C, Section 24.4.1, Table 24-2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentAccessRights: u32 {
        /// Accessed flag.
        const ACCESSED          = 1 << 0;
        /// For data segments, this flag sets the segment as writable. For code
        /// segments, this flag sets the segment as readable.
        const WRITABLE          = 1 << 1;
        /// For data segments, this flag marks a data segment as “expansion-direction”.
        /// For code segments, this flag marks a code segment as “conforming”.
        const CONFORMING        = 1 << 2;
        /// This flag must be set for code segments.
        const EXECUTABLE        = 1 << 3;
        /// S: Descriptor type (0 = system; 1 = code or data)
        const CODE_DATA         = 1 << 4;
        /// P: Segment present
        const PRESENT           = 1 << 7;
        /// AVL: Available for use by system software
        const AVAILABLE         = 1 << 12;
        /// L: 64-bit mode active (for CS only)
        const LONG_MODE         = 1 << 13;
        /// D/B: Default operation size (0 = 16-bit segment; 1 = 32-bit segment)
        const DB                = 1 << 14;
        /// G: Granularity
        const GRANULARITY       = 1 << 15;
        /// Segment unusable (0 = usable; 1 = unusable)
        const UNUSABLE          = 1 << 16;

        /// TSS (Available) for 32/64-bit
        const TSS_AVAIL         = 0b1001;
        /// TSS (Busy) for 32/64-bit
        const TSS_BUSY          = 0b1011;

        /// Descriptor privilege level (DPL)
        const DPL_RANGE         = 0b11 << 5;
        /// Segment type mask
        const TYPE_MASK         = 0b1111;
    }
}

impl SegmentAccessRights {
    /// Descriptor privilege level.
    pub fn dpl(&self) -> u8 {
        self.bits().get_bits(5..=6) as u8
    }

    /// The 4-bit segment type.
    pub fn type_field(&self) -> u8 {
        self.bits().get_bits(0..4) as u8
    }

    /// Extract the access rights from a packed segment descriptor.
    pub fn from_descriptor(desc: u64) -> Self {
        Self::from_bits_truncate(desc.get_bits(40..56) as u32 & 0xf0ff)
    }

    /// Encode the unpacked fields of a [`KvmSegment`].
    pub fn from_kvm(seg: &KvmSegment) -> Self {
        let mut bits = 0u32;
        bits.set_bits(0..4, seg.type_ as u32 & 0xf);
        bits.set_bit(4, seg.s != 0);
        bits.set_bits(5..=6, seg.dpl as u32 & 0b11);
        bits.set_bit(7, seg.present != 0);
        bits.set_bit(12, seg.avl != 0);
        bits.set_bit(13, seg.l != 0);
        bits.set_bit(14, seg.db != 0);
        bits.set_bit(15, seg.g != 0);
        // A non-present segment is unusable to VMX regardless of the flag.
        bits.set_bit(16, seg.unusable != 0 || seg.present == 0);
        Self::from_bits_truncate(bits)
    }

    /// Decode into the unpacked fields of `seg`, leaving its base, limit and
    /// selector untouched.
    pub fn fill_kvm(&self, seg: &mut KvmSegment) {
        let bits = self.bits();
        seg.type_ = self.type_field();
        seg.s = bits.get_bit(4) as u8;
        seg.dpl = self.dpl();
        seg.present = bits.get_bit(7) as u8;
        seg.avl = bits.get_bit(12) as u8;
        seg.l = bits.get_bit(13) as u8;
        seg.db = bits.get_bit(14) as u8;
        seg.g = bits.get_bit(15) as u8;
        seg.unusable = bits.get_bit(16) as u8;
    }
}

/// A segment register as seen by the VMCS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: SegmentSelector,
    pub base: u64,
    pub limit: u32,
    pub access_rights: SegmentAccessRights,
}

impl Segment {
    pub const fn invalid() -> Self {
        Self {
            selector: SegmentSelector::from_raw(0),
            base: 0,
            limit: 0,
            access_rights: SegmentAccessRights::UNUSABLE,
        }
    }

    /// Decode the segment `selector` refers to in the descriptor table `gdt`.
    /// A null or out-of-table selector gives an unusable segment.
    pub fn from_selector(selector: SegmentSelector, gdt: &[u64]) -> Self {
        let index = selector.index() as usize;
        if index == 0 || index >= gdt.len() {
            return Self {
                selector,
                ..Self::invalid()
            };
        }
        let entry = gdt[index];
        let access_rights = SegmentAccessRights::from_descriptor(entry);

        let mut base = entry.get_bits(16..40) | entry.get_bits(56..64) << 24;
        let mut limit = entry.get_bits(0..16) | entry.get_bits(48..52) << 16;
        if !access_rights.contains(SegmentAccessRights::CODE_DATA) && index + 1 < gdt.len() {
            // System descriptors (TSS, LDT) take two slots in long mode.
            base |= gdt[index + 1].get_bits(0..32) << 32;
        }
        if access_rights.contains(SegmentAccessRights::GRANULARITY) {
            limit = (limit << 12) | 0xfff;
        }
        Self {
            selector,
            base,
            limit: limit as u32,
            access_rights,
        }
    }

    pub fn from_kvm(seg: &KvmSegment) -> Self {
        Self {
            selector: SegmentSelector::from_raw(seg.selector),
            base: seg.base,
            limit: seg.limit,
            access_rights: SegmentAccessRights::from_kvm(seg),
        }
    }

    pub fn to_kvm(&self) -> KvmSegment {
        let mut seg = KvmSegment {
            base: self.base,
            limit: self.limit,
            selector: self.selector.bits(),
            ..Default::default()
        };
        self.access_rights.fill_kvm(&mut seg);
        seg
    }
}
