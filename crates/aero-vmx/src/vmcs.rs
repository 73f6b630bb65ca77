//! VMCS region layout and width-aware field access.
//!
//! The VMCS is a 4 KiB region of guest-physical memory. Three fixed slots
//! (revision identifier, VMX-abort indicator, launch state) sit at the very
//! start; every other field lives at an offset chosen by [`VmcsLayout`]. The
//! same [`VmcsAccess`] is used for the current VMCS and for the shadow VMCS
//! reached through the link pointer; only the base address differs.

use crate::caps::{IsaFeatures, VmxCapabilities, VmxFeatures};
use crate::error::FatalError;
use crate::fields::{self, FieldWidth};
use crate::memory::PhysicalMemory;

pub const VMCS_REVISION_ID: u32 = 0x2B;
/// Bit 31 of the revision dword marks a shadow VMCS.
pub const VMCS_SHADOW_BIT: u32 = 1 << 31;

pub const VMCS_AREA_SIZE: u32 = 4096;
/// Bytes reserved ahead of the field data for the fixed slots.
pub const VMCS_DATA_OFFSET: u32 = 0x10;

pub const REVISION_ID_OFFSET: u64 = 0x0;
pub const VMX_ABORT_OFFSET: u64 = 0x4;
pub const LAUNCH_STATE_OFFSET: u64 = 0x8;

/// Number of field indices (including the high-access bit) per group.
const FIELDS_PER_GROUP: usize = 0x34;
const GROUPS: usize = 16;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Clear = 0,
    Launched = 1,
}

/// In-memory encoding of the guest segment access-rights fields.
///
/// Both preserve the unusable flag, which lives at bit 16 of the
/// architectural (unpacked) format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArFormat {
    /// Rotated left by 8 so the descriptor attribute byte comes first.
    #[default]
    Rotate,
    /// 16-bit form; the unusable flag is folded into bit 11.
    Pack,
}

impl ArFormat {
    pub const fn pack(self, ar: u32) -> u32 {
        match self {
            ArFormat::Rotate => ar.rotate_left(8),
            ArFormat::Pack => {
                let ar = ar & 0xffff_f7ff;
                let ar = ar | ((ar & 0x0001_0000) >> 5);
                ar & 0x0000_f8ff
            }
        }
    }

    pub const fn unpack(self, ar: u32) -> u32 {
        match self {
            ArFormat::Rotate => ar.rotate_right(8),
            ArFormat::Pack => {
                let ar = ar & 0xfffe_ffff;
                let ar = ar | ((ar & 0x0000_0800) << 5);
                ar & 0x0001_ffff & 0xffff_f0ff
            }
        }
    }
}

/// Field encoding → byte offset map of one VMCS revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmcsLayout {
    revision_id: u32,
    ar_format: ArFormat,
    map: Box<[[Option<u16>; FIELDS_PER_GROUP]; GROUPS]>,
}

impl VmcsLayout {
    /// Every encodable field mapped at `0x10 + (group * 64 + index) * 4`.
    pub fn generic() -> Self {
        let mut map = Box::new([[None; FIELDS_PER_GROUP]; GROUPS]);
        for (group, row) in map.iter_mut().enumerate() {
            for (field, slot) in row.iter_mut().enumerate() {
                let offset = VMCS_DATA_OFFSET as usize + (group * 64 + field) * 4;
                debug_assert!(offset < VMCS_AREA_SIZE as usize);
                *slot = Some(offset as u16);
            }
        }
        Self {
            revision_id: VMCS_REVISION_ID,
            ar_format: ArFormat::default(),
            map,
        }
    }

    /// Generic layout with fields whose controlling extension is absent unmapped.
    pub fn for_capabilities(caps: &VmxCapabilities) -> Self {
        let mut layout = Self::generic();
        for group in 0..GROUPS as u32 {
            for field in 0..FIELDS_PER_GROUP as u32 {
                let encoding = ((group & 0xc) << 11) | ((group & 0x3) << 10) | field;
                if !field_supported(caps, encoding) {
                    layout.clear_mapping(encoding);
                }
            }
        }
        layout
    }

    pub fn with_ar_format(mut self, format: ArFormat) -> Self {
        self.ar_format = format;
        self
    }

    #[inline]
    pub fn revision_id(&self) -> u32 {
        self.revision_id
    }

    #[inline]
    pub fn ar_format(&self) -> ArFormat {
        self.ar_format
    }

    #[inline]
    pub const fn is_reserved(encoding: u32) -> bool {
        encoding & fields::ENCODING_RESERVED_BITS != 0
    }

    /// Byte offset of `encoding` inside the VMCS region, if it is mapped.
    pub fn field_offset(&self, encoding: u32) -> Option<u32> {
        if Self::is_reserved(encoding) {
            return None;
        }
        let field = fields::field_index(encoding) as usize;
        if field >= FIELDS_PER_GROUP {
            return None;
        }
        self.map[fields::group(encoding) as usize][field].map(u32::from)
    }

    #[inline]
    pub fn is_valid(&self, encoding: u32) -> bool {
        self.field_offset(encoding).is_some()
    }

    pub fn set_mapping(&mut self, encoding: u32, offset: Option<u16>) -> bool {
        if Self::is_reserved(encoding) {
            return false;
        }
        let field = fields::field_index(encoding) as usize;
        if field >= FIELDS_PER_GROUP {
            return false;
        }
        self.map[fields::group(encoding) as usize][field] = offset;
        true
    }

    pub fn clear_mapping(&mut self, encoding: u32) -> bool {
        self.set_mapping(encoding, None)
    }
}

impl Default for VmcsLayout {
    fn default() -> Self {
        Self::generic()
    }
}

fn field_supported(caps: &VmxCapabilities, encoding: u32) -> bool {
    use crate::fields::*;

    let wide = width(encoding) == FieldWidth::Bits64;
    if is_high_access(encoding) && !wide {
        return false;
    }
    let full = if wide { encoding & !1 } else { encoding };

    let has = |f: VmxFeatures| caps.supports(f);
    let isa = |f: IsaFeatures| caps.has_isa(f);
    let tpr_shadow = isa(IsaFeatures::LONG_MODE) && has(VmxFeatures::TPR_SHADOW);

    match full {
        VPID => has(VmxFeatures::VPID),
        EPTP_INDEX => has(VmxFeatures::EPT_EXCEPTION),

        GUEST_ES_SELECTOR..=GUEST_TR_SELECTOR => true,
        GUEST_INTERRUPT_STATUS => has(VmxFeatures::VIRTUAL_INTERRUPT_DELIVERY),
        GUEST_PML_INDEX => has(VmxFeatures::PML),
        HOST_ES_SELECTOR..=HOST_TR_SELECTOR => true,

        PIN_BASED_CTRLS..=VMENTRY_INSTRUCTION_LENGTH => true,
        TPR_THRESHOLD => tpr_shadow,
        SECONDARY_PROC_BASED_CTRLS => caps.secondary.allowed1 != 0,
        PAUSE_LOOP_EXITING_GAP | PAUSE_LOOP_EXITING_WINDOW => {
            has(VmxFeatures::PAUSE_LOOP_EXITING)
        }

        VM_INSTRUCTION_ERROR..=VMEXIT_INSTRUCTION_INFO => true,
        GUEST_ES_LIMIT..=GUEST_IA32_SYSENTER_CS => true,
        GUEST_PREEMPTION_TIMER_VALUE => has(VmxFeatures::PREEMPTION_TIMER),
        HOST_IA32_SYSENTER_CS => true,

        IO_BITMAP_A..=EXECUTIVE_VMCS_PTR => true,
        PML_ADDRESS => has(VmxFeatures::PML),
        TSC_OFFSET => true,
        VIRTUAL_APIC_PAGE_ADDR => tpr_shadow,
        APIC_ACCESS_ADDR => has(VmxFeatures::APIC_VIRTUALIZATION),
        VMFUNC_CTRLS => caps.vmfunc != 0,
        EPTP => has(VmxFeatures::EPT),
        EOI_EXIT_BITMAP0..=EOI_EXIT_BITMAP3 => has(VmxFeatures::VIRTUAL_INTERRUPT_DELIVERY),
        EPTP_LIST_ADDRESS => has(VmxFeatures::EPTP_SWITCHING),
        VMREAD_BITMAP_ADDR | VMWRITE_BITMAP_ADDR => has(VmxFeatures::VMCS_SHADOWING),
        VE_INFO_ADDR => has(VmxFeatures::EPT_EXCEPTION),
        XSS_EXITING_BITMAP => isa(IsaFeatures::XSAVES),
        SPPTP => has(VmxFeatures::SPP),
        TSC_MULTIPLIER => has(VmxFeatures::TSC_SCALING),

        GUEST_PHYSICAL_ADDR => has(VmxFeatures::EPT),

        VMCS_LINK_POINTER | GUEST_IA32_DEBUGCTL => true,
        GUEST_IA32_PAT => has(VmxFeatures::PAT),
        GUEST_IA32_EFER => has(VmxFeatures::EFER),
        GUEST_PDPTE0..=GUEST_PDPTE3 => has(VmxFeatures::EPT),
        GUEST_IA32_PKRS => isa(IsaFeatures::PKS),

        HOST_IA32_PAT => has(VmxFeatures::PAT),
        HOST_IA32_EFER => has(VmxFeatures::EFER),
        HOST_IA32_PKRS => isa(IsaFeatures::PKS),

        CR0_GUEST_HOST_MASK..=CR3_TARGET3 => true,
        VMEXIT_QUALIFICATION..=GUEST_LINEAR_ADDR => true,
        GUEST_CR0..=GUEST_IA32_SYSENTER_EIP => true,
        GUEST_IA32_S_CET..=GUEST_INTERRUPT_SSP_TABLE_ADDR => isa(IsaFeatures::CET),
        HOST_CR0..=HOST_RIP => true,
        HOST_IA32_S_CET..=HOST_INTERRUPT_SSP_TABLE_ADDR => isa(IsaFeatures::CET),

        _ => false,
    }
}

/// Width-aware view of one VMCS region.
pub struct VmcsAccess<'a, M: PhysicalMemory + ?Sized> {
    mem: &'a mut M,
    layout: &'a VmcsLayout,
    base: u64,
}

impl<'a, M: PhysicalMemory + ?Sized> VmcsAccess<'a, M> {
    pub fn new(mem: &'a mut M, layout: &'a VmcsLayout, base: u64) -> Self {
        Self { mem, layout, base }
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn layout(&self) -> &VmcsLayout {
        self.layout
    }

    /// The memory (or platform) the region lives in, for non-VMCS accesses.
    #[inline]
    pub fn memory(&mut self) -> &mut M {
        &mut *self.mem
    }

    /// Re-targets the accessor at another region using the same layout.
    pub fn at(&mut self, base: u64) -> VmcsAccess<'_, M> {
        VmcsAccess {
            mem: &mut *self.mem,
            layout: self.layout,
            base,
        }
    }

    fn field_addr(&self, encoding: u32) -> Result<u64, FatalError> {
        match self.layout.field_offset(encoding) {
            Some(offset) if offset < VMCS_AREA_SIZE => Ok(self.base + u64::from(offset)),
            _ => Err(FatalError::UnmappedField { encoding }),
        }
    }

    fn load<const N: usize>(&mut self, paddr: u64) -> [u8; N] {
        let mut buf = [0u8; N];
        match self.mem.backing_slice_mut(paddr, N) {
            Some(host) => buf.copy_from_slice(host),
            None => self.mem.read_bytes(paddr, &mut buf),
        }
        buf
    }

    fn store(&mut self, paddr: u64, src: &[u8]) {
        match self.mem.backing_slice_mut(paddr, src.len()) {
            Some(host) => host.copy_from_slice(src),
            None => self.mem.write_bytes(paddr, src),
        }
        self.mem.invalidate_page(paddr);
    }

    pub fn read16(&mut self, encoding: u32) -> Result<u16, FatalError> {
        let paddr = self.field_addr(encoding)?;
        Ok(u16::from_le_bytes(self.load(paddr)))
    }

    pub fn read32(&mut self, encoding: u32) -> Result<u32, FatalError> {
        let paddr = self.field_addr(encoding)?;
        Ok(u32::from_le_bytes(self.load(paddr)))
    }

    pub fn read64(&mut self, encoding: u32) -> Result<u64, FatalError> {
        let paddr = self.field_addr(encoding)?;
        Ok(u64::from_le_bytes(self.load(paddr)))
    }

    #[inline]
    pub fn read_natural(&mut self, encoding: u32) -> Result<u64, FatalError> {
        self.read64(encoding)
    }

    pub fn write16(&mut self, encoding: u32, value: u16) -> Result<(), FatalError> {
        let paddr = self.field_addr(encoding)?;
        self.store(paddr, &value.to_le_bytes());
        Ok(())
    }

    pub fn write32(&mut self, encoding: u32, value: u32) -> Result<(), FatalError> {
        let paddr = self.field_addr(encoding)?;
        self.store(paddr, &value.to_le_bytes());
        Ok(())
    }

    pub fn write64(&mut self, encoding: u32, value: u64) -> Result<(), FatalError> {
        let paddr = self.field_addr(encoding)?;
        self.store(paddr, &value.to_le_bytes());
        Ok(())
    }

    #[inline]
    pub fn write_natural(&mut self, encoding: u32, value: u64) -> Result<(), FatalError> {
        self.write64(encoding, value)
    }

    /// Guest segment access rights, unpacked to the architectural format.
    pub fn read_access_rights(&mut self, encoding: u32) -> Result<u32, FatalError> {
        let raw = self.read32(encoding)?;
        Ok(self.layout.ar_format().unpack(raw))
    }

    pub fn write_access_rights(&mut self, encoding: u32, ar: u32) -> Result<(), FatalError> {
        let format = self.layout.ar_format();
        match format {
            ArFormat::Pack => self.write16(encoding, format.pack(ar) as u16),
            ArFormat::Rotate => self.write32(encoding, format.pack(ar)),
        }
    }

    /// VMREAD semantics: dispatch on the encoded width.
    pub fn vmread(&mut self, encoding: u32) -> Result<u64, FatalError> {
        match fields::width(encoding) {
            FieldWidth::Bits16 => self.read16(encoding).map(u64::from),
            FieldWidth::Bits32 if fields::is_access_rights(encoding) => {
                self.read_access_rights(encoding).map(u64::from)
            }
            FieldWidth::Bits32 => self.read32(encoding).map(u64::from),
            FieldWidth::Bits64 if fields::is_high_access(encoding) => {
                self.read32(encoding).map(u64::from)
            }
            FieldWidth::Bits64 | FieldWidth::Natural => self.read64(encoding),
        }
    }

    /// VMWRITE semantics: the value is truncated to the encoded width.
    pub fn vmwrite(&mut self, encoding: u32, value: u64) -> Result<(), FatalError> {
        let low = value as u32;
        match fields::width(encoding) {
            FieldWidth::Bits16 => self.write16(encoding, (low & 0xffff) as u16),
            FieldWidth::Bits32 if fields::is_access_rights(encoding) => {
                self.write_access_rights(encoding, low)
            }
            FieldWidth::Bits32 => self.write32(encoding, low),
            FieldWidth::Bits64 if fields::is_high_access(encoding) => self.write32(encoding, low),
            FieldWidth::Bits64 | FieldWidth::Natural => self.write64(encoding, value),
        }
    }

    pub fn revision(&mut self) -> u32 {
        self.mem.read_u32(self.base + REVISION_ID_OFFSET)
    }

    pub fn launch_state(&mut self) -> u32 {
        self.mem.read_u32(self.base + LAUNCH_STATE_OFFSET)
    }

    pub fn set_launch_state(&mut self, state: LaunchState) {
        let paddr = self.base + LAUNCH_STATE_OFFSET;
        self.store(paddr, &(state as u32).to_le_bytes());
    }

    pub fn abort_indicator(&mut self) -> u32 {
        self.mem.read_u32(self.base + VMX_ABORT_OFFSET)
    }

    pub fn set_abort_indicator(&mut self, code: u32) {
        let paddr = self.base + VMX_ABORT_OFFSET;
        self.store(paddr, &code.to_le_bytes());
    }
}
