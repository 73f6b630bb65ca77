//! VMCS field encodings.
//!
//! Encoding layout (32-bit):
//!
//! ```text
//!  bit  0      access type (0 = full, 1 = high 32 bits of a 64-bit field)
//!  bits 9:1    index
//!  bits 11:10  type (0 control, 1 read-only data, 2 guest state, 3 host state)
//!  bits 14:13  width (0 16-bit, 1 64-bit, 2 32-bit, 3 natural)
//! ```
//!
//! Bit 12 and bits 31:15 are reserved and must be zero.

/// Bits of an encoding that must be zero.
pub const ENCODING_RESERVED_BITS: u32 = 0xffff_9000;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldWidth {
    Bits16 = 0,
    Bits64 = 1,
    Bits32 = 2,
    Natural = 3,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Control = 0,
    ReadOnly = 1,
    Guest = 2,
    Host = 3,
}

#[inline]
pub const fn width(encoding: u32) -> FieldWidth {
    match (encoding >> 13) & 3 {
        0 => FieldWidth::Bits16,
        1 => FieldWidth::Bits64,
        2 => FieldWidth::Bits32,
        _ => FieldWidth::Natural,
    }
}

#[inline]
pub const fn field_type(encoding: u32) -> FieldType {
    match (encoding >> 10) & 3 {
        0 => FieldType::Control,
        1 => FieldType::ReadOnly,
        2 => FieldType::Guest,
        _ => FieldType::Host,
    }
}

/// Access to the high 32 bits of a 64-bit field.
#[inline]
pub const fn is_high_access(encoding: u32) -> bool {
    encoding & 1 != 0
}

/// Index within the (type, width) group, including the access-type bit.
#[inline]
pub const fn field_index(encoding: u32) -> u32 {
    encoding & 0x3ff
}

/// Group number `width * 4 + type`, used to index the layout table.
#[inline]
pub const fn group(encoding: u32) -> u32 {
    ((encoding >> 13) & 3) * 4 + ((encoding >> 10) & 3)
}

// 16-bit control fields.
pub const VPID: u32 = 0x0000;
pub const EPTP_INDEX: u32 = 0x0004;

// 16-bit guest-state fields.
pub const GUEST_ES_SELECTOR: u32 = 0x0800;
pub const GUEST_CS_SELECTOR: u32 = 0x0802;
pub const GUEST_SS_SELECTOR: u32 = 0x0804;
pub const GUEST_DS_SELECTOR: u32 = 0x0806;
pub const GUEST_FS_SELECTOR: u32 = 0x0808;
pub const GUEST_GS_SELECTOR: u32 = 0x080A;
pub const GUEST_LDTR_SELECTOR: u32 = 0x080C;
pub const GUEST_TR_SELECTOR: u32 = 0x080E;
pub const GUEST_INTERRUPT_STATUS: u32 = 0x0810;
pub const GUEST_PML_INDEX: u32 = 0x0812;

// 16-bit host-state fields.
pub const HOST_ES_SELECTOR: u32 = 0x0C00;
pub const HOST_CS_SELECTOR: u32 = 0x0C02;
pub const HOST_SS_SELECTOR: u32 = 0x0C04;
pub const HOST_DS_SELECTOR: u32 = 0x0C06;
pub const HOST_FS_SELECTOR: u32 = 0x0C08;
pub const HOST_GS_SELECTOR: u32 = 0x0C0A;
pub const HOST_TR_SELECTOR: u32 = 0x0C0C;

// 64-bit control fields.
pub const IO_BITMAP_A: u32 = 0x2000;
pub const IO_BITMAP_B: u32 = 0x2002;
pub const MSR_BITMAPS: u32 = 0x2004;
pub const VMEXIT_MSR_STORE_ADDR: u32 = 0x2006;
pub const VMEXIT_MSR_LOAD_ADDR: u32 = 0x2008;
pub const VMENTRY_MSR_LOAD_ADDR: u32 = 0x200A;
pub const EXECUTIVE_VMCS_PTR: u32 = 0x200C;
pub const PML_ADDRESS: u32 = 0x200E;
pub const TSC_OFFSET: u32 = 0x2010;
pub const VIRTUAL_APIC_PAGE_ADDR: u32 = 0x2012;
pub const APIC_ACCESS_ADDR: u32 = 0x2014;
pub const VMFUNC_CTRLS: u32 = 0x2018;
pub const EPTP: u32 = 0x201A;
pub const EOI_EXIT_BITMAP0: u32 = 0x201C;
pub const EOI_EXIT_BITMAP1: u32 = 0x201E;
pub const EOI_EXIT_BITMAP2: u32 = 0x2020;
pub const EOI_EXIT_BITMAP3: u32 = 0x2022;
pub const EPTP_LIST_ADDRESS: u32 = 0x2024;
pub const VMREAD_BITMAP_ADDR: u32 = 0x2026;
pub const VMWRITE_BITMAP_ADDR: u32 = 0x2028;
pub const VE_INFO_ADDR: u32 = 0x202A;
pub const XSS_EXITING_BITMAP: u32 = 0x202C;
pub const SPPTP: u32 = 0x2030;
pub const TSC_MULTIPLIER: u32 = 0x2032;

// 64-bit read-only data fields.
pub const GUEST_PHYSICAL_ADDR: u32 = 0x2400;

// 64-bit guest-state fields.
pub const VMCS_LINK_POINTER: u32 = 0x2800;
pub const GUEST_IA32_DEBUGCTL: u32 = 0x2802;
pub const GUEST_IA32_PAT: u32 = 0x2804;
pub const GUEST_IA32_EFER: u32 = 0x2806;
pub const GUEST_IA32_PERF_GLOBAL_CTRL: u32 = 0x2808;
pub const GUEST_PDPTE0: u32 = 0x280A;
pub const GUEST_PDPTE1: u32 = 0x280C;
pub const GUEST_PDPTE2: u32 = 0x280E;
pub const GUEST_PDPTE3: u32 = 0x2810;
pub const GUEST_IA32_PKRS: u32 = 0x2818;

// 64-bit host-state fields.
pub const HOST_IA32_PAT: u32 = 0x2C00;
pub const HOST_IA32_EFER: u32 = 0x2C02;
pub const HOST_IA32_PERF_GLOBAL_CTRL: u32 = 0x2C04;
pub const HOST_IA32_PKRS: u32 = 0x2C06;

// 32-bit control fields.
pub const PIN_BASED_CTRLS: u32 = 0x4000;
pub const PROC_BASED_CTRLS: u32 = 0x4002;
pub const EXCEPTION_BITMAP: u32 = 0x4004;
pub const PAGE_FAULT_ERR_CODE_MASK: u32 = 0x4006;
pub const PAGE_FAULT_ERR_CODE_MATCH: u32 = 0x4008;
pub const CR3_TARGET_COUNT: u32 = 0x400A;
pub const VMEXIT_CTRLS: u32 = 0x400C;
pub const VMEXIT_MSR_STORE_COUNT: u32 = 0x400E;
pub const VMEXIT_MSR_LOAD_COUNT: u32 = 0x4010;
pub const VMENTRY_CTRLS: u32 = 0x4012;
pub const VMENTRY_MSR_LOAD_COUNT: u32 = 0x4014;
pub const VMENTRY_INTERRUPTION_INFO: u32 = 0x4016;
pub const VMENTRY_EXCEPTION_ERR_CODE: u32 = 0x4018;
pub const VMENTRY_INSTRUCTION_LENGTH: u32 = 0x401A;
pub const TPR_THRESHOLD: u32 = 0x401C;
pub const SECONDARY_PROC_BASED_CTRLS: u32 = 0x401E;
pub const PAUSE_LOOP_EXITING_GAP: u32 = 0x4020;
pub const PAUSE_LOOP_EXITING_WINDOW: u32 = 0x4022;

// 32-bit read-only data fields.
pub const VM_INSTRUCTION_ERROR: u32 = 0x4400;
pub const VMEXIT_REASON: u32 = 0x4402;
pub const VMEXIT_INTERRUPTION_INFO: u32 = 0x4404;
pub const VMEXIT_INTERRUPTION_ERR_CODE: u32 = 0x4406;
pub const IDT_VECTORING_INFO: u32 = 0x4408;
pub const IDT_VECTORING_ERR_CODE: u32 = 0x440A;
pub const VMEXIT_INSTRUCTION_LENGTH: u32 = 0x440C;
pub const VMEXIT_INSTRUCTION_INFO: u32 = 0x440E;

// 32-bit guest-state fields.
pub const GUEST_ES_LIMIT: u32 = 0x4800;
pub const GUEST_CS_LIMIT: u32 = 0x4802;
pub const GUEST_SS_LIMIT: u32 = 0x4804;
pub const GUEST_DS_LIMIT: u32 = 0x4806;
pub const GUEST_FS_LIMIT: u32 = 0x4808;
pub const GUEST_GS_LIMIT: u32 = 0x480A;
pub const GUEST_LDTR_LIMIT: u32 = 0x480C;
pub const GUEST_TR_LIMIT: u32 = 0x480E;
pub const GUEST_GDTR_LIMIT: u32 = 0x4810;
pub const GUEST_IDTR_LIMIT: u32 = 0x4812;
pub const GUEST_ES_ACCESS_RIGHTS: u32 = 0x4814;
pub const GUEST_CS_ACCESS_RIGHTS: u32 = 0x4816;
pub const GUEST_SS_ACCESS_RIGHTS: u32 = 0x4818;
pub const GUEST_DS_ACCESS_RIGHTS: u32 = 0x481A;
pub const GUEST_FS_ACCESS_RIGHTS: u32 = 0x481C;
pub const GUEST_GS_ACCESS_RIGHTS: u32 = 0x481E;
pub const GUEST_LDTR_ACCESS_RIGHTS: u32 = 0x4820;
pub const GUEST_TR_ACCESS_RIGHTS: u32 = 0x4822;
pub const GUEST_INTERRUPTIBILITY_STATE: u32 = 0x4824;
pub const GUEST_ACTIVITY_STATE: u32 = 0x4826;
pub const GUEST_SMBASE: u32 = 0x4828;
pub const GUEST_IA32_SYSENTER_CS: u32 = 0x482A;
pub const GUEST_PREEMPTION_TIMER_VALUE: u32 = 0x482E;

// 32-bit host-state fields.
pub const HOST_IA32_SYSENTER_CS: u32 = 0x4C00;

// Natural-width control fields.
pub const CR0_GUEST_HOST_MASK: u32 = 0x6000;
pub const CR4_GUEST_HOST_MASK: u32 = 0x6002;
pub const CR0_READ_SHADOW: u32 = 0x6004;
pub const CR4_READ_SHADOW: u32 = 0x6006;
pub const CR3_TARGET0: u32 = 0x6008;
pub const CR3_TARGET1: u32 = 0x600A;
pub const CR3_TARGET2: u32 = 0x600C;
pub const CR3_TARGET3: u32 = 0x600E;

// Natural-width read-only data fields.
pub const VMEXIT_QUALIFICATION: u32 = 0x6400;
pub const IO_RCX: u32 = 0x6402;
pub const IO_RSI: u32 = 0x6404;
pub const IO_RDI: u32 = 0x6406;
pub const IO_RIP: u32 = 0x6408;
pub const GUEST_LINEAR_ADDR: u32 = 0x640A;

// Natural-width guest-state fields.
pub const GUEST_CR0: u32 = 0x6800;
pub const GUEST_CR3: u32 = 0x6802;
pub const GUEST_CR4: u32 = 0x6804;
pub const GUEST_ES_BASE: u32 = 0x6806;
pub const GUEST_CS_BASE: u32 = 0x6808;
pub const GUEST_SS_BASE: u32 = 0x680A;
pub const GUEST_DS_BASE: u32 = 0x680C;
pub const GUEST_FS_BASE: u32 = 0x680E;
pub const GUEST_GS_BASE: u32 = 0x6810;
pub const GUEST_LDTR_BASE: u32 = 0x6812;
pub const GUEST_TR_BASE: u32 = 0x6814;
pub const GUEST_GDTR_BASE: u32 = 0x6816;
pub const GUEST_IDTR_BASE: u32 = 0x6818;
pub const GUEST_DR7: u32 = 0x681A;
pub const GUEST_RSP: u32 = 0x681C;
pub const GUEST_RIP: u32 = 0x681E;
pub const GUEST_RFLAGS: u32 = 0x6820;
pub const GUEST_PENDING_DBG_EXCEPTIONS: u32 = 0x6822;
pub const GUEST_IA32_SYSENTER_ESP: u32 = 0x6824;
pub const GUEST_IA32_SYSENTER_EIP: u32 = 0x6826;
pub const GUEST_IA32_S_CET: u32 = 0x6828;
pub const GUEST_SSP: u32 = 0x682A;
pub const GUEST_INTERRUPT_SSP_TABLE_ADDR: u32 = 0x682C;

// Natural-width host-state fields.
pub const HOST_CR0: u32 = 0x6C00;
pub const HOST_CR3: u32 = 0x6C02;
pub const HOST_CR4: u32 = 0x6C04;
pub const HOST_FS_BASE: u32 = 0x6C06;
pub const HOST_GS_BASE: u32 = 0x6C08;
pub const HOST_TR_BASE: u32 = 0x6C0A;
pub const HOST_GDTR_BASE: u32 = 0x6C0C;
pub const HOST_IDTR_BASE: u32 = 0x6C0E;
pub const HOST_IA32_SYSENTER_ESP: u32 = 0x6C10;
pub const HOST_IA32_SYSENTER_EIP: u32 = 0x6C12;
pub const HOST_RSP: u32 = 0x6C14;
pub const HOST_RIP: u32 = 0x6C16;
pub const HOST_IA32_S_CET: u32 = 0x6C18;
pub const HOST_SSP: u32 = 0x6C1A;
pub const HOST_INTERRUPT_SSP_TABLE_ADDR: u32 = 0x6C1C;

/// Guest selector field of segment `n` (ES=0 .. GS=5, LDTR=6, TR=7).
#[inline]
pub const fn guest_selector(n: usize) -> u32 {
    GUEST_ES_SELECTOR + 2 * n as u32
}

#[inline]
pub const fn guest_limit(n: usize) -> u32 {
    GUEST_ES_LIMIT + 2 * n as u32
}

#[inline]
pub const fn guest_access_rights(n: usize) -> u32 {
    GUEST_ES_ACCESS_RIGHTS + 2 * n as u32
}

#[inline]
pub const fn guest_base(n: usize) -> u32 {
    GUEST_ES_BASE + 2 * n as u32
}

#[inline]
pub const fn host_selector(n: usize) -> u32 {
    HOST_ES_SELECTOR + 2 * n as u32
}

#[inline]
pub const fn guest_pdpte(n: usize) -> u32 {
    GUEST_PDPTE0 + 2 * n as u32
}

/// Guest segment access-rights fields go through the AR format conversion.
#[inline]
pub const fn is_access_rights(encoding: u32) -> bool {
    encoding >= GUEST_ES_ACCESS_RIGHTS && encoding <= GUEST_TR_ACCESS_RIGHTS
}
