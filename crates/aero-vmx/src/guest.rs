//! Guest-state area: VM-entry checks and installation into the register file.
//!
//! [`load_check_guest_state`] only reads: it returns a [`GuestState`] snapshot
//! (PDPTEs included) or the reason the entry must fail. The register file is
//! touched by [`install_guest_state`] alone, which is only reached once every
//! control, host-state and guest-state check has passed.

use crate::caps::VmxCapabilities;
use crate::controls::{
    EntryControls, PinControls, ProcControls, SecondaryControls, VmcsCache,
};
use crate::error::{EntryFailureQualification, FatalError, VmEntryError};
use crate::fields;
use crate::host::{is_invalid_cet_control, is_valid_pat};
use crate::memory::PhysicalMemory;
use crate::platform::{EventDelivery, TlbFlush};
use crate::state::{
    ar, cr0, cr4, efer, ActivityState, CpuEvents, DescriptorTable, Inhibit, Segment,
    SegmentCache, VmxCpu, DEBUG_TRAP_HIT, FLAG_IF, FLAG_RESERVED1, FLAG_VM,
};
use crate::vmcs::{VmcsAccess, VMCS_SHADOW_BIT};

/// Guest interruptibility-state bits.
pub mod interruptibility {
    pub const BLOCKED_BY_STI: u32 = 1 << 0;
    pub const BLOCKED_BY_MOV_SS: u32 = 1 << 1;
    pub const BLOCKED_BY_SMI: u32 = 1 << 2;
    pub const BLOCKED_BY_NMI: u32 = 1 << 3;
    pub const MASK: u32 = BLOCKED_BY_STI | BLOCKED_BY_MOV_SS | BLOCKED_BY_SMI | BLOCKED_BY_NMI;
}

/// RFLAGS bits 63:22, 15, 5 and 3 must be zero.
const RFLAGS_RESERVED: u64 = 0xFFFF_FFFF_FFC0_8028;
/// Pending debug exceptions: everything but B3..B0, BS and the enabled-breakpoint bit.
const PENDING_DBG_RESERVED: u64 = 0xFFFF_FFFF_FFFF_AFF0;
/// Bits of CR0 that keep their pre-entry value: ET, NW, CD and the reserved bits.
pub(crate) const KEEP_CR0_BITS: u64 = 0x7FFA_FFD0;
const PDPTE_RESERVED: u64 = 0xFFF0_0000_0000_01E6;
const MC_VECTOR: u8 = 18;

/// VMCS pointers the link-pointer checks compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPointers {
    pub vmcs: u64,
    pub vmxon: u64,
}

/// Every guest-state field of one entry attempt, validated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GuestState {
    pub rflags: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub s_cet: u64,
    pub ssp: u64,
    pub interrupt_ssp_table: u64,
    pub pkrs: u64,

    pub segments: [SegmentCache; 6],
    pub ldtr: SegmentCache,
    pub tr: SegmentCache,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,

    pub debugctl: u64,
    pub smbase: u32,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub sysenter_cs: u32,
    pub pat: u64,
    pub efer: u64,

    pub rip: u64,
    pub rsp: u64,

    pub link_pointer: u64,
    pub pending_dbg_exceptions: u64,
    pub activity_state: u32,
    pub interruptibility_state: u32,
    /// PDPTEs to install for a PAE (non-long-mode) guest with paging.
    pub pdptr: Option<[u64; 4]>,
}

/// Access rights and limit agree on the granularity bit, and no reserved
/// access-rights bit is set.
pub fn limit_ar_consistent(limit: u32, access_rights: u32) -> bool {
    if access_rights & 0xfffe_0f00 != 0 {
        return false;
    }
    if access_rights & ar::G != 0 {
        limit & 0xfff == 0xfff
    } else {
        limit & 0xfff0_0000 == 0
    }
}

fn fail(rule: &'static str) -> VmEntryError {
    tracing::error!("VMENTER FAIL: VMCS guest {rule}");
    VmEntryError::GuestState(EntryFailureQualification::None)
}

fn fail_with(rule: &'static str, qualification: EntryFailureQualification) -> VmEntryError {
    tracing::error!(?qualification, "VMENTER FAIL: VMCS guest {rule}");
    VmEntryError::GuestState(qualification)
}

pub(crate) fn pdptes_valid(caps: &VmxCapabilities, pdptr: &[u64; 4]) -> bool {
    let reserved = caps.phys_addr_reserved_bits() | PDPTE_RESERVED;
    pdptr.iter().all(|&e| e & 1 == 0 || e & reserved == 0)
}

fn read_segment<M: PhysicalMemory + ?Sized>(
    vmcs: &mut VmcsAccess<'_, M>,
    selector: u32,
    base: u32,
    limit: u32,
    access_rights: u32,
) -> Result<SegmentCache, FatalError> {
    Ok(SegmentCache {
        selector: vmcs.read16(selector)?,
        base: vmcs.read_natural(base)?,
        limit: vmcs.read32(limit)?,
        ar: vmcs.read_access_rights(access_rights)?,
    })
}

/// Reads and validates the guest-state area.
///
/// Failures are reported as [`VmEntryError::GuestState`]; the caller turns
/// them into a VM-entry failure exit (reason 33).
pub fn load_check_guest_state<M: PhysicalMemory + ?Sized>(
    vmcs: &mut VmcsAccess<'_, M>,
    caps: &VmxCapabilities,
    cpu: &VmxCpu,
    vm: &VmcsCache,
    pointers: EntryPointers,
) -> Result<GuestState, VmEntryError> {
    let mut guest = GuestState::default();
    let unrestricted = vm.unrestricted_guest();

    guest.rflags = vmcs.read_natural(fields::GUEST_RFLAGS)?;
    if guest.rflags & RFLAGS_RESERVED != 0 {
        return Err(fail("RFLAGS reserved bits are set"));
    }
    if guest.rflags & FLAG_RESERVED1 == 0 {
        return Err(fail("RFLAGS[1] cleared"));
    }

    let v8086_guest = guest.rflags & FLAG_VM != 0;
    let x86_64_guest = vm.entry.contains(EntryControls::IA32E_MODE_GUEST);
    if x86_64_guest && v8086_guest {
        return Err(fail("entry to x86-64 guest with RFLAGS.VM"));
    }

    guest.cr0 = vmcs.read_natural(fields::GUEST_CR0)?;
    if unrestricted {
        if !guest.cr0 & (caps.cr0_fixed0 & !(cr0::PE | cr0::PG)) != 0 {
            return Err(fail("invalid CR0"));
        }
        if guest.cr0 & cr0::PG != 0 && guest.cr0 & cr0::PE == 0 {
            return Err(fail("unrestricted guest CR0.PG without CR0.PE"));
        }
    } else if !guest.cr0 & caps.cr0_fixed0 != 0 {
        return Err(fail("invalid CR0"));
    }
    if guest.cr0 & !caps.cr0_fixed1 != 0 {
        return Err(fail("invalid CR0"));
    }
    let real_mode_guest = guest.cr0 & cr0::PE == 0;

    guest.cr3 = vmcs.read_natural(fields::GUEST_CR3)?;
    if !caps.is_valid_phys_addr(guest.cr3) {
        return Err(fail("invalid CR3"));
    }

    guest.cr4 = vmcs.read_natural(fields::GUEST_CR4)?;
    if !guest.cr4 & caps.cr4_fixed0 != 0 || guest.cr4 & !caps.cr4_fixed1 != 0 {
        tracing::error!(cr4 = guest.cr4, "VMENTER FAIL: VMCS guest invalid CR4");
        return Err(VmEntryError::GuestState(EntryFailureQualification::None));
    }

    if x86_64_guest {
        if guest.cr4 & cr4::PAE == 0 {
            return Err(fail("CR4.PAE=0 in x86-64 mode"));
        }
    } else if guest.cr4 & cr4::PCIDE != 0 {
        return Err(fail("CR4.PCIDE set in 32-bit guest"));
    }

    if vm.entry.contains(EntryControls::LOAD_DEBUG_CONTROLS) {
        guest.dr7 = vmcs.read_natural(fields::GUEST_DR7)?;
        if guest.dr7 >> 32 != 0 {
            return Err(fail("invalid DR7"));
        }
    }

    if guest.cr4 & cr4::CET != 0 && guest.cr0 & cr0::WP == 0 {
        return Err(fail("CR4.CET=1 when CR0.WP=0"));
    }

    if vm.entry.contains(EntryControls::LOAD_CET_STATE) {
        let high_ok = |value: u64| x86_64_guest || value >> 32 == 0;

        guest.s_cet = vmcs.read_natural(fields::GUEST_IA32_S_CET)?;
        if !caps.is_canonical(guest.s_cet) || !high_ok(guest.s_cet) {
            return Err(fail("IA32_S_CET non canonical or invalid"));
        }
        if is_invalid_cet_control(guest.s_cet) {
            return Err(fail("IA32_S_CET invalid"));
        }

        guest.ssp = vmcs.read_natural(fields::GUEST_SSP)?;
        if !caps.is_canonical(guest.ssp) || !high_ok(guest.ssp) {
            return Err(fail("SSP non canonical or invalid"));
        }
        if guest.ssp & 3 != 0 {
            return Err(fail("SSP[1:0] not zero"));
        }

        guest.interrupt_ssp_table = vmcs.read_natural(fields::GUEST_INTERRUPT_SSP_TABLE_ADDR)?;
        if !caps.is_canonical(guest.interrupt_ssp_table) {
            return Err(fail("interrupt SSP table address non canonical"));
        }
    }

    if vm.entry.contains(EntryControls::LOAD_PKRS) {
        guest.pkrs = vmcs.read64(fields::GUEST_IA32_PKRS)?;
        if guest.pkrs >> 32 != 0 {
            return Err(fail("invalid IA32_PKRS value"));
        }
    }

    check_segments(vmcs, caps, &mut guest, vm, v8086_guest, x86_64_guest)?;

    if !v8086_guest {
        let cs = guest.segments[Segment::CS as usize];
        let ss = guest.segments[Segment::SS as usize];
        if !unrestricted {
            if ss.rpl() != cs.rpl() {
                return Err(fail("CS.RPL != SS.RPL"));
            }
            if ss.rpl() != ss.dpl() {
                return Err(fail("SS.RPL <> SS.DPL"));
            }
        } else if (real_mode_guest || cs.seg_type() == ar::TYPE_DATA_RW_ACCESSED) && ss.dpl() != 0 {
            return Err(fail("unrestricted guest SS.DPL != 0"));
        }
    }

    let gdtr_base = vmcs.read_natural(fields::GUEST_GDTR_BASE)?;
    let gdtr_limit = vmcs.read32(fields::GUEST_GDTR_LIMIT)?;
    let idtr_base = vmcs.read_natural(fields::GUEST_IDTR_BASE)?;
    let idtr_limit = vmcs.read32(fields::GUEST_IDTR_LIMIT)?;
    if !caps.is_canonical(gdtr_base) || !caps.is_canonical(idtr_base) {
        return Err(fail("GDTR/IDTR base non canonical"));
    }
    if gdtr_limit > 0xffff || idtr_limit > 0xffff {
        return Err(fail("GDTR/IDTR limit > 0xFFFF"));
    }
    guest.gdtr = DescriptorTable {
        base: gdtr_base,
        limit: gdtr_limit as u16,
    };
    guest.idtr = DescriptorTable {
        base: idtr_base,
        limit: idtr_limit as u16,
    };

    guest.ldtr = read_segment(
        vmcs,
        fields::GUEST_LDTR_SELECTOR,
        fields::GUEST_LDTR_BASE,
        fields::GUEST_LDTR_LIMIT,
        fields::GUEST_LDTR_ACCESS_RIGHTS,
    )?;
    let ldtr = guest.ldtr;
    if ldtr.valid() {
        if ldtr.ti() {
            return Err(fail("LDTR.TI set"));
        }
        if ldtr.seg_type() != ar::TYPE_SYS_LDT {
            tracing::error!(ty = ldtr.seg_type(), "VMENTER FAIL: VMCS guest incorrect LDTR type");
            return Err(VmEntryError::GuestState(EntryFailureQualification::None));
        }
        if ldtr.is_code_or_data() {
            return Err(fail("LDTR is not system segment"));
        }
        if !ldtr.present() {
            return Err(fail("LDTR not present"));
        }
        if !limit_ar_consistent(ldtr.limit, ldtr.ar) {
            return Err(fail("LDTR.AR/LIMIT malformed"));
        }
        if !caps.is_canonical(ldtr.base) {
            return Err(fail("LDTR.BASE non canonical"));
        }
    }

    guest.tr = read_segment(
        vmcs,
        fields::GUEST_TR_SELECTOR,
        fields::GUEST_TR_BASE,
        fields::GUEST_TR_LIMIT,
        fields::GUEST_TR_ACCESS_RIGHTS,
    )?;
    let tr = guest.tr;
    if !caps.is_canonical(tr.base) {
        return Err(fail("TR.BASE non canonical"));
    }
    if !tr.valid() {
        return Err(fail("TR invalid"));
    }
    if tr.ti() {
        return Err(fail("TR.TI set"));
    }
    if tr.is_code_or_data() {
        return Err(fail("TR is not system segment"));
    }
    if !tr.present() {
        return Err(fail("TR not present"));
    }
    if !limit_ar_consistent(tr.limit, tr.ar) {
        return Err(fail("TR.AR/LIMIT malformed"));
    }
    match tr.seg_type() {
        ar::TYPE_SYS_BUSY_386_TSS => {}
        ar::TYPE_SYS_BUSY_286_TSS if !x86_64_guest => {}
        _ => return Err(fail("incorrect TR type")),
    }

    guest.debugctl = vmcs.read64(fields::GUEST_IA32_DEBUGCTL)?;
    guest.smbase = vmcs.read32(fields::GUEST_SMBASE)?;
    guest.sysenter_esp = vmcs.read_natural(fields::GUEST_IA32_SYSENTER_ESP)?;
    guest.sysenter_eip = vmcs.read_natural(fields::GUEST_IA32_SYSENTER_EIP)?;
    guest.sysenter_cs = vmcs.read32(fields::GUEST_IA32_SYSENTER_CS)?;
    if !caps.is_canonical(guest.sysenter_esp) {
        return Err(fail("SYSENTER_ESP non canonical"));
    }
    if !caps.is_canonical(guest.sysenter_eip) {
        return Err(fail("SYSENTER_EIP non canonical"));
    }

    if vm.entry.contains(EntryControls::LOAD_PAT) {
        guest.pat = vmcs.read64(fields::GUEST_IA32_PAT)?;
        if !is_valid_pat(guest.pat) {
            return Err(fail("invalid memory type in IA32_PAT"));
        }
    }

    guest.rip = vmcs.read_natural(fields::GUEST_RIP)?;
    guest.rsp = vmcs.read_natural(fields::GUEST_RSP)?;

    if vm.entry.contains(EntryControls::LOAD_EFER) {
        guest.efer = vmcs.read64(fields::GUEST_IA32_EFER)?;
        if guest.efer & !caps.efer_supported != 0 {
            return Err(fail("EFER reserved bits set"));
        }
        let lme = guest.efer & efer::LME != 0;
        let lma = guest.efer & efer::LMA != 0;
        if lma != x86_64_guest {
            return Err(fail("EFER.LMA doesn't match the IA-32e mode guest control"));
        }
        if lma != lme && guest.cr0 & cr0::PG != 0 {
            tracing::error!(efer = guest.efer, "VMENTER FAIL: VMCS guest EFER inconsistent value");
            return Err(VmEntryError::GuestState(EntryFailureQualification::None));
        }
    }

    if (!x86_64_guest || !guest.segments[Segment::CS as usize].long()) && guest.rip >> 32 != 0 {
        return Err(fail("RIP > 32 bit"));
    }

    check_link_pointer(vmcs, caps, cpu, vm, &mut guest, pointers)?;

    guest.pending_dbg_exceptions = vmcs.read_natural(fields::GUEST_PENDING_DBG_EXCEPTIONS)?;
    if guest.pending_dbg_exceptions & PENDING_DBG_RESERVED != 0 {
        return Err(fail("pending debug exceptions reserved bits"));
    }

    guest.activity_state = vmcs.read32(fields::GUEST_ACTIVITY_STATE)?;
    if guest.activity_state > ActivityState::LAST_VMX {
        tracing::error!(state = guest.activity_state, "VMENTER FAIL: VMCS guest activity state");
        return Err(VmEntryError::GuestState(EntryFailureQualification::None));
    }
    let activity = ActivityState::from_vmcs(guest.activity_state).unwrap_or_default();
    if activity == ActivityState::Hlt && guest.segments[Segment::SS as usize].dpl() != 0 {
        return Err(fail("HLT activity state with SS.DPL != 0"));
    }

    let irq_state = vmcs.read32(fields::GUEST_INTERRUPTIBILITY_STATE)?;
    guest.interruptibility_state = irq_state;
    check_interruptibility(cpu, vm, &guest, activity)?;

    if !x86_64_guest && guest.cr4 & cr4::PAE != 0 && guest.cr0 & cr0::PG != 0 {
        let mut pdptr = [0u64; 4];
        if vm.ept_enabled() {
            for (n, entry) in pdptr.iter_mut().enumerate() {
                *entry = vmcs.read64(fields::guest_pdpte(n))?;
            }
        } else {
            let table = guest.cr3 & 0xffff_ffe0;
            let mem = vmcs.memory();
            for (n, entry) in pdptr.iter_mut().enumerate() {
                *entry = mem.read_u64(table | (n as u64) << 3);
            }
        }
        if !pdptes_valid(caps, &pdptr) {
            return Err(fail_with(
                "PDPTEs checks failed",
                EntryFailureQualification::PdptrLoading,
            ));
        }
        guest.pdptr = Some(pdptr);
    }

    if vm.entry.contains(EntryControls::ENTRY_TO_SMM) {
        tracing::error!("VMENTER: entry to SMM is not implemented");
        return Err(FatalError::SmmEntryUnsupported.into());
    }

    Ok(guest)
}

fn check_segments<M: PhysicalMemory + ?Sized>(
    vmcs: &mut VmcsAccess<'_, M>,
    caps: &VmxCapabilities,
    guest: &mut GuestState,
    vm: &VmcsCache,
    v8086_guest: bool,
    x86_64_guest: bool,
) -> Result<(), VmEntryError> {
    let unrestricted = vm.unrestricted_guest();

    for seg in Segment::ALL {
        let n = seg as usize;
        let sreg = read_segment(
            vmcs,
            fields::guest_selector(n),
            fields::guest_base(n),
            fields::guest_limit(n),
            fields::guest_access_rights(n),
        )?;
        guest.segments[n] = sreg;
        let name = seg.name();

        if v8086_guest {
            if sreg.base != u64::from(sreg.selector) << 4 {
                tracing::error!(segment = name, "VMENTER FAIL: VMCS v8086 guest bad BASE");
                return Err(VmEntryError::GuestState(EntryFailureQualification::None));
            }
            if sreg.limit != 0xffff {
                tracing::error!(segment = name, "VMENTER FAIL: VMCS v8086 guest LIMIT != 0xFFFF");
                return Err(VmEntryError::GuestState(EntryFailureQualification::None));
            }
            // Present, expand-up read/write accessed data, DPL 3.
            if sreg.ar != 0xf3 {
                tracing::error!(segment = name, ar = sreg.ar, "VMENTER FAIL: VMCS v8086 guest AR != 0xF3");
                return Err(VmEntryError::GuestState(EntryFailureQualification::None));
            }
            continue;
        }

        if matches!(seg, Segment::FS | Segment::GS) && !caps.is_canonical(sreg.base) {
            tracing::error!(segment = name, "VMENTER FAIL: VMCS guest BASE non canonical");
            return Err(VmEntryError::GuestState(EntryFailureQualification::None));
        }

        if seg != Segment::CS && !sreg.valid() {
            continue;
        }

        // A null SS is allowed when entering 64-bit code.
        if seg == Segment::SS
            && sreg.selector & 3 == 0
            && x86_64_guest
            && guest.segments[Segment::CS as usize].long()
        {
            continue;
        }

        if matches!(seg, Segment::ES | Segment::CS | Segment::SS | Segment::DS)
            && sreg.base >> 32 != 0
        {
            tracing::error!(segment = name, "VMENTER FAIL: VMCS guest BASE > 32 bit");
            return Err(VmEntryError::GuestState(EntryFailureQualification::None));
        }

        if !sreg.is_code_or_data() {
            tracing::error!(segment = name, "VMENTER FAIL: VMCS guest not segment");
            return Err(VmEntryError::GuestState(EntryFailureQualification::None));
        }
        if !sreg.present() {
            tracing::error!(segment = name, "VMENTER FAIL: VMCS guest not present");
            return Err(VmEntryError::GuestState(EntryFailureQualification::None));
        }
        if !limit_ar_consistent(sreg.limit, sreg.ar) {
            tracing::error!(segment = name, limit = sreg.limit, ar = sreg.ar, "VMENTER FAIL: VMCS guest AR/LIMIT malformed");
            return Err(VmEntryError::GuestState(EntryFailureQualification::None));
        }

        match seg {
            Segment::CS => {
                match sreg.seg_type() {
                    ar::TYPE_CODE_EXEC_ONLY_ACCESSED | ar::TYPE_CODE_EXEC_READ_ACCESSED => {
                        if sreg.rpl() != sreg.dpl() {
                            return Err(fail("non-conforming CS.RPL <> CS.DPL"));
                        }
                    }
                    ar::TYPE_CODE_EXEC_ONLY_CONFORMING_ACCESSED
                    | ar::TYPE_CODE_EXEC_READ_CONFORMING_ACCESSED => {
                        if sreg.rpl() < sreg.dpl() {
                            return Err(fail("conforming CS.RPL < CS.DPL"));
                        }
                    }
                    ar::TYPE_DATA_RW_ACCESSED if unrestricted => {
                        if sreg.dpl() != 0 {
                            return Err(fail("unrestricted guest CS.DPL != 0"));
                        }
                    }
                    _ => return Err(fail("CS.TYPE")),
                }
                if x86_64_guest && sreg.default_big() && sreg.long() {
                    return Err(fail("x86-64 guest wrong CS.D_B/L"));
                }
            }
            Segment::SS => match sreg.seg_type() {
                ar::TYPE_DATA_RW_ACCESSED | ar::TYPE_DATA_RW_EXPAND_DOWN_ACCESSED => {}
                _ => return Err(fail("SS.TYPE")),
            },
            _ => {
                let ty = sreg.seg_type();
                if ty & 1 == 0 {
                    tracing::error!(segment = name, "VMENTER FAIL: VMCS guest not ACCESSED");
                    return Err(VmEntryError::GuestState(EntryFailureQualification::None));
                }
                if ty & 8 != 0 && ty & 2 == 0 {
                    tracing::error!(segment = name, "VMENTER FAIL: VMCS guest CODE segment not READABLE");
                    return Err(VmEntryError::GuestState(EntryFailureQualification::None));
                }
                // Data or non-conforming code segment.
                if !unrestricted && ty < 11 && sreg.rpl() > sreg.dpl() {
                    tracing::error!(segment = name, "VMENTER FAIL: VMCS guest RPL > DPL");
                    return Err(VmEntryError::GuestState(EntryFailureQualification::None));
                }
            }
        }
    }
    Ok(())
}

fn check_link_pointer<M: PhysicalMemory + ?Sized>(
    vmcs: &mut VmcsAccess<'_, M>,
    caps: &VmxCapabilities,
    cpu: &VmxCpu,
    vm: &VmcsCache,
    guest: &mut GuestState,
    pointers: EntryPointers,
) -> Result<(), VmEntryError> {
    use EntryFailureQualification::LinkPointer;

    guest.link_pointer = vmcs.read64(fields::VMCS_LINK_POINTER)?;
    let link = guest.link_pointer;
    if link == u64::MAX {
        return Ok(());
    }

    if !caps.is_valid_page_aligned_phys_addr(link) {
        return Err(fail_with("link pointer malformed", LinkPointer));
    }

    let mut revision = vmcs.memory().read_u32(link);
    if vm.secondary.contains(SecondaryControls::VMCS_SHADOWING) {
        if revision & VMCS_SHADOW_BIT == 0 {
            tracing::error!(revision, "VMFAIL: VMCS link pointer must indicate a shadow VMCS");
            return Err(VmEntryError::GuestState(LinkPointer));
        }
        revision &= !VMCS_SHADOW_BIT;
    }
    if revision != vmcs.layout().revision_id() {
        tracing::error!(revision, "VMFAIL: VMCS link pointer incorrect revision ID");
        return Err(VmEntryError::GuestState(LinkPointer));
    }

    if !cpu.in_smm || vm.entry.contains(EntryControls::ENTRY_TO_SMM) {
        if link == pointers.vmcs {
            return Err(fail_with("link pointer equal to current VMCS pointer", LinkPointer));
        }
    } else if link == pointers.vmxon {
        return Err(fail_with("link pointer equal to VMXON pointer", LinkPointer));
    }
    Ok(())
}

fn check_interruptibility(
    cpu: &VmxCpu,
    vm: &VmcsCache,
    guest: &GuestState,
    activity: ActivityState,
) -> Result<(), VmEntryError> {
    use interruptibility::*;

    let state = guest.interruptibility_state;
    if state & !MASK != 0 {
        return Err(fail("interruptibility state broken"));
    }
    let sti_or_mov_ss = state & (BLOCKED_BY_STI | BLOCKED_BY_MOV_SS);
    if sti_or_mov_ss != 0 && activity != ActivityState::Active {
        return Err(fail("interruptibility state broken when entering non active CPU state"));
    }
    if state & BLOCKED_BY_STI != 0 && state & BLOCKED_BY_MOV_SS != 0 {
        return Err(fail("interruptibility state broken"));
    }
    let if_set = guest.rflags & FLAG_IF != 0;
    if !if_set && state & BLOCKED_BY_STI != 0 {
        return Err(fail("interrupts can't be blocked by STI when EFLAGS.IF = 0"));
    }

    let event = vm.event;
    if event.is_valid() {
        let ty = event.event_type();
        if ty == 0 && (sti_or_mov_ss != 0 || !if_set) {
            return Err(fail("interrupts blocked when injecting external interrupt"));
        }
        if ty == 2 && sti_or_mov_ss != 0 {
            return Err(fail("interrupts blocked when injecting NMI"));
        }
        if activity == ActivityState::WaitForSipi {
            return Err(fail("no interruptions are allowed when entering wait-for-SIPI state"));
        }
        if activity == ActivityState::Shutdown && ty != 2 && event.vector() != MC_VECTOR {
            return Err(fail("only NMI or #MC is allowed when entering shutdown state"));
        }
    }

    if vm.entry.contains(EntryControls::ENTRY_TO_SMM) {
        if state & BLOCKED_BY_SMI == 0 {
            return Err(fail("SMM guest should block SMI"));
        }
        if activity == ActivityState::WaitForSipi {
            return Err(fail("wait-for-SIPI activity state when entering SMM guest"));
        }
    }

    if state & BLOCKED_BY_SMI != 0 && !cpu.in_smm {
        return Err(fail("SMI blocked when not in SMM mode"));
    }
    Ok(())
}

pub(crate) fn broken_cr0(value: u64, unrestricted: bool) -> bool {
    value >> 32 != 0
        || (value & cr0::PG != 0 && value & cr0::PE == 0)
        || (value & cr0::NW != 0 && value & cr0::CD == 0)
        || value & cr0::NE == 0
        || (!unrestricted && (value & cr0::PE == 0 || value & cr0::PG == 0))
}

pub(crate) fn broken_cr4(caps: &VmxCapabilities, value: u64) -> bool {
    value & !caps.cr4_fixed1 != 0 || value & cr4::VMXE == 0
}

/// Installs a validated guest state into the register file.
///
/// Returns a fatal error only if the merged CR0/CR4 would be architecturally
/// broken, which the checks above make impossible for consistent capabilities.
/// Nothing is modified in that case.
pub fn install_guest_state<P: EventDelivery + ?Sized>(
    cpu: &mut VmxCpu,
    guest: &GuestState,
    vm: &mut VmcsCache,
    caps: &VmxCapabilities,
    platform: &mut P,
) -> Result<(), FatalError> {
    let x86_64_guest = vm.ia32e_mode_guest();

    // EFER.LMA/LME before CR4. With CR0.PG=0 and neither "IA-32e mode guest"
    // nor "load IA32_EFER", EFER.LME keeps its host value.
    let new_efer = if vm.entry.contains(EntryControls::LOAD_EFER) {
        guest.efer
    } else if x86_64_guest {
        cpu.efer | efer::LME | efer::LMA
    } else if guest.cr0 & cr0::PG != 0 {
        cpu.efer & !(efer::LME | efer::LMA)
    } else {
        cpu.efer & !efer::LMA
    };

    let new_cr0 = (cpu.cr0 & KEEP_CR0_BITS) | (guest.cr0 & !KEEP_CR0_BITS);
    if broken_cr0(new_cr0, vm.unrestricted_guest()) {
        tracing::error!(cr0 = new_cr0, "VMENTER: CR0 is broken");
        return Err(FatalError::BrokenControlRegister {
            register: "CR0",
            value: new_cr0,
        });
    }
    if broken_cr4(caps, guest.cr4) {
        tracing::error!(cr4 = guest.cr4, "VMENTER: CR4 is broken");
        return Err(FatalError::BrokenControlRegister {
            register: "CR4",
            value: guest.cr4,
        });
    }

    cpu.efer = new_efer;
    cpu.cr0 = new_cr0;
    cpu.cr4 = guest.cr4;
    cpu.cr3 = guest.cr3;

    if let Some(pdptr) = guest.pdptr {
        cpu.pdptr = pdptr;
    }

    if vm.entry.contains(EntryControls::LOAD_DEBUG_CONTROLS) {
        // Bits 15:14 always clear, bit 10 always set.
        cpu.dr7 = (guest.dr7 & !0xc000) | 0x400;
        cpu.msr.debugctl = guest.debugctl;
    }

    cpu.rip = guest.rip;
    cpu.prev_rip = guest.rip;
    cpu.rsp = guest.rsp;
    cpu.prev_rsp = guest.rsp;

    if vm.entry.contains(EntryControls::LOAD_CET_STATE) {
        cpu.ssp = guest.ssp;
        cpu.prev_ssp = guest.ssp;
        cpu.msr.interrupt_ssp_table = guest.interrupt_ssp_table;
        cpu.msr.s_cet = guest.s_cet;
    }
    if vm.entry.contains(EntryControls::LOAD_PKRS) {
        cpu.msr.pkrs = guest.pkrs as u32;
    }

    cpu.rflags = guest.rflags;
    cpu.segments = guest.segments;
    cpu.gdtr = guest.gdtr;
    cpu.idtr = guest.idtr;
    cpu.ldtr = guest.ldtr;
    cpu.tr = guest.tr;

    cpu.msr.sysenter_esp = guest.sysenter_esp;
    cpu.msr.sysenter_eip = guest.sysenter_eip;
    cpu.msr.sysenter_cs = guest.sysenter_cs;
    if vm.entry.contains(EntryControls::LOAD_PAT) {
        cpu.msr.pat = guest.pat;
    }
    vm.ple.first_pause_time = 0;
    vm.ple.last_pause_time = 0;
    vm.link_pointer = guest.link_pointer;

    let mut activity = ActivityState::from_vmcs(guest.activity_state).unwrap_or_default();
    let state = guest.interruptibility_state;
    if vm.event.is_valid() {
        cpu.inhibit = Inhibit::None;
        cpu.debug_trap = 0;
        activity = ActivityState::Active;
    } else {
        let pending = guest.pending_dbg_exceptions as u32;
        cpu.debug_trap = if pending & (1 << 12) != 0 {
            pending & 0x0000_400f
        } else {
            pending & 0x0000_4000
        };
        if cpu.debug_trap != 0 {
            cpu.debug_trap |= DEBUG_TRAP_HIT;
        }

        cpu.inhibit = if state & interruptibility::BLOCKED_BY_STI != 0 {
            Inhibit::Interrupts
        } else if state & interruptibility::BLOCKED_BY_MOV_SS != 0 {
            Inhibit::MovSs
        } else {
            Inhibit::None
        };
    }

    cpu.unmask_event(CpuEvents::VMX_VIRTUAL_NMI | CpuEvents::NMI);
    if state & interruptibility::BLOCKED_BY_NMI != 0 {
        if vm.pin.contains(PinControls::VIRTUAL_NMI) {
            cpu.mask_event(CpuEvents::VMX_VIRTUAL_NMI);
        } else {
            cpu.mask_event(CpuEvents::NMI);
        }
    }

    // The MTF exit becomes deliverable once the first guest instruction retires.
    if vm.proc.contains(ProcControls::MONITOR_TRAP_FLAG) {
        cpu.signal_event(CpuEvents::VMX_MONITOR_TRAP_FLAG);
        cpu.mask_event(CpuEvents::VMX_MONITOR_TRAP_FLAG);
    }
    if vm.proc.contains(ProcControls::NMI_WINDOW_EXITING) {
        cpu.signal_event(CpuEvents::VMX_VIRTUAL_NMI);
    }
    if vm.proc.contains(ProcControls::INTERRUPT_WINDOW_EXITING) {
        cpu.signal_event(CpuEvents::VMX_INTERRUPT_WINDOW_EXITING);
    }

    cpu.monitor_armed = false;
    platform.flush_tlb(TlbFlush::All);

    if activity != ActivityState::Active {
        tracing::debug!(?activity, "VM entry to non-active CPU state");
        cpu.activity = activity;
        platform.enter_sleep_state(cpu, activity);
    } else {
        cpu.activity = ActivityState::Active;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn flat_segments_are_consistent() {
        assert!(limit_ar_consistent(0xffff_ffff, 0xc09b));
        assert!(limit_ar_consistent(0xffff, 0x93));
        assert!(!limit_ar_consistent(0xffff, 0x8093));
        assert!(!limit_ar_consistent(0x0010_0000, 0x93));
        // Bits 11:8 of the access rights are reserved.
        assert!(!limit_ar_consistent(0xffff, 0x193));
    }

    #[test]
    fn pdpte_reserved_bits_only_matter_when_present() {
        let caps = VmxCapabilities::default();
        assert!(pdptes_valid(&caps, &[0x1001, 0x2001, 0, 0x3000 | 0x80]));
        assert!(!pdptes_valid(&caps, &[0x1001 | 0x80, 0, 0, 0]));
        assert!(!pdptes_valid(&caps, &[(1 << 45) | 1, 0, 0, 0]));
    }

    #[test]
    fn broken_cr0_combinations() {
        let base = cr0::PE | cr0::NE | cr0::PG;
        assert!(!broken_cr0(base, false));
        assert!(broken_cr0(base | cr0::NW, false));
        assert!(!broken_cr0(base | cr0::NW | cr0::CD, false));
        assert!(broken_cr0(cr0::NE, false));
        assert!(!broken_cr0(cr0::NE, true));
        assert!(broken_cr0(cr0::NE | cr0::PG, true));
    }

    proptest! {
        #[test]
        fn granularity_law(limit in any::<u32>(), ar_low in 0u32..0x100, g in any::<bool>()) {
            let access_rights = ar_low | if g { ar::G } else { 0 };
            let ok = limit_ar_consistent(limit, access_rights);
            if g && limit & 0xfff != 0xfff {
                prop_assert!(!ok);
            }
            if !g && limit & 0xfff0_0000 != 0 {
                prop_assert!(!ok);
            }
            if (g && limit & 0xfff == 0xfff) || (!g && limit & 0xfff0_0000 == 0) {
                prop_assert!(ok);
            }
        }
    }
}
